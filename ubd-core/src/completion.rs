//! Counted completion primitive for consumer wakeups.
//!
//! A `Completion` carries either a count of pending wakeups (one per item
//! made ready) or a sticky "completed forever" state used by deactivation
//! and termination, where every future wait must pass immediately.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct CompletionState {
    count: u64,
    forever: bool,
}

/// A counting completion with a sticky complete-all mode.
#[derive(Debug)]
pub struct Completion {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

impl Completion {
    /// Creates a completion with no pending wakeups.
    pub fn new() -> Self {
        Completion {
            state: Mutex::new(CompletionState {
                count: 0,
                forever: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Adds one wakeup and releases a single waiter.
    pub fn complete_one(&self) {
        let mut state = self.state.lock();
        state.count = state.count.saturating_add(1);
        self.cond.notify_one();
    }

    /// Makes every current and future wait pass immediately.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        state.forever = true;
        self.cond.notify_all();
    }

    /// Clears both the count and the sticky state.
    pub fn reinit(&self) {
        let mut state = self.state.lock();
        state.count = 0;
        state.forever = false;
    }

    /// Blocks until a wakeup is available, consuming it unless sticky.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while state.count == 0 && !state.forever {
            self.cond.wait(&mut state);
        }
        if !state.forever {
            state.count -= 1;
        }
    }

    /// Like `wait`, but gives up after `timeout`.
    ///
    /// Returns true when a wakeup was consumed (or the completion is sticky),
    /// false on expiry.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.count == 0 && !state.forever {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
        if !state.forever {
            state.count -= 1;
        }
        true
    }
}

impl Default for Completion {
    fn default() -> Self {
        Completion::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_consumes_one_count() {
        let completion = Completion::new();
        completion.complete_one();
        completion.complete_one();
        completion.wait();
        completion.wait();
        assert!(!completion.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn complete_all_is_sticky() {
        let completion = Completion::new();
        completion.complete_all();
        completion.wait();
        completion.wait();
        assert!(completion.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn reinit_clears_sticky_state() {
        let completion = Completion::new();
        completion.complete_all();
        completion.reinit();
        assert!(!completion.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn wakes_blocked_waiter() {
        let completion = Arc::new(Completion::new());
        let waiter = Arc::clone(&completion);

        let join = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(5));
        completion.complete_one();
        join.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let completion = Completion::new();
        assert!(!completion.wait_timeout(Duration::from_millis(5)));
    }
}
