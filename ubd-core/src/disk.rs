//! Process-local registry of block special nodes.
//!
//! Stands in for the system device namespace: the disk-adder publishes
//! `ubd-<id>` nodes here, `path_to_id` resolves against it, and embedders
//! may register foreign nodes (other majors, non-block nodes) of their own.

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;

/// Major number under which ubd block devices are registered.
pub const UBD_MAJOR: u32 = 254;

/// A device number: the `(major, minor)` pair behind a special node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevNum {
    /// Driver major number.
    pub major: u32,
    /// Minor number within the major.
    pub minor: u32,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    devnum: DevNum,
    is_block: bool,
}

/// The node table. One per `Core`.
#[derive(Debug)]
pub struct DiskRegistry {
    major: u32,
    nodes: Mutex<HashMap<String, Node, RandomState>>,
}

impl DiskRegistry {
    /// Creates a registry using the reserved ubd major.
    pub fn new() -> Self {
        DiskRegistry::with_major(UBD_MAJOR)
    }

    /// Creates a registry with an explicit major.
    pub fn with_major(major: u32) -> Self {
        DiskRegistry {
            major,
            nodes: Mutex::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    /// The major number ubd devices resolve under.
    pub fn major(&self) -> u32 {
        self.major
    }

    /// Publishes a block node. Replaces any previous node of the same name.
    pub fn insert_block(&self, name: &str, devnum: DevNum) {
        self.nodes.lock().insert(
            name.to_owned(),
            Node {
                devnum,
                is_block: true,
            },
        );
    }

    /// Publishes a non-block node (embedder-provided).
    pub fn insert_char(&self, name: &str, devnum: DevNum) {
        self.nodes.lock().insert(
            name.to_owned(),
            Node {
                devnum,
                is_block: false,
            },
        );
    }

    /// Removes a node. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.nodes.lock().remove(name).is_some()
    }

    /// Resolves a path to `(devnum, is_block)`.
    ///
    /// Accepts either a bare node name or a `/dev/`-prefixed path.
    pub fn resolve(&self, path: &str) -> Option<(DevNum, bool)> {
        let name = path.strip_prefix("/dev/").unwrap_or(path);
        let nodes = self.nodes.lock();
        nodes.get(name).map(|node| (node.devnum, node.is_block))
    }
}

impl Default for DiskRegistry {
    fn default() -> Self {
        DiskRegistry::new()
    }
}
