//! # ubd Mediation Engine
//!
//! Purpose: Mediate between block-request producers and a user-space driver
//! session. Producers submit requests against a device; the attached session
//! pulls them as items over a bounded slot table, replies complete the
//! originating requests with sanitised statuses, and a process-wide
//! coordinator owns device lifecycle, driver handover, and destruction.
//!
//! ## Design Principles
//! 1. **Inverted Control**: The callee-driver pattern becomes a pull queue;
//!    the consumer asks for work instead of being called.
//! 2. **Bounded State**: Every device has a fixed slot table; handles are
//!    `(index, seqnum)` pairs so stale replies are detectable and dropped.
//! 3. **Non-Blocking Producers**: Submit, timeout, and completion paths never
//!    sleep; only the consumer pull and lifecycle waits block.
//! 4. **Errno Discipline**: Every failure surfaces as one errno value through
//!    a fixed, documented mapping.

pub mod completion;
pub mod control;
pub mod device;
pub mod disk;
pub mod inverter;
pub mod request;
pub mod transceiver;

pub use control::{ClientSession, Core, CoreConfig};
pub use device::{Device, DeviceState};
pub use disk::{DevNum, DiskRegistry};
pub use inverter::{CompletionTicket, Inverter, ItemTicket, SlotCounts, TimeoutDecision};
pub use request::{BlockRequest, ReqOp, RequestHandle, RequestResult};
pub use transceiver::Transceiver;
