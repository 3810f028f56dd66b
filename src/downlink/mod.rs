//! Downlink path
//!
//! Downlinks are produced by per-device tasks. A task fires when an uplink
//! opened receive windows, when an application queued a downlink, or when
//! a class B/C attempt is due again.

/// Downlink path candidates from uplink metadata
pub mod paths;

/// Join-accept and data downlink construction
pub mod process;

/// Handing downlinks to Gateway Servers
pub mod scheduler;

/// Per-device downlink task queue
pub mod task_queue;
