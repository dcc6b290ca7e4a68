//! Daemon plumbing around the reconciler.
//!
//! Configuration and interface rank events arrive on a channel, are
//! coalesced by [`ChangeQueue`] and processed in batches by a single
//! [`Monitor`] task.

mod consumer;
mod monitor;

pub use consumer::{ChangeQueue, ServiceOp};
pub use monitor::{Monitor, MonitorEvent, MonitorHandle, MonitorSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("monitor worker is not running")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, DaemonError>;
