//! Primary service election and route reconciliation.
//!
//! Each configured network service is turned into a per-family route
//! candidate. Candidates are ranked, the best one becomes the primary
//! service of its family, and the merged route table is diffed against
//! what is installed in the kernel.
//!
//! ```text
//! config -> builder -> election -> route diff -> kernel
//!                          |
//!                          +-> publisher / notifier
//! ```

pub mod assertions;
pub mod builder;
pub mod config;
pub mod daemon;
pub mod election;
pub mod kernel;
pub mod reconcile;
pub mod route;

pub use daemon::{Monitor, MonitorHandle};
