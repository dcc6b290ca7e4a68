//! Common types for the ipmonitor route election daemon.
//!
//! This crate provides type-safe representations of the primitives shared
//! by the route engine, the election and the reconciler:
//!
//! - [`Ipv4Address`], [`Ipv6Address`]: addresses with mask and prefix arithmetic
//! - [`IpAddress`]: family-independent address
//! - [`Rank`], [`RankAssertion`]: packed service rank used by every comparison
//! - [`ServiceId`]: opaque network service identifier

mod ip;
mod rank;
mod service;

pub use ip::{IpAddress, Ipv4Address, Ipv6Address};
pub use rank::{Rank, RankAssertion};
pub use service::ServiceId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid subnet mask: {0}")]
    InvalidSubnetMask(String),

    #[error("invalid rank assertion: {0}")]
    InvalidRankAssertion(String),
}
