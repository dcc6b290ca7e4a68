//! Route engine.
//!
//! This module owns the ranked route table shared by every network service:
//! - [`RouteList`] merges per-service routes into one aggregate table
//! - [`RouteList::finalize`] resolves routes that must avoid an interface
//! - [`RouteList::apply`] diffs two tables and programs the kernel
//!
//! The algorithms are generic over [`AddressFamily`] so IPv4 and IPv6 share
//! one implementation.

mod apply;
mod family;
mod list;
mod types;

pub use apply::{KernelRouteWriter, MAX_RECURSE_DEPTH};
pub use family::{AddressFamily, Family, Ipv4, Ipv6};
pub use list::{LookupMode, RouteList};
pub use types::{ControlFlags, Route, RouteFlags, RouteListFlags};
pub(crate) use types::flag_ops;

/// IPv4 route.
pub type Ipv4Route = Route<Ipv4>;
/// IPv6 route.
pub type Ipv6Route = Route<Ipv6>;
/// IPv4 route list.
pub type Ipv4RouteList = RouteList<Ipv4>;
/// IPv6 route list.
pub type Ipv6RouteList = RouteList<Ipv6>;
