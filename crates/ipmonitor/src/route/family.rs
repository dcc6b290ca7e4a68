//! Address family abstraction for the route engine.
//!
//! The merge, lookup, finalize and apply algorithms are written once over
//! [`AddressFamily`]; [`Ipv4`] and [`Ipv6`] supply the address arithmetic.

use ipmon_types::{IpAddress, Ipv4Address, Ipv6Address};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Address family tag for publication and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Family {
    #[serde(rename = "IPv4")]
    Ipv4,
    #[serde(rename = "IPv6")]
    Ipv6,
}

impl Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::Ipv4 => f.write_str("IPv4"),
            Family::Ipv6 => f.write_str("IPv6"),
        }
    }
}

/// Family-specific operations used by [`RouteList`](super::RouteList).
pub trait AddressFamily: Debug + Clone + Copy + PartialEq + Eq + Send + Sync + 'static {
    /// Address type of this family.
    type Addr: Debug
        + Display
        + Clone
        + Copy
        + PartialEq
        + Eq
        + Ord
        + Hash
        + Default
        + Serialize
        + Send
        + Sync
        + 'static;

    const FAMILY: Family;
    /// Human readable family name ("IPv4" / "IPv6").
    const NAME: &'static str;
    /// Single character label used in log lines.
    const LABEL: char;
    /// Number of bits in an address.
    const ALL_BITS: u8;
    /// Whether routes flagged kernel-managed are never written.
    const SKIPS_KERNEL_MANAGED: bool;
    /// Whether the default route is left alone on netboot systems.
    const NETBOOT_PROTECTS_DEFAULT: bool;

    /// Compares two destinations in network byte order.
    fn compare(a: &Self::Addr, b: &Self::Addr) -> Ordering {
        a.cmp(b)
    }

    /// Returns `addr` with only the leading `prefix_length` bits kept.
    fn masked(addr: &Self::Addr, prefix_length: u8) -> Self::Addr;

    /// Returns true if `addr` lies in `dest/prefix_length`.
    fn same_subnet(dest: &Self::Addr, prefix_length: u8, addr: &Self::Addr) -> bool {
        Self::masked(addr, prefix_length) == *dest
    }

    fn is_unspecified(addr: &Self::Addr) -> bool;

    /// Returns the scope id the kernel needs alongside `addr`, if any.
    fn scope_id(_addr: &Self::Addr, _ifindex: u32) -> Option<u32> {
        None
    }

    /// Converts an address into its kernel representation.
    fn to_ip_address(addr: &Self::Addr) -> IpAddress;

    /// Returns the netmask for a prefix length.
    fn netmask(prefix_length: u8) -> IpAddress;
}

/// IPv4 marker type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ipv4;

impl AddressFamily for Ipv4 {
    type Addr = Ipv4Address;

    const FAMILY: Family = Family::Ipv4;
    const NAME: &'static str = "IPv4";
    const LABEL: char = '4';
    const ALL_BITS: u8 = 32;
    const SKIPS_KERNEL_MANAGED: bool = false;
    const NETBOOT_PROTECTS_DEFAULT: bool = true;

    fn masked(addr: &Ipv4Address, prefix_length: u8) -> Ipv4Address {
        addr.masked(prefix_length)
    }

    fn is_unspecified(addr: &Ipv4Address) -> bool {
        addr.is_unspecified()
    }

    fn to_ip_address(addr: &Ipv4Address) -> IpAddress {
        IpAddress::V4(*addr)
    }

    fn netmask(prefix_length: u8) -> IpAddress {
        IpAddress::V4(Ipv4Address::from_prefix_len(prefix_length))
    }
}

/// IPv6 marker type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ipv6;

impl AddressFamily for Ipv6 {
    type Addr = Ipv6Address;

    const FAMILY: Family = Family::Ipv6;
    const NAME: &'static str = "IPv6";
    const LABEL: char = '6';
    const ALL_BITS: u8 = 128;
    const SKIPS_KERNEL_MANAGED: bool = true;
    const NETBOOT_PROTECTS_DEFAULT: bool = false;

    fn masked(addr: &Ipv6Address, prefix_length: u8) -> Ipv6Address {
        addr.masked(prefix_length)
    }

    fn is_unspecified(addr: &Ipv6Address) -> bool {
        addr.is_unspecified()
    }

    fn scope_id(addr: &Ipv6Address, ifindex: u32) -> Option<u32> {
        addr.is_link_local().then_some(ifindex)
    }

    fn to_ip_address(addr: &Ipv6Address) -> IpAddress {
        IpAddress::V6(*addr)
    }

    fn netmask(prefix_length: u8) -> IpAddress {
        IpAddress::V6(Ipv6Address::from_prefix_len(prefix_length))
    }
}
