//! IP address and prefix types with mask arithmetic.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IPv4 address wrapper with subnet-mask utilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ipv4Address(Ipv4Addr);

impl Ipv4Address {
    pub const UNSPECIFIED: Self = Ipv4Address(Ipv4Addr::UNSPECIFIED);
    pub const BROADCAST: Self = Ipv4Address(Ipv4Addr::BROADCAST);
    pub const LOCALHOST: Self = Ipv4Address(Ipv4Addr::LOCALHOST);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Address(Ipv4Addr::new(a, b, c, d))
    }

    pub const fn octets(&self) -> [u8; 4] {
        self.0.octets()
    }

    /// Returns the address as a host-order integer.
    pub fn to_bits(&self) -> u32 {
        u32::from(self.0)
    }

    /// Builds an address from a host-order integer.
    pub fn from_bits(bits: u32) -> Self {
        Ipv4Address(Ipv4Addr::from(bits))
    }

    /// Returns true for 0.0.0.0.
    pub fn is_unspecified(&self) -> bool {
        self.0.is_unspecified()
    }

    /// Returns the subnet mask for a prefix length.
    ///
    /// A prefix length of 0 or above 32 yields 0.0.0.0.
    pub fn from_prefix_len(prefix_len: u8) -> Self {
        if prefix_len == 0 || prefix_len > 32 {
            return Self::UNSPECIFIED;
        }
        Self::from_bits(u32::MAX << (32 - u32::from(prefix_len)))
    }

    /// Interprets this address as a subnet mask and returns its prefix length.
    ///
    /// # Errors
    ///
    /// Returns an error if the set bits are not contiguous from the top.
    pub fn mask_prefix_len(&self) -> Result<u8, ParseError> {
        let bits = self.to_bits();
        let len = bits.leading_ones() as u8;
        if Self::from_prefix_len(len).to_bits() != bits {
            return Err(ParseError::InvalidSubnetMask(self.to_string()));
        }
        Ok(len)
    }

    /// Returns this address with only the leading `prefix_len` bits kept.
    pub fn masked(&self, prefix_len: u8) -> Self {
        Self::from_bits(self.to_bits() & Self::from_prefix_len(prefix_len).to_bits())
    }

    /// Returns this address and'ed with an explicit mask.
    pub fn and_mask(&self, mask: Ipv4Address) -> Self {
        Self::from_bits(self.to_bits() & mask.to_bits())
    }
}

impl Default for Ipv4Address {
    fn default() -> Self {
        Self::UNSPECIFIED
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Ipv4Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>()
            .map(Ipv4Address)
            .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
    }
}

impl From<Ipv4Addr> for Ipv4Address {
    fn from(addr: Ipv4Addr) -> Self {
        Ipv4Address(addr)
    }
}

impl From<Ipv4Address> for Ipv4Addr {
    fn from(addr: Ipv4Address) -> Self {
        addr.0
    }
}

/// An IPv6 address wrapper with prefix utilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ipv6Address(Ipv6Addr);

impl Ipv6Address {
    pub const UNSPECIFIED: Self = Ipv6Address(Ipv6Addr::UNSPECIFIED);
    pub const LOCALHOST: Self = Ipv6Address(Ipv6Addr::LOCALHOST);

    #[allow(clippy::too_many_arguments)]
    pub const fn new(a: u16, b: u16, c: u16, d: u16, e: u16, f: u16, g: u16, h: u16) -> Self {
        Ipv6Address(Ipv6Addr::new(a, b, c, d, e, f, g, h))
    }

    pub const fn octets(&self) -> [u8; 16] {
        self.0.octets()
    }

    pub const fn segments(&self) -> [u16; 8] {
        self.0.segments()
    }

    /// Returns the address as a host-order integer.
    pub fn to_bits(&self) -> u128 {
        u128::from(self.0)
    }

    /// Builds an address from a host-order integer.
    pub fn from_bits(bits: u128) -> Self {
        Ipv6Address(Ipv6Addr::from(bits))
    }

    /// Returns true for `::`.
    pub fn is_unspecified(&self) -> bool {
        self.0.is_unspecified()
    }

    /// Returns true if this is a link-local address (fe80::/10).
    pub fn is_link_local(&self) -> bool {
        let segments = self.segments();
        (segments[0] & 0xffc0) == 0xfe80
    }

    /// Returns the prefix mask for a prefix length, clamped to 128.
    pub fn from_prefix_len(prefix_len: u8) -> Self {
        match prefix_len {
            0 => Self::UNSPECIFIED,
            len if len >= 128 => Self::from_bits(u128::MAX),
            len => Self::from_bits(u128::MAX << (128 - u32::from(len))),
        }
    }

    /// Returns the network part of this address for the given prefix length.
    pub fn masked(&self, prefix_len: u8) -> Self {
        Self::from_bits(self.to_bits() & Self::from_prefix_len(prefix_len).to_bits())
    }
}

impl Default for Ipv6Address {
    fn default() -> Self {
        Self::UNSPECIFIED
    }
}

impl fmt::Display for Ipv6Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Ipv6Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv6Addr>()
            .map(Ipv6Address)
            .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
    }
}

impl From<Ipv6Addr> for Ipv6Address {
    fn from(addr: Ipv6Addr) -> Self {
        Ipv6Address(addr)
    }
}

impl From<Ipv6Address> for Ipv6Addr {
    fn from(addr: Ipv6Address) -> Self {
        addr.0
    }
}

/// An IP address that can be either IPv4 or IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpAddress {
    V4(Ipv4Address),
    V6(Ipv6Address),
}

impl IpAddress {
    /// Returns true for 0.0.0.0 and `::`.
    pub fn is_unspecified(&self) -> bool {
        match self {
            IpAddress::V4(addr) => addr.is_unspecified(),
            IpAddress::V6(addr) => addr.is_unspecified(),
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(addr) => addr.fmt(f),
            IpAddress::V6(addr) => addr.fmt(f),
        }
    }
}

impl FromStr for IpAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            s.parse::<Ipv6Address>().map(IpAddress::V6)
        } else {
            s.parse::<Ipv4Address>().map(IpAddress::V4)
        }
    }
}

impl From<Ipv4Address> for IpAddress {
    fn from(addr: Ipv4Address) -> Self {
        IpAddress::V4(addr)
    }
}

impl From<Ipv6Address> for IpAddress {
    fn from(addr: Ipv6Address) -> Self {
        IpAddress::V6(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ipv4_parse() {
        let addr: Ipv4Address = "192.168.1.1".parse().unwrap();
        assert_eq!(addr.octets(), [192, 168, 1, 1]);
        assert!("192.168.1".parse::<Ipv4Address>().is_err());
    }

    #[test]
    fn test_ipv4_mask_from_prefix_len() {
        assert_eq!(Ipv4Address::from_prefix_len(0), Ipv4Address::UNSPECIFIED);
        assert_eq!(Ipv4Address::from_prefix_len(4), Ipv4Address::new(240, 0, 0, 0));
        assert_eq!(Ipv4Address::from_prefix_len(24), Ipv4Address::new(255, 255, 255, 0));
        assert_eq!(Ipv4Address::from_prefix_len(32), Ipv4Address::BROADCAST);
        assert_eq!(Ipv4Address::from_prefix_len(33), Ipv4Address::UNSPECIFIED);
    }

    #[test]
    fn test_ipv4_mask_prefix_len_round_trip() {
        for len in 0..=32u8 {
            let mask = Ipv4Address::from_prefix_len(len);
            assert_eq!(mask.mask_prefix_len().unwrap(), len);
        }
    }

    #[test]
    fn test_ipv4_non_contiguous_mask_rejected() {
        let mask = Ipv4Address::new(255, 0, 255, 0);
        assert!(mask.mask_prefix_len().is_err());

        let mask = Ipv4Address::new(0, 0, 0, 255);
        assert!(mask.mask_prefix_len().is_err());
    }

    #[test]
    fn test_ipv4_masked() {
        let addr = Ipv4Address::new(10, 0, 0, 17);
        assert_eq!(addr.masked(24), Ipv4Address::new(10, 0, 0, 0));
        assert_eq!(addr.masked(0), Ipv4Address::UNSPECIFIED);
        assert_eq!(addr.masked(32), addr);
        assert_eq!(
            addr.and_mask(Ipv4Address::new(255, 255, 255, 240)),
            Ipv4Address::new(10, 0, 0, 16)
        );
    }

    #[test]
    fn test_ipv6_parse() {
        let addr: Ipv6Address = "2001:db8::1".parse().unwrap();
        assert_eq!(addr.segments()[0], 0x2001);
        assert_eq!(addr.segments()[1], 0x0db8);
    }

    #[test]
    fn test_ipv6_link_local() {
        let link_local: Ipv6Address = "fe80::1".parse().unwrap();
        assert!(link_local.is_link_local());

        let global: Ipv6Address = "2001:db8::1".parse().unwrap();
        assert!(!global.is_link_local());
    }

    #[test]
    fn test_ipv6_masked() {
        let addr: Ipv6Address = "2001:db8:1:2:3:4:5:6".parse().unwrap();
        assert_eq!(addr.masked(64).to_string(), "2001:db8:1:2::");
        assert_eq!(addr.masked(0), Ipv6Address::UNSPECIFIED);
        assert_eq!(addr.masked(128), addr);
        assert_eq!(addr.masked(24).to_string(), "2001:d00::");
        // Only the top nibble of 0x0db8 survives a /20.
        assert_eq!(addr.masked(20).to_string(), "2001::");
    }
}
