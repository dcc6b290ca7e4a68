//! Route entry and flag types.

use ipmon_types::{Rank, RankAssertion};
use std::fmt;

use super::family::AddressFamily;

macro_rules! flag_ops {
    ($name:ident) => {
        impl $name {
            /// No flags set.
            pub const NONE: Self = Self(0);

            /// Returns the raw bits.
            pub const fn bits(&self) -> u32 {
                self.0
            }

            /// Returns true if every bit of `other` is set.
            pub const fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Returns true if any bit of `other` is set.
            pub const fn intersects(&self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub const fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            /// Returns only the bits also set in `other`.
            pub const fn intersection(self, other: Self) -> Self {
                Self(self.0 & other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self::Output {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_u32(self.0)
            }
        }
    };
}

pub(crate) use flag_ops;

/// Route identity flags. These take part in route equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RouteFlags(u32);

impl RouteFlags {
    /// Installed only for traffic bound to the route's interface.
    pub const IS_SCOPED: Self = Self(1 << 0);
    /// The route goes through a gateway address.
    pub const HAS_GATEWAY: Self = Self(1 << 1);
    /// Host route (all address bits).
    pub const IS_HOST: Self = Self(1 << 2);
    /// Placeholder that ranks but is never written to the kernel.
    pub const IS_NULL: Self = Self(1 << 3);
    /// Owned by the kernel's own protocol machinery.
    pub const KERNEL_MANAGED: Self = Self(1 << 4);
}

flag_ops!(RouteFlags);

/// Runtime state of a route with respect to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ControlFlags(u32);

impl ControlFlags {
    /// The route has been visited by the current apply pass.
    pub const PROCESSED: Self = Self(1 << 0);
    /// The route is installed in the kernel.
    pub const ADDED: Self = Self(1 << 1);
    /// The route must be rewritten even if already installed.
    pub const FORCE: Self = Self(1 << 2);

    /// The subset carried over from an equal route in the previous table.
    pub const fn preserved(self) -> Self {
        self.intersection(Self(Self::PROCESSED.0 | Self::ADDED.0))
    }
}

flag_ops!(ControlFlags);

/// Flags describing a whole [`RouteList`](super::RouteList).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RouteListFlags(u32);

impl RouteListFlags {
    /// The first route of the list is a default route.
    pub const HAS_DEFAULT: Self = Self(1 << 0);
    /// The service is left out of the network information snapshot.
    pub const EXCLUDE_NWI: Self = Self(1 << 1);
    /// Every route of the service is scoped.
    pub const SCOPED_ONLY: Self = Self(1 << 2);
}

flag_ops!(RouteListFlags);

/// A single routing table entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(bound = "")]
pub struct Route<F: AddressFamily> {
    pub dest: F::Addr,
    pub prefix_length: u8,
    pub gateway: F::Addr,
    /// Interface address used as the route's source.
    pub ifa: F::Addr,
    pub ifindex: u32,
    /// "Never route this destination over this interface".
    pub exclude_ifindex: u32,
    pub rank: Rank,
    pub flags: RouteFlags,
    #[serde(skip)]
    pub control_flags: ControlFlags,
}

impl<F: AddressFamily> Route<F> {
    /// Creates an unbound route to `dest/prefix_length`.
    pub fn new(dest: F::Addr, prefix_length: u8) -> Self {
        Self {
            dest,
            prefix_length,
            gateway: F::Addr::default(),
            ifa: F::Addr::default(),
            ifindex: 0,
            exclude_ifindex: 0,
            rank: Rank::default(),
            flags: RouteFlags::NONE,
            control_flags: ControlFlags::NONE,
        }
    }

    pub fn with_gateway(mut self, gateway: F::Addr) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_ifa(mut self, ifa: F::Addr) -> Self {
        self.ifa = ifa;
        self
    }

    pub fn with_ifindex(mut self, ifindex: u32) -> Self {
        self.ifindex = ifindex;
        self
    }

    pub fn with_exclude_ifindex(mut self, ifindex: u32) -> Self {
        self.exclude_ifindex = ifindex;
        self
    }

    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_flags(mut self, flags: RouteFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Returns true if this is a default route.
    pub fn is_default(&self) -> bool {
        self.prefix_length == 0 && F::is_unspecified(&self.dest)
    }

    pub fn is_scoped(&self) -> bool {
        self.flags.contains(RouteFlags::IS_SCOPED)
    }

    pub fn has_gateway(&self) -> bool {
        self.flags.contains(RouteFlags::HAS_GATEWAY)
    }

    pub fn rank_assertion(&self) -> RankAssertion {
        self.rank.assertion()
    }

    /// Equality used when diffing tables against the kernel.
    ///
    /// Rank, exclusion and control flags are not part of a route's kernel
    /// identity.
    pub fn same_route(&self, other: &Self) -> bool {
        self.dest == other.dest
            && self.prefix_length == other.prefix_length
            && self.ifindex == other.ifindex
            && self.ifa == other.ifa
            && self.gateway == other.gateway
            && self.flags == other.flags
    }
}

impl<F: AddressFamily> fmt::Display for Route<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dest {}/{}", self.dest, self.prefix_length)?;
        if self.has_gateway() {
            write!(f, " Gate {}", self.gateway)?;
        }
        if self.ifindex != 0 {
            write!(f, " Ifp #{}", self.ifindex)?;
        }
        if self.exclude_ifindex != 0 {
            write!(f, " !Ifp #{}", self.exclude_ifindex)?;
        }
        if !F::is_unspecified(&self.ifa) {
            write!(f, " Ifa {}", self.ifa)?;
        }
        write!(f, " Rank {}", self.rank)?;
        if self.flags.contains(RouteFlags::IS_NULL) {
            return f.write_str(" [null]");
        }
        match self.rank.assertion() {
            RankAssertion::First => f.write_str(" [first]")?,
            RankAssertion::Last => f.write_str(" [last]")?,
            RankAssertion::Never => f.write_str(" [never]")?,
            _ => {}
        }
        if self.flags.contains(RouteFlags::KERNEL_MANAGED) {
            f.write_str(" [kern]")?;
        }
        if self.is_scoped() {
            f.write_str(" [SCOPED]")?;
        }
        if self.control_flags.contains(ControlFlags::FORCE) {
            f.write_str(" [force]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::family::Ipv4;
    use ipmon_types::Ipv4Address;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flag_ops() {
        let mut flags = RouteFlags::HAS_GATEWAY | RouteFlags::IS_HOST;
        assert!(flags.contains(RouteFlags::HAS_GATEWAY));
        assert!(!flags.contains(RouteFlags::IS_SCOPED));
        flags.remove(RouteFlags::HAS_GATEWAY | RouteFlags::IS_HOST);
        assert!(flags.is_empty());
    }

    #[test]
    fn test_control_flags_preserved() {
        let flags = ControlFlags::PROCESSED | ControlFlags::ADDED | ControlFlags::FORCE;
        assert_eq!(flags.preserved(), ControlFlags::PROCESSED | ControlFlags::ADDED);
    }

    #[test]
    fn test_same_route_ignores_rank_and_control() {
        let a: Route<Ipv4> = Route::new(Ipv4Address::new(10, 0, 0, 0), 24)
            .with_ifindex(4)
            .with_rank(Rank::new(1, RankAssertion::Default));
        let mut b = a.clone().with_rank(Rank::new(9, RankAssertion::Last));
        b.control_flags = ControlFlags::ADDED;
        assert!(a.same_route(&b));

        let c = a.clone().with_flags(RouteFlags::IS_SCOPED);
        assert!(!a.same_route(&c));
    }

    #[test]
    fn test_route_display() {
        let route: Route<Ipv4> = Route::new(Ipv4Address::UNSPECIFIED, 0)
            .with_gateway(Ipv4Address::new(10, 0, 0, 1))
            .with_ifindex(4)
            .with_rank(Rank::new(1, RankAssertion::Never))
            .with_flags(RouteFlags::HAS_GATEWAY | RouteFlags::IS_SCOPED);
        assert_eq!(
            route.to_string(),
            "Dest 0.0.0.0/0 Gate 10.0.0.1 Ifp #4 Rank 0x3000001 [never] [SCOPED]"
        );
    }
}
