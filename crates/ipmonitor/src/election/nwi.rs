//! Network information snapshot.
//!
//! The snapshot lists, per family, the interfaces downstream consumers may
//! use, in election order. Signatures are published as SHA-256 digests.

use chrono::{DateTime, Utc};
use ipmon_types::{IpAddress, Rank, RankAssertion};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::candidate::{Candidate, ReachabilityFlags};
use crate::route::flag_ops;

/// Per-interface snapshot flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NwiFlags(u32);

impl NwiFlags {
    /// Visible for scoping only, never chosen for unscoped traffic.
    pub const NOT_IN_LIST: Self = Self(1 << 0);
    /// Left out of the interface list.
    pub const NOT_IN_IFLIST: Self = Self(1 << 1);
    pub const HAS_DNS: Self = Self(1 << 2);
    pub const HAS_CLAT46: Self = Self(1 << 3);
}

flag_ops!(NwiFlags);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NwiInterfaceState {
    pub ifname: String,
    pub flags: NwiFlags,
    pub rank: Rank,
    pub address: IpAddress,
    pub vpn_server_address: Option<IpAddress>,
    pub reachability_flags: ReachabilityFlags,
    pub signature_sha256: Option<String>,
}

impl NwiInterfaceState {
    pub fn new(
        candidate: &Candidate,
        not_in_list: bool,
        not_in_iflist: bool,
        has_dns: bool,
        has_clat46: bool,
    ) -> Self {
        let mut flags = NwiFlags::NONE;
        if not_in_list || candidate.rank.assertion() == RankAssertion::Never {
            flags |= NwiFlags::NOT_IN_LIST;
        }
        if not_in_iflist {
            flags |= NwiFlags::NOT_IN_IFLIST;
        }
        if has_dns {
            flags |= NwiFlags::HAS_DNS;
        }
        if has_clat46 {
            flags |= NwiFlags::HAS_CLAT46;
        }
        Self {
            ifname: candidate.ifname.clone(),
            flags,
            rank: candidate.rank,
            address: candidate.address,
            vpn_server_address: candidate.vpn_server_address,
            reachability_flags: candidate.reachability_flags,
            signature_sha256: candidate.signature.as_deref().map(signature_sha256),
        }
    }
}

/// Hex encoded SHA-256 of a network signature.
pub fn signature_sha256(signature: &str) -> String {
    hex::encode(Sha256::digest(signature.as_bytes()))
}

/// Published network information.
///
/// Equality only looks at the interface lists.
#[derive(Debug, Clone, Serialize)]
pub struct NwiState {
    pub generation: u64,
    pub generated_at: DateTime<Utc>,
    pub ipv4: Vec<NwiInterfaceState>,
    pub ipv6: Vec<NwiInterfaceState>,
}

impl Default for NwiState {
    fn default() -> Self {
        Self {
            generation: 0,
            generated_at: Utc::now(),
            ipv4: Vec::new(),
            ipv6: Vec::new(),
        }
    }
}

impl PartialEq for NwiState {
    fn eq(&self, other: &Self) -> bool {
        self.ipv4 == other.ipv4 && self.ipv6 == other.ipv6
    }
}

impl Eq for NwiState {}

impl NwiState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empties both interface lists before a new election.
    pub fn clear(&mut self) {
        self.ipv4.clear();
        self.ipv6.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty()
    }

    /// Marks the snapshot as a new publication.
    pub fn stamp(&mut self, generation: u64) {
        self.generation = generation;
        self.generated_at = Utc::now();
    }

    /// Returns the interface names of both families, IPv4 first.
    pub fn interface_names(&self) -> Vec<&str> {
        self.ipv4
            .iter()
            .chain(self.ipv6.iter())
            .map(|state| state.ifname.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipmon_types::{Ipv4Address, ServiceId};
    use pretty_assertions::assert_eq;

    fn candidate(assertion: RankAssertion, signature: Option<&str>) -> Candidate {
        Candidate {
            service_id: ServiceId::from("wifi"),
            ifname: "en0".to_string(),
            rank: Rank::new(1, assertion),
            ineligible: false,
            ip_is_coupled: false,
            reachability_flags: ReachabilityFlags::REACHABLE,
            address: IpAddress::V4(Ipv4Address::new(10, 0, 0, 2)),
            vpn_server_address: None,
            signature: signature.map(str::to_string),
        }
    }

    #[test]
    fn test_signature_sha256() {
        assert_eq!(
            signature_sha256("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_interface_state_flags() {
        let state = NwiInterfaceState::new(&candidate(RankAssertion::Default, None), false, true, true, false);
        assert_eq!(state.flags, NwiFlags::NOT_IN_IFLIST | NwiFlags::HAS_DNS);
        assert_eq!(state.signature_sha256, None);

        let state = NwiInterfaceState::new(&candidate(RankAssertion::Never, Some("abc")), false, false, false, true);
        assert_eq!(state.flags, NwiFlags::NOT_IN_LIST | NwiFlags::HAS_CLAT46);
        assert!(state.signature_sha256.is_some());
    }

    #[test]
    fn test_equality_ignores_stamp() {
        let mut a = NwiState::new();
        a.ipv4.push(NwiInterfaceState::new(&candidate(RankAssertion::Default, None), false, false, false, false));
        let mut b = a.clone();
        b.stamp(42);
        assert_eq!(a, b);

        b.clear();
        assert_ne!(a, b);
        assert!(b.is_empty());
    }
}
