//! Election candidates.

use ipmon_types::{IpAddress, Rank, RankAssertion, ServiceId};
use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use std::marker::PhantomData;

use super::ElectionFamily;
use crate::builder::{ServiceState, LOOPBACK_IFNAME};
use crate::config::{GlobalConfig, VpnConfig, VpnStatus};
use crate::route::{flag_ops, AddressFamily};

const PPP_PREFIX: &str = "ppp";

/// Reachability reported for a candidate's interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReachabilityFlags(u32);

impl ReachabilityFlags {
    pub const TRANSIENT_CONNECTION: Self = Self(1 << 0);
    pub const REACHABLE: Self = Self(1 << 1);
    pub const CONNECTION_REQUIRED: Self = Self(1 << 2);
    pub const CONNECTION_ON_TRAFFIC: Self = Self(1 << 3);
    pub const INTERVENTION_REQUIRED: Self = Self(1 << 4);

    /// Derives the flags of a service from its VPN attributes.
    pub fn from_vpn(vpn: Option<&VpnConfig>) -> Self {
        let mut flags = Self::REACHABLE;
        let Some(vpn) = vpn else {
            return flags;
        };
        flags |= Self::TRANSIENT_CONNECTION;
        match vpn.status {
            Some(VpnStatus::Connected) | None => {}
            Some(status) => {
                flags |= Self::CONNECTION_REQUIRED;
                if vpn.on_demand {
                    flags |= Self::CONNECTION_ON_TRAFFIC;
                    if status == VpnStatus::Idle {
                        flags |= Self::INTERVENTION_REQUIRED;
                    }
                }
            }
        }
        flags
    }
}

flag_ops!(ReachabilityFlags);

/// One service's standing in a family's election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub service_id: ServiceId,
    pub ifname: String,
    pub rank: Rank,
    /// No default route: routes are merged but it can't be primary.
    pub ineligible: bool,
    pub ip_is_coupled: bool,
    pub reachability_flags: ReachabilityFlags,
    pub address: IpAddress,
    pub vpn_server_address: Option<IpAddress>,
    pub signature: Option<String>,
}

/// Candidates of one family, best first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(bound = "")]
pub struct ElectionResults<F: AddressFamily> {
    candidates: Vec<Candidate>,
    #[serde(skip)]
    family: PhantomData<F>,
}

impl<F: AddressFamily> Default for ElectionResults<F> {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
            family: PhantomData,
        }
    }
}

impl<F: AddressFamily> ElectionResults<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a candidate before the first one with a worse rank.
    pub fn add(&mut self, candidate: Candidate) {
        let at = self
            .candidates
            .iter()
            .position(|scan| candidate.rank < scan.rank)
            .unwrap_or(self.candidates.len());
        self.candidates.insert(at, candidate);
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn first(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn find(&self, service_id: &ServiceId) -> Option<&Candidate> {
        self.candidates.iter().find(|c| &c.service_id == service_id)
    }
}

/// Index of a service in the configured order.
///
/// An explicit index sorts after every ordered service; unordered
/// services share the worst index.
fn service_index(service_id: &ServiceId, explicit: Option<u32>, order: &[ServiceId]) -> u32 {
    if let Some(index) = explicit {
        let effective = index.saturating_add(order.len() as u32);
        info!(
            "Election: {} specifies ServiceIndex {}, effective index is {}",
            service_id, index, effective
        );
        return effective;
    }
    order
        .iter()
        .position(|id| id == service_id)
        .map_or(Rank::INDEX_MASK, |i| i as u32 + 1)
}

/// Ranks every service with connectivity in family `F`.
///
/// Also returns the rank recorded for each candidate, used later to choose
/// the DNS and proxies primary.
pub fn build_candidates<F: ElectionFamily>(
    services: &BTreeMap<ServiceId, ServiceState>,
    global: &GlobalConfig,
) -> (ElectionResults<F>, BTreeMap<ServiceId, Rank>) {
    let mut results = ElectionResults::new();
    let mut service_rank = BTreeMap::new();

    for (service_id, service) in services {
        let Some(state) = F::state(service) else {
            continue;
        };
        let (Some(routes), Some(ifname)) = (state.routes.as_ref(), state.interface_name.as_ref()) else {
            continue;
        };
        if ifname == LOOPBACK_IFNAME {
            continue;
        }
        let Some(first) = routes.first() else {
            continue;
        };

        let mut assertion = first.rank_assertion();
        if global.ppp_override_primary && ifname.starts_with(PPP_PREFIX) {
            assertion = RankAssertion::First;
        }
        let index = service_index(service_id, service.options.service_index, &global.service_order);
        let rank = Rank::new(index, assertion);
        service_rank.insert(service_id.clone(), rank);

        results.add(Candidate {
            service_id: service_id.clone(),
            ifname: ifname.clone(),
            rank,
            ineligible: !routes.has_default(),
            ip_is_coupled: service.options.ip_is_coupled,
            reachability_flags: ReachabilityFlags::from_vpn(service.vpn.as_ref()),
            address: F::to_ip_address(&first.ifa),
            vpn_server_address: service.vpn.as_ref().and_then(|vpn| vpn.server_address),
            signature: state.signature.clone(),
        });
    }
    (results, service_rank)
}
