//! Primary selection and route aggregation.

use ipmon_types::{RankAssertion, ServiceId};
use log::info;
use std::collections::{BTreeMap, BTreeSet};

use super::candidate::{Candidate, ElectionResults};
use super::nwi::{NwiInterfaceState, NwiState};
use super::ElectionFamily;
use crate::builder::ServiceState;
use crate::route::{RouteList, RouteListFlags};

/// Interfaces whose IPv6 is tunnelled over IPv4 never force a demotion.
const TUNNEL_PREFIX: &str = "stf";

/// Result of one family's election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionOutcome<F: ElectionFamily> {
    pub primary: Option<Candidate>,
    /// Aggregate table of every candidate's routes, not yet finalized.
    pub routes: Option<RouteList<F>>,
}

/// Returns true if `candidate` must not become primary because of the
/// other family's best candidate.
///
/// Coupled services keep IPv4 and IPv6 on the same interface: a candidate
/// that is not strictly better than a differently-homed coupled rival (or
/// that is itself coupled) yields.
pub fn needs_demotion(other: Option<&Candidate>, candidate: &Candidate) -> bool {
    let Some(other) = other else {
        return false;
    };
    if other.ineligible || other.rank.assertion() == RankAssertion::Never {
        return false;
    }
    if !candidate.ip_is_coupled && !other.ip_is_coupled {
        return false;
    }
    if other.ifname == candidate.ifname || other.ifname.starts_with(TUNNEL_PREFIX) {
        return false;
    }
    if candidate.rank < other.rank {
        return false;
    }
    if candidate.rank == other.rank && other.ip_is_coupled {
        // Equal rank against a coupled rival: the rival yields, or neither.
        return false;
    }
    true
}

/// Picks the primary of family `F` and merges every candidate's routes.
///
/// `other` is the other family's best candidate. Candidates in `changed`
/// have their routes force-applied. Interfaces are appended to `nwi`.
pub fn get_primary<F: ElectionFamily>(
    results: &ElectionResults<F>,
    other: Option<&Candidate>,
    services: &BTreeMap<ServiceId, ServiceState>,
    nwi: &mut NwiState,
    changed: &BTreeSet<ServiceId>,
) -> ElectionOutcome<F> {
    let mut primary: Option<&Candidate> = None;
    let mut primary_is_null = false;
    let mut deferred: Vec<&Candidate> = Vec::new();
    let mut routes: Option<RouteList<F>> = None;

    for scan in results.candidates() {
        let mut is_primary = false;
        let mut skip = false;

        if !scan.ineligible && primary.is_none() && scan.rank.assertion() != RankAssertion::Never {
            if needs_demotion(other, scan) {
                if let Some(other) = other {
                    info!(
                        "Election: IPv{} over {} (rank {}) demoted: primary IPv{} {} (rank {})",
                        F::LABEL,
                        scan.ifname,
                        scan.rank,
                        F::OTHER_LABEL,
                        other.ifname,
                        other.rank
                    );
                }
                deferred.push(scan);
                skip = true;
            } else {
                primary = Some(scan);
                is_primary = true;
            }
        }

        let service = services.get(&scan.service_id);
        let service_routes = service
            .and_then(|service| F::state(service))
            .and_then(|state| state.routes.as_ref());
        let mut scoped_only = false;
        match service_routes {
            Some(service_routes) => {
                // Deferred routes rank Never so they can't win the default.
                let rank = if skip {
                    scan.rank.with_assertion(RankAssertion::Never)
                } else {
                    scan.rank
                };
                let force = changed.contains(&scan.service_id);
                let capacity = results.len() * 8;
                routes
                    .get_or_insert_with(|| RouteList::with_capacity(capacity))
                    .add_route_list(service_routes, rank, force);
                if service_routes.flags.contains(RouteListFlags::EXCLUDE_NWI) {
                    skip = true;
                }
                scoped_only = service_routes.flags.contains(RouteListFlags::SCOPED_ONLY);
            }
            None => skip = true,
        }

        if skip {
            if is_primary {
                primary_is_null = true;
            }
        } else if !scan.ineligible {
            let has_dns = service.is_some_and(|service| service.dns);
            let has_clat46 = F::SUPPORTS_CLAT46 && service.is_some_and(|service| service.clat46);
            F::nwi_interfaces(nwi).push(NwiInterfaceState::new(
                scan,
                primary_is_null,
                scoped_only,
                has_dns,
                has_clat46,
            ));
        }
    }

    for candidate in deferred {
        let service = services.get(&candidate.service_id);
        let has_dns = service.is_some_and(|service| service.dns);
        let has_clat46 = F::SUPPORTS_CLAT46 && service.is_some_and(|service| service.clat46);
        F::nwi_interfaces(nwi).push(NwiInterfaceState::new(candidate, true, false, has_dns, has_clat46));
    }

    ElectionOutcome {
        primary: if primary_is_null { None } else { primary.cloned() },
        routes,
    }
}
