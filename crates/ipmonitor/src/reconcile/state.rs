//! Reconciler state and change batch processing.

use ipmon_types::{IpAddress, Rank, RankAssertion, ServiceId};
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};

use super::notify::ChangeBits;
use super::publisher::{DownstreamUpdate, PrimaryInfo, Publisher, RouteTable};
use crate::assertions::InterfaceRankTable;
use crate::builder::{build_service, multicast_loopback_routes, ServiceState};
use crate::config::ConfigSource;
use crate::election::{build_candidates, get_primary, Candidate, ElectionFamily, ElectionOutcome, ElectionResults, NwiState};
use crate::kernel::{InterfaceTable, RouteKernel};
use crate::route::{Ipv4, Ipv6, KernelRouteWriter, Route, RouteList};

/// Per-family hooks used when installing an election outcome.
pub trait ReconcileFamily: ElectionFamily {
    fn route_table(routes: Option<&RouteList<Self>>) -> RouteTable<'_>;

    /// Router published for the primary, from the first (default) route.
    fn router(route: &Route<Self>) -> Option<IpAddress>;

    /// Table installed when the election yields no routes at all.
    fn empty_routes(interfaces: &dyn InterfaceTable) -> Option<RouteList<Self>>;
}

impl ReconcileFamily for Ipv4 {
    fn route_table(routes: Option<&RouteList<Self>>) -> RouteTable<'_> {
        RouteTable::Ipv4(routes)
    }

    fn router(route: &Route<Self>) -> Option<IpAddress> {
        (!route.gateway.is_unspecified()).then_some(IpAddress::V4(route.gateway))
    }

    fn empty_routes(interfaces: &dyn InterfaceTable) -> Option<RouteList<Self>> {
        multicast_loopback_routes(interfaces)
    }
}

impl ReconcileFamily for Ipv6 {
    fn route_table(routes: Option<&RouteList<Self>>) -> RouteTable<'_> {
        RouteTable::Ipv6(routes)
    }

    fn router(route: &Route<Self>) -> Option<IpAddress> {
        route.has_gateway().then_some(IpAddress::V6(route.gateway))
    }

    fn empty_routes(_interfaces: &dyn InterfaceTable) -> Option<RouteList<Self>> {
        None
    }
}

/// Election and kernel state of one family.
#[derive(Debug, Clone)]
pub struct FamilyTables<F: ElectionFamily> {
    pub results: ElectionResults<F>,
    /// Installed route table.
    pub routes: Option<RouteList<F>>,
    pub primary: Option<ServiceId>,
    pub primary_info: Option<PrimaryInfo>,
    /// Rank of every candidate, for the DNS and proxies decision.
    pub service_rank: BTreeMap<ServiceId, Rank>,
}

impl<F: ElectionFamily> Default for FamilyTables<F> {
    fn default() -> Self {
        Self {
            results: ElectionResults::new(),
            routes: None,
            primary: None,
            primary_info: None,
            service_rank: BTreeMap::new(),
        }
    }
}

/// One batch of changes handed to [`ReconcilerState::process_changes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    /// Services whose configuration changed, in arrival order.
    pub services: Vec<ServiceId>,
    /// Interfaces whose rank override changed.
    pub interface_rank_changes: Vec<String>,
    /// Service order or dial-up override changed.
    pub global_changed: bool,
}

impl ChangeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.interface_rank_changes.is_empty() && !self.global_changed
    }

    pub fn add_service(&mut self, id: ServiceId) {
        if !self.services.contains(&id) {
            self.services.push(id);
        }
    }

    pub fn add_interface(&mut self, ifname: impl Into<String>) {
        let ifname = ifname.into();
        if !self.interface_rank_changes.contains(&ifname) {
            self.interface_rank_changes.push(ifname);
        }
    }

    pub fn with_service(mut self, id: impl Into<ServiceId>) -> Self {
        self.add_service(id.into());
        self
    }

    pub fn with_interface(mut self, ifname: impl Into<String>) -> Self {
        self.add_interface(ifname);
        self
    }

    pub fn with_global_changed(mut self) -> Self {
        self.global_changed = true;
        self
    }
}

/// What a batch changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub bits: ChangeBits,
    pub ipv4_changed: bool,
    pub ipv6_changed: bool,
    /// A new network information snapshot was published.
    pub nwi_published: bool,
    /// The resolver configuration was asked to regenerate.
    pub dnsinfo_published: bool,
}

#[derive(Debug, Default)]
struct PendingChanges {
    ipv4: bool,
    ipv6: bool,
    dns: bool,
    dnsinfo: bool,
    proxies: bool,
    nat64: bool,
}

/// Records a primary change. Returns true if the primary changed.
fn set_new_primary(primary: &mut Option<ServiceId>, new_primary: Option<&ServiceId>, entity: &str) -> bool {
    match (new_primary, primary.as_ref()) {
        (Some(new), Some(old)) if new == old => {
            info!("Reconciler: {} is still primary {}", new, entity);
            false
        }
        (Some(new), _) => {
            info!("Reconciler: {} is the new primary {}", new, entity);
            *primary = Some(new.clone());
            true
        }
        (None, Some(old)) => {
            info!("Reconciler: {} is no longer primary {}", old, entity);
            *primary = None;
            true
        }
        (None, None) => false,
    }
}

/// Rank of a service for an entity it may not have.
fn rank_service_entity(ranks: &BTreeMap<ServiceId, Rank>, service: &ServiceId, has_entity: bool) -> Rank {
    let missing = Rank::new(Rank::INDEX_MASK, RankAssertion::Default);
    if !has_entity {
        return missing;
    }
    ranks.get(service).copied().unwrap_or(missing)
}

fn log_results<F: ElectionFamily>(results: &ElectionResults<F>) {
    if results.is_empty() {
        info!("Reconciler: {} no candidates", F::NAME);
        return;
    }
    info!("Reconciler: {} {} candidates", F::NAME, results.len());
    for (i, candidate) in results.candidates().iter().enumerate() {
        info!(
            "Reconciler: {} {}. {} {} rank {}{}{}",
            F::NAME,
            i + 1,
            candidate.service_id,
            candidate.ifname,
            candidate.rank,
            if candidate.ineligible { " ineligible" } else { "" },
            if candidate.ip_is_coupled { " coupled" } else { "" }
        );
    }
}

/// Installs an election outcome: publishes the primary, finalizes the
/// aggregate table and applies it against the installed one.
async fn update_family<F: ReconcileFamily>(
    tables: &mut FamilyTables<F>,
    outcome: ElectionOutcome<F>,
    interfaces: &dyn InterfaceTable,
    writer: &KernelRouteWriter<'_>,
    publisher: &dyn Publisher,
) {
    set_new_primary(
        &mut tables.primary,
        outcome.primary.as_ref().map(|candidate| &candidate.service_id),
        F::NAME,
    );

    let info = match (tables.primary.as_ref(), outcome.routes.as_ref().and_then(|routes| routes.first())) {
        (Some(service), Some(first)) => Some(PrimaryInfo {
            service: service.clone(),
            interface: interfaces.name_for(first.ifindex),
            router: F::router(first),
        }),
        _ => None,
    };
    if tables.primary_info != info {
        publisher.publish_primary(F::FAMILY, info.as_ref()).await;
        tables.primary_info = info;
    }

    let mut routes = match outcome.routes {
        Some(mut routes) => {
            routes.finalize();
            Some(routes)
        }
        None => F::empty_routes(interfaces),
    };
    match tables.routes.as_ref() {
        Some(old) => debug!("Reconciler: {} old routes:\n{}", F::NAME, old),
        None => debug!("Reconciler: {} old routes: <none>", F::NAME),
    }
    match routes.as_ref() {
        Some(new) => debug!("Reconciler: {} new routes:\n{}", F::NAME, new),
        None => debug!("Reconciler: {} new routes: <none>", F::NAME),
    }
    RouteList::apply(tables.routes.as_ref(), routes.as_mut(), writer);
    tables.routes = routes;
    publisher.publish_routes(F::route_table(tables.routes.as_ref())).await;
}

/// Everything the reconciliation worker owns.
#[derive(Debug)]
pub struct ReconcilerState {
    services: BTreeMap<ServiceId, ServiceState>,
    ipv4: FamilyTables<Ipv4>,
    ipv6: FamilyTables<Ipv6>,
    primary_dns: Option<ServiceId>,
    primary_proxies: Option<ServiceId>,
    nwi: NwiState,
    nwi_generation: u64,
    rank_table: InterfaceRankTable,
    netboot: bool,
}

impl ReconcilerState {
    pub fn new(rank_table: InterfaceRankTable) -> Self {
        Self {
            services: BTreeMap::new(),
            ipv4: FamilyTables::default(),
            ipv6: FamilyTables::default(),
            primary_dns: None,
            primary_proxies: None,
            nwi: NwiState::new(),
            nwi_generation: 0,
            rank_table,
            netboot: false,
        }
    }

    /// Never touch the IPv4 default route.
    pub fn with_netboot(mut self, netboot: bool) -> Self {
        self.netboot = netboot;
        self
    }

    pub fn services(&self) -> &BTreeMap<ServiceId, ServiceState> {
        &self.services
    }

    pub fn ipv4(&self) -> &FamilyTables<Ipv4> {
        &self.ipv4
    }

    pub fn ipv6(&self) -> &FamilyTables<Ipv6> {
        &self.ipv6
    }

    pub fn primary_dns(&self) -> Option<&ServiceId> {
        self.primary_dns.as_ref()
    }

    pub fn primary_proxies(&self) -> Option<&ServiceId> {
        self.primary_proxies.as_ref()
    }

    pub fn nwi(&self) -> &NwiState {
        &self.nwi
    }

    pub fn rank_table(&self) -> &InterfaceRankTable {
        &self.rank_table
    }

    pub fn rank_table_mut(&mut self) -> &mut InterfaceRankTable {
        &mut self.rank_table
    }

    /// Services whose IPv4 or IPv6 configuration uses `ifname`.
    pub fn services_on_interface(&self, ifname: &str) -> Vec<ServiceId> {
        self.services
            .iter()
            .filter(|(_, state)| {
                let v4 = state.ipv4.as_ref().and_then(|s| s.interface_name.as_deref());
                let v6 = state.ipv6.as_ref().and_then(|s| s.interface_name.as_deref());
                v4 == Some(ifname) || v6 == Some(ifname)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Picks the primary for an entity between the two family primaries.
    fn entity_primary(&self, has_entity: fn(&ServiceState) -> bool) -> Option<ServiceId> {
        let has = |id: &ServiceId| self.services.get(id).is_some_and(has_entity);
        match (self.ipv4.primary.as_ref(), self.ipv6.primary.as_ref()) {
            (Some(v4), Some(v6)) => {
                let v4_rank = rank_service_entity(&self.ipv4.service_rank, v4, has(v4));
                let v6_rank = rank_service_entity(&self.ipv6.service_rank, v6, has(v6));
                Some(if v4_rank <= v6_rank { v4.clone() } else { v6.clone() })
            }
            (Some(v4), None) => Some(v4.clone()),
            (None, Some(v6)) => Some(v6.clone()),
            (None, None) => None,
        }
    }

    /// Processes one batch of changes.
    ///
    /// Rebuilds the state of every changed service, re-runs the election of
    /// every affected family, applies the new route tables to the kernel and
    /// reports what downstream consumers must hear about.
    pub async fn process_changes(
        &mut self,
        batch: &ChangeBatch,
        source: &dyn ConfigSource,
        kernel: &dyn RouteKernel,
        publisher: &dyn Publisher,
    ) -> ChangeSummary {
        if batch.is_empty() {
            return ChangeSummary::default();
        }

        let mut changed: Vec<ServiceId> = Vec::new();
        for id in &batch.services {
            if !changed.contains(id) {
                changed.push(id.clone());
            }
        }
        for ifname in &batch.interface_rank_changes {
            debug!("Reconciler: interface rank changed {}", ifname);
            for id in self.services_on_interface(ifname) {
                if !changed.contains(&id) {
                    changed.push(id);
                }
            }
        }

        let mut pending = PendingChanges {
            ipv4: batch.global_changed,
            ipv6: batch.global_changed,
            ..Default::default()
        };
        let mut ipv4_services = BTreeSet::new();
        let mut ipv6_services = BTreeSet::new();
        let interfaces = source.interfaces();

        for id in &changed {
            let new_state = source.service(id).map(|config| {
                build_service(id, config, interfaces, |ifname| {
                    self.rank_table.interface_rank_override(ifname)
                })
            });

            {
                let empty = ServiceState::default();
                let old = self.services.get(id).unwrap_or(&empty);
                let new = new_state.as_ref().unwrap_or(&empty);

                let ipv4_changed = old.ipv4 != new.ipv4;
                let ipv6_changed = old.ipv6 != new.ipv6;
                if ipv4_changed {
                    ipv4_services.insert(id.clone());
                }
                if ipv6_changed {
                    ipv6_services.insert(id.clone());
                }

                if old.options != new.options {
                    pending.ipv4 = true;
                    pending.ipv6 = true;
                } else {
                    if ipv4_changed {
                        pending.ipv4 = true;
                        pending.dnsinfo = true;
                        pending.proxies = true;
                    }
                    if ipv6_changed {
                        pending.ipv6 = true;
                        pending.dnsinfo = true;
                        pending.proxies = true;
                        pending.nat64 = true;
                    }
                }
                if old.dns != new.dns {
                    if self.primary_dns.as_ref() == Some(id) {
                        pending.dns = true;
                    }
                    pending.dnsinfo = true;
                    pending.nat64 = true;
                }
                if old.proxies != new.proxies {
                    pending.proxies = true;
                }
                if old.vpn != new.vpn {
                    // Reachability is carried by the candidates.
                    pending.ipv4 |= new.ipv4.is_some();
                    pending.ipv6 |= new.ipv6.is_some();
                    pending.dnsinfo |= new.ipv4.is_some() || new.ipv6.is_some();
                }
            }

            match new_state {
                Some(state) => {
                    self.services.insert(id.clone(), state);
                }
                None => {
                    if self.services.remove(id).is_some() {
                        info!("Reconciler: {} removed", id);
                    }
                }
            }
        }

        if pending.ipv4 {
            let (results, ranks) = build_candidates::<Ipv4>(&self.services, source.global());
            log_results(&results);
            self.ipv4.results = results;
            self.ipv4.service_rank = ranks;
        }
        if pending.ipv6 {
            let (results, ranks) = build_candidates::<Ipv6>(&self.services, source.global());
            log_results(&results);
            self.ipv6.results = results;
            self.ipv6.service_rank = ranks;
        }

        let mut summary = ChangeSummary {
            ipv4_changed: pending.ipv4,
            ipv6_changed: pending.ipv6,
            ..Default::default()
        };
        let elect = pending.ipv4 || pending.ipv6 || pending.dnsinfo;
        let old_nwi = self.nwi.clone();

        if elect {
            self.nwi.clear();
            let writer = KernelRouteWriter::new(kernel).with_netboot(self.netboot);

            debug!("Reconciler: electing IPv4 primary");
            let outcome = get_primary(
                &self.ipv4.results,
                self.ipv6.results.first(),
                &self.services,
                &mut self.nwi,
                &ipv4_services,
            );
            let ipv4_primary: Option<Candidate> = outcome.primary.clone();
            update_family(&mut self.ipv4, outcome, interfaces, &writer, publisher).await;

            debug!("Reconciler: electing IPv6 primary");
            let outcome = get_primary(
                &self.ipv6.results,
                ipv4_primary.as_ref(),
                &self.services,
                &mut self.nwi,
                &ipv6_services,
            );
            update_family(&mut self.ipv6, outcome, interfaces, &writer, publisher).await;

            let new_dns = self.entity_primary(|service| service.dns);
            let new_proxies = self.entity_primary(|service| service.proxies);
            if set_new_primary(&mut self.primary_dns, new_dns.as_ref(), "DNS") {
                pending.dns = true;
                pending.dnsinfo = true;
            }
            if set_new_primary(&mut self.primary_proxies, new_proxies.as_ref(), "Proxies") {
                pending.proxies = true;
            }
        }

        let mut bits = ChangeBits::NONE;
        if elect && self.nwi != old_nwi {
            self.nwi_generation += 1;
            self.nwi.stamp(self.nwi_generation);
            publisher.publish_nwi(&self.nwi).await;
            summary.nwi_published = true;
            bits |= ChangeBits::NET;
            // Resolver reachability follows the snapshot.
            pending.dnsinfo = true;
        }
        if pending.dns {
            publisher
                .request_update(DownstreamUpdate::Dns {
                    primary: self.primary_dns.clone(),
                })
                .await;
            bits |= ChangeBits::DNS;
        }
        if pending.dnsinfo {
            publisher
                .request_update(DownstreamUpdate::DnsInfo {
                    primary: self.primary_dns.clone(),
                })
                .await;
            summary.dnsinfo_published = true;
            bits |= ChangeBits::DNS;
        }
        if pending.proxies {
            publisher
                .request_update(DownstreamUpdate::Proxies {
                    primary: self.primary_proxies.clone(),
                })
                .await;
            bits |= ChangeBits::PROXY;
        }
        if pending.nat64 {
            bits |= ChangeBits::NAT64;
        }

        summary.bits = bits;
        summary
    }
}
