//! Per-service route builder.
//!
//! Turns one service's family configuration into the small [`RouteList`]
//! it contributes to the election: default route, subnet routes, the
//! router's host route, and the configured additional and excluded routes.
//!
//! [`RouteList`]: crate::route::RouteList

mod ipv4;
mod ipv6;

pub use ipv4::{build_ipv4_routes, multicast_loopback_routes};
pub use ipv6::build_ipv6_routes;

use ipmon_types::{Rank, RankAssertion, ServiceId};
use log::warn;

use crate::config::{Ipv4Config, Ipv6Config, ServiceConfig, SetupOverride, VpnConfig};
use crate::kernel::InterfaceTable;
use crate::route::{AddressFamily, Ipv4, Ipv6, RouteList};

/// Name of the loopback interface; it never carries a default route.
pub const LOOPBACK_IFNAME: &str = "lo0";

/// Rank related options of a service after layering setup, state and
/// interface overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceOptions {
    pub rank_assertion: Option<RankAssertion>,
    /// Explicit index in `1..=Rank::INDEX_MASK`.
    pub service_index: Option<u32>,
    pub ip_is_coupled: bool,
}

/// Resolves a service's options.
///
/// When both setup and state assert a rank, the more restrictive one wins.
/// Without any service assertion the interface override applies.
pub fn resolve_options(
    service_id: &ServiceId,
    config: &ServiceConfig,
    interface_override: impl Fn(&str) -> Option<RankAssertion>,
) -> ServiceOptions {
    let options = &config.service;
    let rank_assertion = match (options.setup_primary_rank, options.primary_rank) {
        (Some(setup), Some(state)) => Some(setup.max(state)),
        (Some(assertion), None) | (None, Some(assertion)) => Some(assertion),
        (None, None) => config.interface_names().next().and_then(interface_override),
    };

    let service_index = options.service_index.and_then(|index| {
        match u32::try_from(index) {
            Ok(index) if (1..=Rank::INDEX_MASK).contains(&index) => Some(index),
            _ => {
                warn!("Builder: {} ignoring invalid service index {}", service_id, index);
                None
            }
        }
    });

    ServiceOptions {
        rank_assertion,
        service_index,
        ip_is_coupled: options.ip_is_coupled || options.expensive,
    }
}

/// What one service contributes to one family's election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyState<F: AddressFamily> {
    pub interface_name: Option<String>,
    /// `None` when the configuration yields no usable routes.
    pub routes: Option<RouteList<F>>,
    /// Network identity, only trusted on the confirmed interface.
    pub signature: Option<String>,
}

impl<F: AddressFamily> FamilyState<F> {
    fn new(
        interface_name: Option<&String>,
        confirmed_interface_name: Option<&String>,
        network_signature: Option<&String>,
        routes: Option<RouteList<F>>,
    ) -> Self {
        let confirmed = match (interface_name, confirmed_interface_name) {
            (Some(ifname), Some(confirmed)) => ifname == confirmed,
            (Some(_), None) => true,
            (None, _) => false,
        };
        Self {
            interface_name: interface_name.cloned(),
            routes,
            signature: network_signature.filter(|_| confirmed).cloned(),
        }
    }
}

/// A service's resolved state, as kept by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceState {
    pub options: ServiceOptions,
    pub ipv4: Option<FamilyState<Ipv4>>,
    pub ipv6: Option<FamilyState<Ipv6>>,
    pub dns: bool,
    pub proxies: bool,
    pub clat46: bool,
    pub vpn: Option<VpnConfig>,
}

impl ServiceState {
    /// Interface of the service, IPv4 first.
    pub fn interface_name(&self) -> Option<&str> {
        self.ipv4
            .as_ref()
            .and_then(|state| state.interface_name.as_deref())
            .or_else(|| self.ipv6.as_ref().and_then(|state| state.interface_name.as_deref()))
    }
}

/// Builds a service's state from its configuration.
pub fn build_service(
    service_id: &ServiceId,
    config: &ServiceConfig,
    interfaces: &dyn InterfaceTable,
    interface_override: impl Fn(&str) -> Option<RankAssertion>,
) -> ServiceState {
    let options = resolve_options(service_id, config, interface_override);

    let ipv4 = effective_ipv4(config).map(|ipv4| {
        let routes = build_ipv4_routes(&ipv4, options.rank_assertion, interfaces);
        FamilyState::new(
            ipv4.interface_name.as_ref(),
            ipv4.confirmed_interface_name.as_ref(),
            ipv4.network_signature.as_ref(),
            routes,
        )
    });
    let ipv6 = effective_ipv6(config).map(|ipv6| {
        let routes = build_ipv6_routes(&ipv6, options.rank_assertion, interfaces);
        FamilyState::new(
            ipv6.interface_name.as_ref(),
            ipv6.confirmed_interface_name.as_ref(),
            ipv6.network_signature.as_ref(),
            routes,
        )
    });

    ServiceState {
        options,
        ipv4,
        ipv6,
        dns: config.dns,
        proxies: config.proxies,
        clat46: config.clat46,
        vpn: config.vpn.clone(),
    }
}

/// Layers setup overrides on top of a family's state.
///
/// A usable setup router replaces the state router; setup additional routes
/// come before the state ones.
fn merge_setup<A: Clone, R: Clone>(
    router: &mut Option<A>,
    additional_routes: &mut Vec<R>,
    setup: Option<&SetupOverride<A, R>>,
    is_usable: impl Fn(&A) -> bool,
) {
    let Some(setup) = setup else {
        return;
    };
    if let Some(setup_router) = setup.router.as_ref().filter(|r| is_usable(r)) {
        *router = Some(setup_router.clone());
    }
    if !setup.additional_routes.is_empty() {
        let mut merged = setup.additional_routes.clone();
        merged.append(additional_routes);
        *additional_routes = merged;
    }
}

/// Returns the service's IPv4 configuration with setup overrides applied.
pub fn effective_ipv4(config: &ServiceConfig) -> Option<Ipv4Config> {
    let mut ipv4 = config.ipv4.clone()?;
    merge_setup(
        &mut ipv4.router,
        &mut ipv4.additional_routes,
        config.ipv4_setup.as_ref(),
        |router| !router.is_unspecified(),
    );
    Some(ipv4)
}

/// Returns the service's IPv6 configuration with setup overrides applied.
pub fn effective_ipv6(config: &ServiceConfig) -> Option<Ipv6Config> {
    let mut ipv6 = config.ipv6.clone()?;
    merge_setup(
        &mut ipv6.router,
        &mut ipv6.additional_routes,
        config.ipv6_setup.as_ref(),
        |router| !router.is_unspecified(),
    );
    Some(ipv6)
}

/// Rank classes derived from a service's assertion.
struct RankClasses {
    /// Rank of the default route.
    primary: RankAssertion,
    /// Rank of every other route.
    rank: RankAssertion,
    scoped_only: bool,
    /// `Scoped` and `Never` scope the default route.
    scope_default: bool,
}

impl RankClasses {
    fn from_primary(primary: RankAssertion) -> Self {
        match primary {
            RankAssertion::Scoped => Self {
                primary: RankAssertion::Never,
                rank: RankAssertion::Never,
                scoped_only: true,
                scope_default: true,
            },
            RankAssertion::Never => Self {
                primary: RankAssertion::Never,
                rank: RankAssertion::Last,
                scoped_only: false,
                scope_default: true,
            },
            other => Self {
                primary: other,
                rank: other,
                scoped_only: false,
                scope_default: false,
            },
        }
    }
}
