//! IPv4 service route list.

use ipmon_types::{Ipv4Address, Rank, RankAssertion};
use log::{debug, info, warn};

use super::{RankClasses, LOOPBACK_IFNAME};
use crate::config::{Ipv4Config, Ipv4RouteSpec};
use crate::kernel::InterfaceTable;
use crate::route::{Ipv4Route, Ipv4RouteList, RouteFlags, RouteListFlags};

const MULTICAST: Ipv4Address = Ipv4Address::new(224, 0, 0, 0);

/// Builds the route list an IPv4 service contributes to the election.
///
/// Returns `None` when the service has no usable interface or address.
/// Routes are produced in a fixed order: default, broadcast and multicast,
/// subnet, router host route, additional routes, excluded routes.
pub fn build_ipv4_routes(
    config: &Ipv4Config,
    rank_assertion: Option<RankAssertion>,
    interfaces: &dyn InterfaceTable,
) -> Option<Ipv4RouteList> {
    let ifname = config.interface_name.as_deref()?;
    let ifindex = interfaces.index_for(ifname).filter(|&index| index != 0)?;
    let allow_additional = config
        .confirmed_interface_name
        .as_deref()
        .map_or(true, |confirmed| confirmed == ifname);

    let addr = config.addresses.first().copied().unwrap_or_default();
    let mask = config.subnet_masks.first().copied().unwrap_or_default();
    let mut subnet = None;
    if let (Some(_), Some(first_mask)) = (config.addresses.first(), config.subnet_masks.first()) {
        match first_mask.mask_prefix_len() {
            Ok(prefix_length) => subnet = Some((addr.and_mask(*first_mask), prefix_length)),
            Err(_) => info!("Builder: {} ignoring bad subnet mask {}", ifname, first_mask),
        }
    }
    if addr.is_unspecified() {
        return None;
    }

    let router = config
        .router
        .or_else(|| config.dest_addresses.first().copied())
        .unwrap_or_default();
    let is_loopback = interfaces.index_for(LOOPBACK_IFNAME) == Some(ifindex);

    let mut flags = RouteFlags::NONE;
    let mut primary = rank_assertion.unwrap_or_default();
    if router.is_unspecified() {
        // Without a router the service can't be primary.
        if !matches!(
            primary,
            RankAssertion::Last | RankAssertion::Never | RankAssertion::Scoped
        ) {
            primary = RankAssertion::Last;
        }
    } else {
        if !(addr == router && mask != Ipv4Address::BROADCAST) {
            flags |= RouteFlags::HAS_GATEWAY;
        }
        if rank_assertion.is_none() && config.override_primary {
            primary = RankAssertion::First;
        }
    }
    if config.is_null {
        flags |= RouteFlags::IS_NULL;
    }
    let classes = RankClasses::from_primary(primary);
    if classes.scope_default {
        flags |= RouteFlags::IS_SCOPED;
    }
    let rank = Rank::from_assertion(classes.rank);
    let null_flag = flags.intersection(RouteFlags::IS_NULL);

    let mut list = Ipv4RouteList::new();
    if config.is_null {
        list.flags |= RouteListFlags::EXCLUDE_NWI;
    } else if classes.scoped_only {
        list.flags |= RouteListFlags::SCOPED_ONLY;
    }

    if !is_loopback && !router.is_unspecified() {
        let gateway = if flags.contains(RouteFlags::HAS_GATEWAY) { router } else { addr };
        list.push(
            Ipv4Route::new(Ipv4Address::UNSPECIFIED, 0)
                .with_ifindex(ifindex)
                .with_ifa(addr)
                .with_gateway(gateway)
                .with_rank(Rank::from_assertion(classes.primary))
                .with_flags(flags),
        );
        list.flags |= RouteListFlags::HAS_DEFAULT;
    }

    if !is_loopback {
        for (dest, prefix_length) in [(Ipv4Address::BROADCAST, 32), (MULTICAST, 4)] {
            list.push(
                Ipv4Route::new(dest, prefix_length)
                    .with_ifindex(ifindex)
                    .with_ifa(addr)
                    .with_rank(rank)
                    .with_flags(null_flag),
            );
        }
    }

    if let Some((dest, prefix_length)) = subnet {
        list.push(
            Ipv4Route::new(dest, prefix_length)
                .with_ifindex(ifindex)
                .with_gateway(addr)
                .with_ifa(addr)
                .with_rank(rank)
                .with_flags(null_flag),
        );
    }

    if flags.contains(RouteFlags::HAS_GATEWAY) {
        list.push(
            Ipv4Route::new(router, 32)
                .with_ifindex(ifindex)
                .with_gateway(addr)
                .with_ifa(addr)
                .with_rank(rank)
                .with_flags(null_flag),
        );
    }

    if allow_additional {
        for spec in &config.additional_routes {
            if let Some(route) = spec_route(ifname, spec) {
                list.push(
                    route
                        .with_ifindex(ifindex)
                        .with_ifa(addr)
                        .with_rank(rank),
                );
            }
        }
        for spec in &config.excluded_routes {
            if let Some(route) = excluded_route(ifname, ifindex, spec, interfaces) {
                list.push(route.with_rank(rank));
            }
        }
    }

    debug!("Builder: {} IPv4 routes {}", ifname, list);
    Some(list)
}

/// Turns one configured route into an unbound route.
///
/// The destination is taken as given; the mask must be contiguous.
fn spec_route(ifname: &str, spec: &Ipv4RouteSpec) -> Option<Ipv4Route> {
    let (Some(dest), Some(mask)) = (spec.destination_address, spec.subnet_mask) else {
        warn!("Builder: {} route is invalid: {:?}", ifname, spec);
        return None;
    };
    let Ok(prefix_length) = mask.mask_prefix_len() else {
        warn!("Builder: {} route has invalid subnet mask {}", ifname, mask);
        return None;
    };
    let mut route = Ipv4Route::new(dest, prefix_length);
    if let Some(gateway) = spec.gateway_address {
        route = route.with_gateway(gateway).with_flags(RouteFlags::HAS_GATEWAY);
        if prefix_length == 32 {
            route = route.with_flags(RouteFlags::IS_HOST);
        }
    }
    Some(route)
}

/// Turns one configured excluded route into an exclusion of `ifindex`.
fn excluded_route(
    ifname: &str,
    ifindex: u32,
    spec: &Ipv4RouteSpec,
    interfaces: &dyn InterfaceTable,
) -> Option<Ipv4Route> {
    let (Some(dest), Some(mask)) = (spec.destination_address, spec.subnet_mask) else {
        warn!("Builder: {} excluded route is invalid: {:?}", ifname, spec);
        return None;
    };
    let Ok(prefix_length) = mask.mask_prefix_len() else {
        warn!("Builder: {} excluded route has invalid subnet mask {}", ifname, mask);
        return None;
    };
    let mut route = Ipv4Route::new(dest, prefix_length).with_exclude_ifindex(ifindex);
    if let Some(via) = spec.interface_name.as_deref() {
        let Some(via_index) = interfaces.index_for(via).filter(|&index| index != 0) else {
            warn!("Builder: {} excluded route interface {} does not exist", ifname, via);
            return None;
        };
        if via_index == ifindex {
            warn!("Builder: {} excluded route can't use its own interface", ifname);
            return None;
        }
        route = route.with_ifindex(via_index);
    }
    Some(route)
}

/// Multicast route over loopback, installed when no service provides one.
pub fn multicast_loopback_routes(interfaces: &dyn InterfaceTable) -> Option<Ipv4RouteList> {
    let ifindex = interfaces.index_for(LOOPBACK_IFNAME).filter(|&index| index != 0)?;
    let mut list = Ipv4RouteList::with_capacity(1);
    list.push(
        Ipv4Route::new(MULTICAST, 24)
            .with_ifindex(ifindex)
            .with_rank(Rank::from_raw(0)),
    );
    Some(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::StaticInterfaces;
    use crate::route::{Ipv4, Route};
    use pretty_assertions::assert_eq;

    fn interfaces() -> StaticInterfaces {
        StaticInterfaces::new().with("lo0", 1).with("en0", 4).with("en1", 5)
    }

    fn en0_config() -> Ipv4Config {
        Ipv4Config {
            interface_name: Some("en0".to_string()),
            addresses: vec![Ipv4Address::new(10, 0, 0, 2)],
            subnet_masks: vec![Ipv4Address::new(255, 255, 255, 0)],
            router: Some(Ipv4Address::new(10, 0, 0, 1)),
            ..Default::default()
        }
    }

    fn dests(list: &Ipv4RouteList) -> Vec<String> {
        list.iter()
            .map(|r| format!("{}/{}", r.dest, r.prefix_length))
            .collect()
    }

    #[test]
    fn test_basic_service() {
        let list = build_ipv4_routes(&en0_config(), None, &interfaces()).unwrap();
        assert_eq!(
            dests(&list),
            vec![
                "0.0.0.0/0",
                "255.255.255.255/32",
                "224.0.0.0/4",
                "10.0.0.0/24",
                "10.0.0.1/32"
            ]
        );
        assert!(list.has_default());

        let default = list.first().unwrap();
        assert_eq!(default.gateway, Ipv4Address::new(10, 0, 0, 1));
        assert_eq!(default.ifa, Ipv4Address::new(10, 0, 0, 2));
        assert_eq!(default.ifindex, 4);
        assert_eq!(default.flags, RouteFlags::HAS_GATEWAY);
        assert_eq!(default.rank_assertion(), RankAssertion::Default);

        let subnet = &list.routes()[3];
        assert_eq!(subnet.gateway, Ipv4Address::new(10, 0, 0, 2));
        assert_eq!(subnet.flags, RouteFlags::NONE);

        let router = &list.routes()[4];
        assert_eq!(router.gateway, Ipv4Address::new(10, 0, 0, 2));
        assert!(!router.flags.contains(RouteFlags::IS_HOST));
    }

    #[test]
    fn test_requires_interface_and_address() {
        let mut config = en0_config();
        config.interface_name = Some("en9".to_string());
        assert!(build_ipv4_routes(&config, None, &interfaces()).is_none());

        let mut config = en0_config();
        config.addresses.clear();
        assert!(build_ipv4_routes(&config, None, &interfaces()).is_none());

        let mut config = en0_config();
        config.interface_name = None;
        assert!(build_ipv4_routes(&config, None, &interfaces()).is_none());
    }

    #[test]
    fn test_no_router_demotes_to_last() {
        let mut config = en0_config();
        config.router = None;
        let list = build_ipv4_routes(&config, Some(RankAssertion::First), &interfaces()).unwrap();
        assert!(!list.has_default());
        assert_eq!(dests(&list), vec!["255.255.255.255/32", "224.0.0.0/4", "10.0.0.0/24"]);
        assert!(list.iter().all(|r| r.rank_assertion() == RankAssertion::Last));
    }

    #[test]
    fn test_dest_address_used_as_router() {
        let mut config = en0_config();
        config.router = None;
        config.dest_addresses = vec![Ipv4Address::new(10, 0, 0, 9)];
        let list = build_ipv4_routes(&config, None, &interfaces()).unwrap();
        assert_eq!(list.first().unwrap().gateway, Ipv4Address::new(10, 0, 0, 9));
    }

    #[test]
    fn test_router_equals_address_is_direct() {
        let mut config = en0_config();
        config.router = Some(Ipv4Address::new(10, 0, 0, 2));
        let list = build_ipv4_routes(&config, None, &interfaces()).unwrap();
        let default = list.first().unwrap();
        assert!(!default.has_gateway());
        assert_eq!(default.gateway, Ipv4Address::new(10, 0, 0, 2));
        // No router host route without a gateway.
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn test_override_primary() {
        let mut config = en0_config();
        config.override_primary = true;
        let list = build_ipv4_routes(&config, None, &interfaces()).unwrap();
        assert_eq!(list.first().unwrap().rank_assertion(), RankAssertion::First);

        // An explicit assertion wins over the override.
        let list = build_ipv4_routes(&config, Some(RankAssertion::Last), &interfaces()).unwrap();
        assert_eq!(list.first().unwrap().rank_assertion(), RankAssertion::Last);
    }

    #[test]
    fn test_never_scopes_default() {
        let list = build_ipv4_routes(&en0_config(), Some(RankAssertion::Never), &interfaces()).unwrap();
        let default = list.first().unwrap();
        assert!(default.is_scoped());
        assert_eq!(default.rank_assertion(), RankAssertion::Never);
        assert_eq!(list.routes()[3].rank_assertion(), RankAssertion::Last);
        assert_eq!(list.flags, RouteListFlags::HAS_DEFAULT);
    }

    #[test]
    fn test_scoped_only() {
        let list = build_ipv4_routes(&en0_config(), Some(RankAssertion::Scoped), &interfaces()).unwrap();
        assert!(list.flags.contains(RouteListFlags::SCOPED_ONLY));
        assert!(list.first().unwrap().is_scoped());
        assert!(list.iter().all(|r| r.rank_assertion() == RankAssertion::Never));
    }

    #[test]
    fn test_null_service() {
        let mut config = en0_config();
        config.is_null = true;
        let list = build_ipv4_routes(&config, Some(RankAssertion::Scoped), &interfaces()).unwrap();
        assert!(list.flags.contains(RouteListFlags::EXCLUDE_NWI));
        assert!(!list.flags.contains(RouteListFlags::SCOPED_ONLY));
        assert!(list.iter().all(|r| r.flags.contains(RouteFlags::IS_NULL)));
    }

    #[test]
    fn test_bad_subnet_mask_skips_subnet() {
        let mut config = en0_config();
        config.subnet_masks = vec![Ipv4Address::new(255, 0, 255, 0)];
        let list = build_ipv4_routes(&config, None, &interfaces()).unwrap();
        assert_eq!(
            dests(&list),
            vec!["0.0.0.0/0", "255.255.255.255/32", "224.0.0.0/4", "10.0.0.1/32"]
        );
    }

    #[test]
    fn test_loopback_has_no_default() {
        let config = Ipv4Config {
            interface_name: Some("lo0".to_string()),
            addresses: vec![Ipv4Address::LOCALHOST],
            subnet_masks: vec![Ipv4Address::new(255, 0, 0, 0)],
            router: Some(Ipv4Address::LOCALHOST),
            ..Default::default()
        };
        let list = build_ipv4_routes(&config, None, &interfaces()).unwrap();
        assert!(!list.has_default());
        assert_eq!(dests(&list), vec!["127.0.0.0/8"]);
    }

    #[test]
    fn test_additional_routes() {
        let mut config = en0_config();
        config.additional_routes = vec![
            Ipv4RouteSpec {
                destination_address: Some(Ipv4Address::new(192, 168, 7, 0)),
                subnet_mask: Some(Ipv4Address::new(255, 255, 255, 0)),
                ..Default::default()
            },
            Ipv4RouteSpec {
                destination_address: Some(Ipv4Address::new(192, 168, 9, 9)),
                subnet_mask: Some(Ipv4Address::BROADCAST),
                gateway_address: Some(Ipv4Address::new(10, 0, 0, 7)),
                ..Default::default()
            },
            // Missing mask.
            Ipv4RouteSpec {
                destination_address: Some(Ipv4Address::new(192, 168, 10, 0)),
                ..Default::default()
            },
            // Non-contiguous mask.
            Ipv4RouteSpec {
                destination_address: Some(Ipv4Address::new(192, 168, 11, 0)),
                subnet_mask: Some(Ipv4Address::new(255, 0, 255, 0)),
                ..Default::default()
            },
        ];
        let list = build_ipv4_routes(&config, None, &interfaces()).unwrap();
        assert_eq!(list.len(), 7);

        let plain = &list.routes()[5];
        assert_eq!(plain.ifindex, 4);
        assert_eq!(plain.ifa, Ipv4Address::new(10, 0, 0, 2));
        assert_eq!(plain.flags, RouteFlags::NONE);

        let host = &list.routes()[6];
        assert_eq!(host.flags, RouteFlags::HAS_GATEWAY | RouteFlags::IS_HOST);
        assert_eq!(host.gateway, Ipv4Address::new(10, 0, 0, 7));
    }

    #[test]
    fn test_unconfirmed_interface_skips_additional() {
        let mut config = en0_config();
        config.confirmed_interface_name = Some("en1".to_string());
        config.additional_routes = vec![Ipv4RouteSpec {
            destination_address: Some(Ipv4Address::new(192, 168, 7, 0)),
            subnet_mask: Some(Ipv4Address::new(255, 255, 255, 0)),
            ..Default::default()
        }];
        let list = build_ipv4_routes(&config, None, &interfaces()).unwrap();
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn test_excluded_routes() {
        let mut config = en0_config();
        config.excluded_routes = vec![
            Ipv4RouteSpec {
                destination_address: Some(Ipv4Address::new(17, 0, 0, 0)),
                subnet_mask: Some(Ipv4Address::new(255, 0, 0, 0)),
                ..Default::default()
            },
            Ipv4RouteSpec {
                destination_address: Some(Ipv4Address::new(18, 0, 0, 0)),
                subnet_mask: Some(Ipv4Address::new(255, 0, 0, 0)),
                interface_name: Some("en1".to_string()),
                ..Default::default()
            },
            Ipv4RouteSpec {
                destination_address: Some(Ipv4Address::new(19, 0, 0, 0)),
                subnet_mask: Some(Ipv4Address::new(255, 0, 0, 0)),
                interface_name: Some("en7".to_string()),
                ..Default::default()
            },
            Ipv4RouteSpec {
                destination_address: Some(Ipv4Address::new(20, 0, 0, 0)),
                subnet_mask: Some(Ipv4Address::new(255, 0, 0, 0)),
                interface_name: Some("en0".to_string()),
                ..Default::default()
            },
        ];
        let list = build_ipv4_routes(&config, None, &interfaces()).unwrap();
        assert_eq!(list.len(), 7);

        let unbound = &list.routes()[5];
        assert_eq!(unbound.exclude_ifindex, 4);
        assert_eq!(unbound.ifindex, 0);
        assert!(unbound.ifa.is_unspecified());

        let pinned = &list.routes()[6];
        assert_eq!(pinned.exclude_ifindex, 4);
        assert_eq!(pinned.ifindex, 5);
    }

    #[test]
    fn test_additional_route_round_trip() {
        for prefix_length in 0..=32u8 {
            let dest = Ipv4Address::new(10, 200, 3, 4);
            let mask = Ipv4Address::from_prefix_len(prefix_length);
            let gateway = Ipv4Address::new(10, 0, 0, 254);
            let mut config = en0_config();
            config.additional_routes = vec![Ipv4RouteSpec {
                destination_address: Some(dest),
                subnet_mask: Some(mask),
                gateway_address: Some(gateway),
                interface_name: None,
            }];
            let list = build_ipv4_routes(&config, None, &interfaces()).unwrap();
            let route: &Route<Ipv4> = list.routes().last().unwrap();
            assert_eq!(route.dest, dest);
            assert_eq!(Ipv4Address::from_prefix_len(route.prefix_length), mask);
            assert_eq!(route.gateway, gateway);
        }
    }

    #[test]
    fn test_multicast_loopback() {
        let list = multicast_loopback_routes(&interfaces()).unwrap();
        let route = list.first().unwrap();
        assert_eq!(route.dest, MULTICAST);
        assert_eq!(route.prefix_length, 24);
        assert_eq!(route.ifindex, 1);
        assert!(multicast_loopback_routes(&StaticInterfaces::new()).is_none());
    }
}
