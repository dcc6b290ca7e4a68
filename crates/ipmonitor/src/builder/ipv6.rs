//! IPv6 service route list.

use ipmon_types::{Ipv6Address, Rank, RankAssertion};
use log::{debug, warn};

use super::{RankClasses, LOOPBACK_IFNAME};
use crate::config::{Ipv6Config, Ipv6RouteSpec};
use crate::kernel::InterfaceTable;
use crate::route::{Ipv6Route, Ipv6RouteList, RouteFlags, RouteListFlags};

const LINK_LOCAL: Ipv6Address = Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 0);
const ALL_BITS: u32 = 128;

/// Builds the route list an IPv6 service contributes to the election.
///
/// Returns `None` when the service has no usable interface or address, or
/// when it has neither a router, a prefix nor any configured route. Routes
/// the kernel maintains itself are listed for ranking but flagged
/// `KERNEL_MANAGED`.
pub fn build_ipv6_routes(
    config: &Ipv6Config,
    rank_assertion: Option<RankAssertion>,
    interfaces: &dyn InterfaceTable,
) -> Option<Ipv6RouteList> {
    let ifname = config.interface_name.as_deref()?;
    let ifindex = interfaces.index_for(ifname).filter(|&index| index != 0)?;
    let allow_additional = config
        .confirmed_interface_name
        .as_deref()
        .map_or(true, |confirmed| confirmed == ifname);

    let addr = *config.addresses.first()?;
    if addr.is_unspecified() {
        return None;
    }
    let prefix_length = config
        .prefix_lengths
        .first()
        .copied()
        .filter(|&len| !addr.is_link_local() && len <= ALL_BITS)
        .and_then(|len| u8::try_from(len).ok());

    let router = config
        .router
        .or_else(|| config.dest_addresses.first().copied())
        .unwrap_or_default();
    let is_loopback = interfaces.index_for(LOOPBACK_IFNAME) == Some(ifindex);

    let mut flags = RouteFlags::NONE;
    let mut primary = rank_assertion.unwrap_or_default();
    let mut add_default = false;
    if !router.is_unspecified() {
        add_default = !is_loopback;
        let all_local = router == addr && u32::from(prefix_length.unwrap_or(0)) != ALL_BITS;
        if !all_local {
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

    let configured = if allow_additional {
        config.additional_routes.len() + config.excluded_routes.len()
    } else {
        0
    };
    if usize::from(add_default) + usize::from(prefix_length.is_some()) + configured == 0 {
        return None;
    }

    let mut list = Ipv6RouteList::new();
    if config.is_null {
        list.flags |= RouteListFlags::EXCLUDE_NWI;
    } else if classes.scoped_only {
        list.flags |= RouteListFlags::SCOPED_ONLY;
    }

    if add_default {
        let gateway = if flags.contains(RouteFlags::HAS_GATEWAY) { router } else { addr };
        list.push(
            Ipv6Route::new(Ipv6Address::UNSPECIFIED, 0)
                .with_ifindex(ifindex)
                .with_ifa(addr)
                .with_gateway(gateway)
                .with_rank(Rank::from_assertion(classes.primary))
                .with_flags(flags | RouteFlags::KERNEL_MANAGED),
        );
        list.flags |= RouteListFlags::HAS_DEFAULT;
    }

    list.push(
        Ipv6Route::new(LINK_LOCAL, 64)
            .with_ifindex(ifindex)
            .with_rank(rank)
            .with_flags(RouteFlags::KERNEL_MANAGED),
    );

    if let Some(prefix_length) = prefix_length {
        list.push(
            Ipv6Route::new(addr.masked(prefix_length), prefix_length)
                .with_ifindex(ifindex)
                .with_gateway(addr)
                .with_ifa(addr)
                .with_rank(rank)
                .with_flags(RouteFlags::KERNEL_MANAGED | flags.intersection(RouteFlags::IS_NULL)),
        );
    }

    if allow_additional {
        for spec in &config.additional_routes {
            if let Some(route) = spec_route(ifname, spec) {
                list.push(route.with_ifindex(ifindex).with_ifa(addr).with_rank(rank));
            }
        }
        for spec in &config.excluded_routes {
            if let Some(route) = excluded_route(ifname, ifindex, spec, interfaces) {
                list.push(route.with_rank(rank));
            }
        }
    }

    debug!("Builder: {} IPv6 routes {}", ifname, list);
    Some(list)
}

fn spec_prefix(ifname: &str, spec: &Ipv6RouteSpec) -> Option<(Ipv6Address, u8)> {
    match (spec.destination_address, spec.prefix_length) {
        (Some(dest), Some(len)) if len <= ALL_BITS => Some((dest, len as u8)),
        _ => {
            warn!("Builder: {} route is invalid: {:?}", ifname, spec);
            None
        }
    }
}

fn spec_route(ifname: &str, spec: &Ipv6RouteSpec) -> Option<Ipv6Route> {
    let (dest, prefix_length) = spec_prefix(ifname, spec)?;
    let mut route = Ipv6Route::new(dest, prefix_length);
    if let Some(gateway) = spec.gateway_address {
        route = route.with_gateway(gateway).with_flags(RouteFlags::HAS_GATEWAY);
        if u32::from(prefix_length) == ALL_BITS {
            route = route.with_flags(RouteFlags::IS_HOST);
        }
    }
    Some(route)
}

fn excluded_route(
    ifname: &str,
    ifindex: u32,
    spec: &Ipv6RouteSpec,
    interfaces: &dyn InterfaceTable,
) -> Option<Ipv6Route> {
    let (dest, prefix_length) = spec_prefix(ifname, spec)?;
    let mut route = Ipv6Route::new(dest, prefix_length).with_exclude_ifindex(ifindex);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::StaticInterfaces;
    use pretty_assertions::assert_eq;

    fn interfaces() -> StaticInterfaces {
        StaticInterfaces::new().with("lo0", 1).with("en0", 4).with("utun3", 9)
    }

    fn addr(last: u16) -> Ipv6Address {
        Ipv6Address::new(0x2001, 0xdb8, 0, 1, 0, 0, 0, last)
    }

    fn en0_config() -> Ipv6Config {
        Ipv6Config {
            interface_name: Some("en0".to_string()),
            addresses: vec![addr(2)],
            prefix_lengths: vec![64],
            router: Some(Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
            ..Default::default()
        }
    }

    fn dests(list: &Ipv6RouteList) -> Vec<String> {
        list.iter()
            .map(|r| format!("{}/{}", r.dest, r.prefix_length))
            .collect()
    }

    #[test]
    fn test_basic_service() {
        let list = build_ipv6_routes(&en0_config(), None, &interfaces()).unwrap();
        assert_eq!(dests(&list), vec!["::/0", "fe80::/64", "2001:db8:0:1::/64"]);
        assert!(list.has_default());
        assert!(list.iter().all(|r| r.flags.contains(RouteFlags::KERNEL_MANAGED)));

        let default = list.first().unwrap();
        assert_eq!(default.gateway, Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));
        assert_eq!(default.ifa, addr(2));
        assert!(default.has_gateway());

        let link_local = &list.routes()[1];
        assert!(link_local.ifa.is_unspecified());
        assert_eq!(link_local.ifindex, 4);

        let prefix = &list.routes()[2];
        assert_eq!(prefix.gateway, addr(2));
        assert_eq!(prefix.ifa, addr(2));
    }

    #[test]
    fn test_link_local_address_has_no_prefix_route() {
        let mut config = en0_config();
        config.addresses = vec![Ipv6Address::new(0xfe80, 0, 0, 0, 0, 0, 0, 2)];
        let list = build_ipv6_routes(&config, None, &interfaces()).unwrap();
        assert_eq!(dests(&list), vec!["::/0", "fe80::/64"]);

        // Nothing left to contribute without a router.
        config.router = None;
        assert!(build_ipv6_routes(&config, None, &interfaces()).is_none());
    }

    #[test]
    fn test_invalid_prefix_length() {
        let mut config = en0_config();
        config.prefix_lengths = vec![129];
        let list = build_ipv6_routes(&config, None, &interfaces()).unwrap();
        assert_eq!(dests(&list), vec!["::/0", "fe80::/64"]);
    }

    #[test]
    fn test_requires_address() {
        let mut config = en0_config();
        config.addresses.clear();
        assert!(build_ipv6_routes(&config, None, &interfaces()).is_none());

        config.addresses = vec![Ipv6Address::UNSPECIFIED];
        assert!(build_ipv6_routes(&config, None, &interfaces()).is_none());
    }

    #[test]
    fn test_no_router_keeps_assertion() {
        let mut config = en0_config();
        config.router = None;
        let list = build_ipv6_routes(&config, Some(RankAssertion::First), &interfaces()).unwrap();
        assert!(!list.has_default());
        assert!(list.iter().all(|r| r.rank_assertion() == RankAssertion::First));
    }

    #[test]
    fn test_point_to_point_router() {
        let config = Ipv6Config {
            interface_name: Some("utun3".to_string()),
            addresses: vec![addr(5)],
            prefix_lengths: vec![64],
            router: Some(addr(5)),
            ..Default::default()
        };
        let list = build_ipv6_routes(&config, Some(RankAssertion::Never), &interfaces()).unwrap();
        let default = list.first().unwrap();
        assert!(!default.has_gateway());
        assert_eq!(default.gateway, addr(5));
        assert!(default.is_scoped());
        assert_eq!(default.rank_assertion(), RankAssertion::Never);
        assert_eq!(list.routes()[1].rank_assertion(), RankAssertion::Last);
    }

    #[test]
    fn test_additional_and_excluded_routes() {
        let mut config = en0_config();
        config.additional_routes = vec![
            Ipv6RouteSpec {
                destination_address: Some(Ipv6Address::new(0x2001, 0xdb8, 0xff, 0, 0, 0, 0, 1)),
                prefix_length: Some(128),
                gateway_address: Some(addr(1)),
                interface_name: None,
            },
            Ipv6RouteSpec {
                destination_address: Some(Ipv6Address::new(0x2001, 0xdb8, 0xfe, 0, 0, 0, 0, 0)),
                prefix_length: Some(200),
                ..Default::default()
            },
        ];
        config.excluded_routes = vec![Ipv6RouteSpec {
            destination_address: Some(Ipv6Address::new(0x2001, 0xdb8, 0xaa, 0, 0, 0, 0, 0)),
            prefix_length: Some(48),
            interface_name: Some("utun3".to_string()),
            ..Default::default()
        }];
        let list = build_ipv6_routes(&config, None, &interfaces()).unwrap();
        assert_eq!(list.len(), 5);

        let host = &list.routes()[3];
        assert_eq!(host.flags, RouteFlags::HAS_GATEWAY | RouteFlags::IS_HOST);
        assert_eq!(host.ifa, addr(2));

        let excluded = &list.routes()[4];
        assert_eq!(excluded.exclude_ifindex, 4);
        assert_eq!(excluded.ifindex, 9);
    }

    #[test]
    fn test_null_service_prefix() {
        let mut config = en0_config();
        config.is_null = true;
        let list = build_ipv6_routes(&config, None, &interfaces()).unwrap();
        assert!(list.flags.contains(RouteListFlags::EXCLUDE_NWI));
        assert!(list.routes()[2].flags.contains(RouteFlags::IS_NULL));
        assert!(!list.routes()[1].flags.contains(RouteFlags::IS_NULL));
    }
}
