//! Applying route list differences to the kernel.

use log::{debug, info, warn};

use super::family::AddressFamily;
use super::list::{LookupMode, RouteList};
use super::types::{ControlFlags, Route, RouteFlags};
use crate::kernel::{self, Gateway, KernelError, RouteKernel, RouteMessage, RouteOp};

/// Maximum gateway recursion depth while adding a route.
pub const MAX_RECURSE_DEPTH: usize = 10;

/// Guards and serializes route writes before they reach the kernel.
pub struct KernelRouteWriter<'a> {
    kernel: &'a dyn RouteKernel,
    netboot: bool,
}

impl<'a> KernelRouteWriter<'a> {
    pub fn new(kernel: &'a dyn RouteKernel) -> Self {
        Self {
            kernel,
            netboot: false,
        }
    }

    /// Leaves the IPv4 default route alone when the system netbooted.
    pub fn with_netboot(mut self, netboot: bool) -> Self {
        self.netboot = netboot;
        self
    }

    /// Builds the kernel message for a route.
    pub fn message<F: AddressFamily>(route: &Route<F>, op: RouteOp) -> RouteMessage {
        let host = route.flags.contains(RouteFlags::IS_HOST);
        let has_gateway = route.has_gateway();
        let gateway = if has_gateway {
            Gateway::Address {
                addr: F::to_ip_address(&route.gateway),
                scope_id: F::scope_id(&route.gateway, route.ifindex),
            }
        } else {
            Gateway::Link(route.ifindex)
        };
        RouteMessage {
            op,
            dest: F::to_ip_address(&route.dest),
            dest_scope_id: F::scope_id(&route.dest, route.ifindex),
            netmask: (!host).then(|| F::netmask(route.prefix_length)),
            gateway,
            ifindex: route.ifindex,
            ifa: (!F::is_unspecified(&route.ifa)).then(|| F::to_ip_address(&route.ifa)),
            ifscope: route.is_scoped().then_some(route.ifindex),
            host,
            cloning: !host && !has_gateway,
            static_route: true,
        }
    }

    /// Writes one route, skipping routes that must not reach the kernel.
    pub fn write<F: AddressFamily>(&self, route: &Route<F>, op: RouteOp) -> kernel::Result<()> {
        if F::NETBOOT_PROTECTS_DEFAULT && self.netboot && F::is_unspecified(&route.dest) {
            return Err(KernelError::NotApplied);
        }
        if F::SKIPS_KERNEL_MANAGED && route.flags.contains(RouteFlags::KERNEL_MANAGED) {
            return Err(KernelError::NotApplied);
        }
        if route.flags.contains(RouteFlags::IS_NULL) {
            return Err(KernelError::NotApplied);
        }
        if route.ifindex == 0 {
            info!("RouteList: {} {} no interface specified", F::NAME, route);
            return Err(KernelError::NoInterface);
        }
        self.kernel.apply(&Self::message(route, op))
    }
}

impl<F: AddressFamily> RouteList<F> {
    /// Brings the kernel from `old` to `new`.
    ///
    /// Installed routes of `old` missing from `new` are removed. Routes of
    /// `new` already present in `old` inherit its control state unless they
    /// are forced. Every remaining route of `new` is added, after its
    /// gateway route.
    pub fn apply(old: Option<&RouteList<F>>, new: Option<&mut RouteList<F>>, writer: &KernelRouteWriter<'_>) {
        if let Some(old) = old {
            for route in old.iter() {
                let kept = new.as_ref().is_some_and(|new| new.find(route).is_some());
                if !kept && route.control_flags.contains(ControlFlags::ADDED) {
                    remove_route(route, writer);
                }
            }
        }
        let Some(new) = new else {
            return;
        };
        if let Some(old) = old {
            for route in new.routes_mut() {
                let Some(old_index) = old.find(route) else {
                    continue;
                };
                if route.control_flags.contains(ControlFlags::FORCE) {
                    info!("RouteList: {} {} Re-applying route", F::NAME, route);
                } else {
                    route.control_flags = old.routes()[old_index].control_flags.preserved();
                }
            }
        }
        for index in 0..new.len() {
            if new.routes()[index].control_flags.contains(ControlFlags::PROCESSED) {
                continue;
            }
            add_route(new, index, 0, writer);
        }
    }
}

fn remove_route<F: AddressFamily>(route: &Route<F>, writer: &KernelRouteWriter<'_>) {
    match writer.write(route, RouteOp::Delete) {
        Ok(()) | Err(KernelError::NotFound) | Err(KernelError::NotApplied) => {
            debug!("RouteList: {} removed {}", F::NAME, route);
        }
        Err(e) => {
            warn!("RouteList: {} failed to remove route, {}: {}", F::NAME, e, route);
        }
    }
}

/// Adds `routes[index]`, first adding the route to its gateway.
///
/// Returns false if the route could not be added because its gateway route
/// failed or the gateway chain is too deep.
fn add_route<F: AddressFamily>(
    routes: &mut RouteList<F>,
    index: usize,
    depth: usize,
    writer: &KernelRouteWriter<'_>,
) -> bool {
    let route = &mut routes.routes_mut()[index];
    if route.control_flags.contains(ControlFlags::PROCESSED) {
        return route.control_flags.contains(ControlFlags::ADDED);
    }
    route.control_flags.insert(ControlFlags::PROCESSED);

    if route.has_gateway() {
        let (gateway, ifindex) = (route.gateway, route.ifindex);
        match routes.lookup(&gateway, F::ALL_BITS, ifindex, LookupMode::MatchInterface) {
            None => {
                info!("RouteList: {} {} no gateway route", F::NAME, routes.routes()[index]);
            }
            Some(gateway_index) => {
                if depth == MAX_RECURSE_DEPTH {
                    warn!(
                        "RouteList: {} {} routing loop detected, not adding",
                        F::NAME,
                        routes.routes()[index]
                    );
                    return false;
                }
                if !add_route(routes, gateway_index, depth + 1, writer) {
                    warn!("RouteList: {} {} failed to add", F::NAME, routes.routes()[index]);
                    return false;
                }
            }
        }
    }

    let route = &routes.routes()[index];
    let mut result = writer.write(route, RouteOp::Add);
    if result == Err(KernelError::Exists) {
        let _ = writer.write(route, RouteOp::Delete);
        result = writer.write(route, RouteOp::Add);
    }
    match result {
        Ok(()) | Err(KernelError::NotApplied) => {
            debug!("RouteList: {} added {}", F::NAME, route);
            routes.routes_mut()[index]
                .control_flags
                .insert(ControlFlags::ADDED);
        }
        Err(e) => {
            warn!("RouteList: {} failed to add route, {}: {}", F::NAME, e, route);
        }
    }
    true
}
