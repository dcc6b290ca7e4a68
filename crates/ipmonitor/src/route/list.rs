//! Ranked route list and the merge algorithm.
//!
//! A [`RouteList`] stays sorted by destination, prefix length and then rank.
//! Merging the per-service lists of every candidate in any order yields the
//! same aggregate list: duplicates on the same interface collapse into one
//! entry, and when two interfaces reach the same destination the worse one
//! is marked scoped.

use ipmon_types::{Rank, RankAssertion};
use log::{debug, warn};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

use super::family::AddressFamily;
use super::types::{ControlFlags, Route, RouteFlags, RouteListFlags};

/// Which route, if any, receives `IS_SCOPED` after an insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    None,
    This,
    Next,
}

/// How [`RouteList::lookup`] treats the interface index argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// Only consider routes over the given interface.
    MatchInterface,
    /// Only consider routes over any other interface.
    ExcludeInterface,
}

/// Ordered list of routes for one address family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(bound = "")]
pub struct RouteList<F: AddressFamily> {
    pub flags: RouteListFlags,
    routes: Vec<Route<F>>,
}

impl<F: AddressFamily> Default for RouteList<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Three-way comparison of `a` (ranked `a_rank`) against `b`.
///
/// The second value is true when both routes reach the same destination and
/// prefix over different interfaces; such routes are ordered by rank.
fn compare_routes<F: AddressFamily>(
    a: &Route<F>,
    a_rank: Rank,
    b: &Route<F>,
    b_rank: Rank,
) -> (Ordering, bool) {
    let cmp = F::compare(&a.dest, &b.dest).then(a.prefix_length.cmp(&b.prefix_length));
    if cmp != Ordering::Equal {
        return (cmp, false);
    }
    if a.ifindex == b.ifindex {
        return (Ordering::Equal, false);
    }
    if (a.ifindex == 0 || b.ifindex == 0) && !a.is_scoped() && !b.is_scoped() {
        // Unbound and unscoped: treat as the same route so it collapses.
        return (Ordering::Equal, false);
    }
    (a_rank.cmp(&b_rank).then(a.ifindex.cmp(&b.ifindex)), true)
}

impl<F: AddressFamily> RouteList<F> {
    pub fn new() -> Self {
        Self {
            flags: RouteListFlags::NONE,
            routes: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            flags: RouteListFlags::NONE,
            routes: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> &[Route<F>] {
        &self.routes
    }

    pub(crate) fn routes_mut(&mut self) -> &mut [Route<F>] {
        &mut self.routes
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Route<F>> {
        self.routes.iter()
    }

    pub fn first(&self) -> Option<&Route<F>> {
        self.routes.first()
    }

    pub fn has_default(&self) -> bool {
        self.flags.contains(RouteListFlags::HAS_DEFAULT)
    }

    /// Appends a route without merging. Used while building a service list.
    pub fn push(&mut self, route: Route<F>) {
        self.routes.push(route);
    }

    /// Returns the index of the first route equal to `route` for kernel
    /// purposes.
    pub fn find(&self, route: &Route<F>) -> Option<usize> {
        self.routes.iter().position(|scan| scan.same_route(route))
    }

    /// Merges one route into the list with the given rank.
    ///
    /// Exact duplicates on the same interface are dropped, a better route
    /// replaces a worse or excluded one in place, and the worse of two
    /// routes to the same destination over different interfaces is scoped.
    pub fn add_route(&mut self, route: &Route<F>, rank: Rank, force: bool) {
        let mut first_same_dest_scoped: Option<bool> = None;
        let mut scope_which = Scope::None;
        let mut insert_at: Option<usize> = None;

        let mut i = 0;
        while i < self.routes.len() {
            let scan = &self.routes[i];
            let (cmp, same_dest) = compare_routes(route, rank, scan, scan.rank);
            if same_dest && first_same_dest_scoped.is_none() {
                first_same_dest_scoped = Some(scan.is_scoped());
            }
            match cmp {
                Ordering::Less => {
                    if insert_at.is_none() {
                        if same_dest && first_same_dest_scoped == Some(false) {
                            scope_which = if scan.is_scoped() {
                                Scope::This
                            } else {
                                Scope::Next
                            };
                        }
                        // Keep going to find a duplicate further down.
                        insert_at = Some(i);
                    }
                }
                Ordering::Equal => {
                    if insert_at.is_some()
                        && scan.ifindex == route.ifindex
                        && scan.exclude_ifindex == 0
                        && route.exclude_ifindex == 0
                    {
                        debug!("RouteList: removing duplicate [{}] {}", i, scan);
                        self.routes.remove(i);
                        break;
                    }
                    if route.exclude_ifindex == 0 && (scan.exclude_ifindex != 0 || rank < scan.rank) {
                        self.replace_at(i, route, rank, force);
                    }
                    return;
                }
                Ordering::Greater => {
                    if same_dest && scope_which == Scope::None {
                        scope_which = Scope::This;
                    }
                }
            }
            i += 1;
        }

        let mut new_route = route.clone();
        new_route.rank = rank;
        if force {
            new_route.control_flags.insert(ControlFlags::FORCE);
        }
        let index = match insert_at {
            Some(index) => {
                self.routes.insert(index, new_route);
                index
            }
            None => {
                self.routes.push(new_route);
                self.routes.len() - 1
            }
        };

        let mut flags = RouteFlags::NONE;
        if rank.assertion() == RankAssertion::Never {
            flags.insert(RouteFlags::IS_SCOPED);
        }
        let target = match scope_which {
            Scope::None => Some(index),
            Scope::This => {
                flags.insert(RouteFlags::IS_SCOPED);
                Some(index)
            }
            Scope::Next => {
                flags.insert(RouteFlags::IS_SCOPED);
                (index + 1 < self.routes.len()).then_some(index + 1)
            }
        };
        if let Some(target) = target {
            if !flags.is_empty() {
                self.routes[target].flags.insert(flags);
            }
        }
    }

    fn replace_at(&mut self, index: usize, route: &Route<F>, rank: Rank, force: bool) {
        let scan = &mut self.routes[index];
        if rank < scan.rank {
            debug!("RouteList: replacing [{}] rank {} < {}", index, rank, scan.rank);
        } else {
            debug!("RouteList: replacing [{}] excluded route", index);
        }
        let was_scoped = scan.is_scoped();
        let ifindex = if scan.ifindex != 0 {
            scan.ifindex
        } else {
            route.ifindex
        };
        *scan = route.clone();
        scan.rank = rank;
        scan.ifindex = ifindex;
        scan.exclude_ifindex = 0;
        if was_scoped {
            scan.flags.insert(RouteFlags::IS_SCOPED);
        }
        if force {
            scan.control_flags.insert(ControlFlags::FORCE);
        }
    }

    /// Merges every route of a service's list.
    ///
    /// The default route (the first route of a list with `HAS_DEFAULT`)
    /// takes `rank` unchanged; every other route keeps its own assertion
    /// under `rank`'s index.
    pub fn add_route_list(&mut self, service_routes: &RouteList<F>, rank: Rank, force: bool) {
        for (i, route) in service_routes.routes.iter().enumerate() {
            let this_rank = if i == 0 && service_routes.has_default() {
                rank
            } else {
                Rank::new(rank.index(), route.rank.assertion())
            };
            self.add_route(route, this_rank, force);
        }
    }

    /// Finds the best route to reach `addr/n_bits`.
    ///
    /// Unbound and excluded routes are ignored, as are routes whose gateway
    /// is `addr` itself. Host routes only satisfy an exact all-bits lookup.
    /// A route with exactly `n_bits` wins outright; otherwise the longest
    /// covering prefix wins.
    pub fn lookup(&self, addr: &F::Addr, n_bits: u8, ifindex: u32, mode: LookupMode) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, scan) in self.routes.iter().enumerate() {
            if scan.ifindex == 0 || scan.exclude_ifindex != 0 {
                continue;
            }
            match mode {
                LookupMode::ExcludeInterface if scan.ifindex == ifindex => continue,
                LookupMode::MatchInterface if scan.ifindex != ifindex => continue,
                _ => {}
            }
            if scan.has_gateway() && scan.gateway == *addr {
                continue;
            }
            if scan.flags.contains(RouteFlags::IS_HOST) {
                if n_bits == F::ALL_BITS && scan.dest == *addr {
                    return Some(i);
                }
                continue;
            }
            if !F::same_subnet(&scan.dest, scan.prefix_length, addr) {
                continue;
            }
            if scan.prefix_length == n_bits {
                return Some(i);
            }
            if scan.prefix_length > n_bits {
                continue;
            }
            let longer = best.map_or(true, |b| scan.prefix_length > self.routes[b].prefix_length);
            if longer {
                best = Some(i);
            }
        }
        best
    }

    /// Resolves excluded routes.
    ///
    /// An excluded route without an interface is resolved through the best
    /// route over any other interface; one pinned to an interface is
    /// resolved through that interface. The resolved route's interface and
    /// gateway are copied in.
    pub fn finalize(&mut self) {
        for i in 0..self.routes.len() {
            let scan = &self.routes[i];
            if scan.exclude_ifindex == 0 {
                continue;
            }
            let (ifindex, mode) = if scan.ifindex == 0 {
                (scan.exclude_ifindex, LookupMode::ExcludeInterface)
            } else {
                (scan.ifindex, LookupMode::MatchInterface)
            };
            let Some(found) = self.lookup(&scan.dest, scan.prefix_length, ifindex, mode) else {
                warn!("RouteList: {} can't resolve excluded route", scan);
                continue;
            };
            let resolved = self.routes[found].clone();
            debug!("RouteList: excluded route {} resolved to {}", self.routes[i], resolved);

            let scan = &mut self.routes[i];
            scan.ifindex = resolved.ifindex;
            if resolved.has_gateway() {
                scan.gateway = resolved.gateway;
                scan.flags.insert(RouteFlags::HAS_GATEWAY);
                if scan.prefix_length == F::ALL_BITS {
                    scan.flags.insert(RouteFlags::IS_HOST);
                }
            } else {
                scan.flags.remove(RouteFlags::HAS_GATEWAY | RouteFlags::IS_HOST);
            }
        }
    }
}

impl<F: AddressFamily> fmt::Display for RouteList<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}RouteList[{}]> = {{", F::NAME, self.routes.len())?;
        for (i, route) in self.routes.iter().enumerate() {
            write!(f, "\n  {}. {}", i, route)?;
        }
        f.write_str("\n}")
    }
}
