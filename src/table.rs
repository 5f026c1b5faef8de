use std::fmt::Write;

use log::debug;

use crate::nexthop::{NexthopTable, DEFAULT_NEXTHOP};
use crate::radix::{LeafRef, RadixTree, WalkAction, WalkOutcome};
use crate::types::errors::RouteStoreError;
use crate::types::stats::TableStatus;
use crate::types::{AddressFamily, Route};

//------------ RouteTable ----------------------------------------------------

/// The authoritative route table: a radix tree of prefixes over an
/// interned nexthop table.
///
/// This is both a complete lookup engine in its own right (longest-match
/// in O(W) with cheap updates) and the backend that the accelerated
/// engines expand their tables from. Routed tree leaves hold nexthop
/// handles; the default route is the `0/0` leaf, whose handle 0 resolves
/// through the permanently reserved nexthop slot.
pub struct RouteTable<AF: AddressFamily> {
    tree: RadixTree<AF>,
    nexthops: NexthopTable<AF>,
    prefix_cnt: u32,
}

impl<AF: AddressFamily> RouteTable<AF> {
    pub fn new() -> Self {
        RouteTable {
            tree: RadixTree::new(),
            nexthops: NexthopTable::new(),
            prefix_cnt: 0,
        }
    }

    /// Add a route, or replace an existing one when `set` is given.
    /// Returns the replaced route, if any.
    pub fn add_route(
        &mut self,
        route: &Route<AF>,
        set: bool,
    ) -> Result<Option<Route<AF>>, RouteStoreError> {
        if route.masklen > AF::BITS || route.port < 0 {
            return Err(RouteStoreError::InvalidRoute);
        }

        if let Some(old_nh) = self.tree.lookup_exact(route.addr, route.masklen)
        {
            if !set {
                return Err(RouteStoreError::RouteAlreadyExists);
            }
            let old = self.route_for(route.addr, route.masklen, old_nh);
            if route.masklen == 0 {
                self.nexthops.set_default(route.gw, route.port);
            } else {
                let nh = self.nexthops.ref_nexthop(route.gw, route.port)?;
                self.tree.replace_nexthop(route.addr, route.masklen, nh);
                self.nexthops.unref(old_nh);
            }
            debug!("route {} replaced", route);
            return Ok(Some(old));
        }

        if route.masklen == 0 {
            self.tree.add(route.addr, 0, DEFAULT_NEXTHOP)?;
            self.nexthops.set_default(route.gw, route.port);
        } else {
            let nh = self.nexthops.ref_nexthop(route.gw, route.port)?;
            if let Err(e) = self.tree.add(route.addr, route.masklen, nh) {
                self.nexthops.unref(nh);
                return Err(e);
            }
        }
        self.prefix_cnt += 1;
        Ok(None)
    }

    /// Remove the route for exactly `addr/masklen` and return it.
    pub fn remove_route(
        &mut self,
        addr: AF,
        masklen: u8,
    ) -> Result<Route<AF>, RouteStoreError> {
        let nh = self.tree.delete(addr, masklen)?;
        self.prefix_cnt -= 1;
        let old = self.route_for(addr, masklen, nh);
        if masklen == 0 {
            self.nexthops.clear_default();
        } else {
            self.nexthops.unref(nh);
        }
        debug!("route {} removed", old);
        Ok(old)
    }

    /// Longest-prefix-match lookup. Returns `(port, gateway)`; a port of
    /// −1 means discard.
    pub fn lookup_route(&self, addr: AF) -> (i32, AF) {
        let nh = self
            .tree
            .match_longest(addr)
            .map_or(DEFAULT_NEXTHOP, |l| l.nexthop);
        let (gw, port) = self.nexthops.resolve(nh);
        (port, gw)
    }

    /// One line per route, `addr/len\tgw\tport`, in tree key order.
    pub fn dump_routes(&self) -> String {
        let mut out = String::new();
        self.tree.walk(|l| {
            let route = self.route_for(l.key, l.plen, l.nexthop);
            let _ = writeln!(out, "{}", route);
            WalkAction::Continue
        });
        out
    }

    /// Remove every route. The nexthop table ends up empty.
    pub fn flush(&mut self) {
        let mut leaves = Vec::with_capacity(self.prefix_cnt as usize);
        self.tree.walk(|l| {
            leaves.push((l.key, l.plen));
            WalkAction::Continue
        });
        for (key, plen) in leaves {
            // The walk only yielded live routes, this cannot fail.
            let _ = self.remove_route(key, plen);
        }
        assert!(self.nexthops.is_empty());
        debug_assert_eq!(self.prefix_cnt, 0);
    }

    pub fn prefix_count(&self) -> u32 {
        self.prefix_cnt
    }

    pub fn nexthop_count(&self) -> u32 {
        self.nexthops.len()
    }

    pub fn status(&self) -> TableStatus {
        TableStatus {
            prefixes: self.prefix_cnt,
            nexthops: self.nexthops.len(),
        }
    }

    /// Resolve a nexthop handle, as stored in accelerator tables, to its
    /// `(gateway, port)` pair.
    pub fn resolve(&self, nh: u16) -> (AF, i32) {
        self.nexthops.resolve(nh)
    }

    /// The most specific route covering `addr`, as a tree leaf.
    pub(crate) fn longest_leaf(&self, addr: AF) -> Option<LeafRef<AF>> {
        self.tree.match_longest(addr)
    }

    /// Walk the routed prefixes within `start/plen` in key order.
    pub(crate) fn walk_from<F>(
        &self,
        start: AF,
        plen: u8,
        f: F,
    ) -> WalkOutcome
    where
        F: FnMut(LeafRef<AF>) -> WalkAction,
    {
        self.tree.walk_from(start, plen, f)
    }

    pub(crate) fn nexthop_refs_total(&self) -> u64 {
        self.nexthops.refs_total()
    }

    fn route_for(&self, addr: AF, masklen: u8, nh: u16) -> Route<AF> {
        let (gw, port) = self.nexthops.resolve(nh);
        Route {
            addr: addr.truncate_to_len(masklen),
            masklen,
            gw,
            port,
        }
    }
}

impl<AF: AddressFamily> Default for RouteTable<AF> {
    fn default() -> Self {
        Self::new()
    }
}
