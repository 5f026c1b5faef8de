use log::trace;

use crate::types::errors::RouteStoreError;
use crate::types::AddressFamily;

//------------ NexthopTable --------------------------------------------------

/// The nexthop table holds at most this many slots, the reserved
/// default-route slot included.
pub const VPORTS_MAX: usize = 8192;

/// The handle that always resolves to the default route.
pub const DEFAULT_NEXTHOP: u16 = 0;

/// No neighbor on an intrusive list.
const LL_NONE: i16 = -1;

#[derive(Clone, Copy, Debug)]
struct Nexthop<AF> {
    gw: AF,
    port: i32,
    refcount: i32,
    ll_prev: i16,
    ll_next: i16,
}

/// Interned, refcounted mapping from a small integer handle to a
/// `(gateway, port)` pair.
///
/// Slot 0 permanently holds the default route; it is never refcounted and
/// never handed out by [`NexthopTable::ref_nexthop`]. All other slots are
/// threaded onto one of two intrusive doubly-linked lists: the live list,
/// which `ref_nexthop` scans for an existing equal pair, and the empty
/// list, which recycles freed slots in O(1). The linear scan is fine
/// here: live nexthop cardinality stays orders of magnitude below the
/// prefix count.
pub struct NexthopTable<AF: AddressFamily> {
    tbl: Vec<Nexthop<AF>>,
    head: i16,
    empty_head: i16,
    nexthops: u32,
}

impl<AF: AddressFamily> NexthopTable<AF> {
    pub fn new() -> Self {
        let mut tbl = Vec::with_capacity(64);
        // Slot 0: default route, initially discard.
        tbl.push(Nexthop {
            gw: AF::ZERO,
            port: -1,
            refcount: 0,
            ll_prev: LL_NONE,
            ll_next: LL_NONE,
        });
        NexthopTable {
            tbl,
            head: LL_NONE,
            empty_head: LL_NONE,
            nexthops: 0,
        }
    }

    /// Intern `(gw, port)` and return its handle. An existing equal pair
    /// gets its refcount bumped; otherwise a slot is recycled from the
    /// empty list or the table is extended.
    pub fn ref_nexthop(
        &mut self,
        gw: AF,
        port: i32,
    ) -> Result<u16, RouteStoreError> {
        let mut nh_i = self.head;
        while nh_i >= 0 {
            let nh = &self.tbl[nh_i as usize];
            if nh.gw == gw && nh.port == port {
                break;
            }
            nh_i = nh.ll_next;
        }

        if nh_i >= 0 {
            self.tbl[nh_i as usize].refcount += 1;
            return Ok(nh_i as u16);
        }

        let nh_i = if self.empty_head >= 0 {
            let slot = self.empty_head;
            self.empty_head = self.tbl[slot as usize].ll_next;
            slot
        } else {
            if self.tbl.len() >= VPORTS_MAX {
                return Err(RouteStoreError::NexthopTableFull);
            }
            self.tbl.push(Nexthop {
                gw: AF::ZERO,
                port: -1,
                refcount: 0,
                ll_prev: LL_NONE,
                ll_next: LL_NONE,
            });
            (self.tbl.len() - 1) as i16
        };
        self.nexthops += 1;
        trace!("nexthop {} allocated, port {}", nh_i, port);

        let nh = &mut self.tbl[nh_i as usize];
        nh.refcount = 1;
        nh.gw = gw;
        nh.port = port;

        // Link at the head of the live list.
        nh.ll_prev = LL_NONE;
        nh.ll_next = self.head;
        if self.head >= 0 {
            self.tbl[self.head as usize].ll_prev = nh_i;
        }
        self.head = nh_i;
        Ok(nh_i as u16)
    }

    /// Drop one reference to `nh_i` and return the remaining count. At
    /// zero the slot moves to the empty list.
    pub fn unref(&mut self, nh_i: u16) -> i32 {
        debug_assert_ne!(nh_i, DEFAULT_NEXTHOP);
        let nh_i = nh_i as i16;
        self.tbl[nh_i as usize].refcount -= 1;
        let refc = self.tbl[nh_i as usize].refcount;
        if refc == 0 {
            self.tbl[nh_i as usize].port = -1;
            trace!("nexthop {} released", nh_i);

            // Prune the slot from the live list.
            let prev = self.tbl[nh_i as usize].ll_prev;
            let next = self.tbl[nh_i as usize].ll_next;
            if prev >= 0 {
                self.tbl[prev as usize].ll_next = next;
            } else {
                self.head = next;
            }
            if next >= 0 {
                self.tbl[next as usize].ll_prev = prev;
            }

            // And push it onto the empty list.
            self.tbl[nh_i as usize].ll_next = self.empty_head;
            self.empty_head = nh_i;
            self.nexthops -= 1;
        }
        refc
    }

    /// Resolve a handle to its `(gateway, port)` pair.
    pub fn resolve(&self, nh_i: u16) -> (AF, i32) {
        let nh = &self.tbl[nh_i as usize];
        (nh.gw, nh.port)
    }

    /// Rewrite the default route in slot 0. No refcounting applies.
    pub fn set_default(&mut self, gw: AF, port: i32) {
        self.tbl[0].gw = gw;
        self.tbl[0].port = port;
    }

    /// Reset slot 0 to discard.
    pub fn clear_default(&mut self) {
        self.tbl[0].gw = AF::ZERO;
        self.tbl[0].port = -1;
    }

    /// The number of live interned nexthops, slot 0 excluded.
    pub fn len(&self) -> u32 {
        self.nexthops
    }

    pub fn is_empty(&self) -> bool {
        self.nexthops == 0
    }

    /// The sum of refcounts over all live slots.
    pub fn refs_total(&self) -> u64 {
        let mut total = 0;
        let mut nh_i = self.head;
        while nh_i >= 0 {
            total += self.tbl[nh_i as usize].refcount as u64;
            nh_i = self.tbl[nh_i as usize].ll_next;
        }
        total
    }
}

impl<AF: AddressFamily> Default for NexthopTable<AF> {
    fn default() -> Self {
        Self::new()
    }
}
