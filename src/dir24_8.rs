use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::chunk::{covering_entry, Frag, FragCollector};
use crate::pending::{PendingSet, UpdateScheduler, UPDATE_HOLDDOWN};
use crate::radix::WalkAction;
use crate::table::RouteTable;
use crate::types::errors::RouteStoreError;
use crate::types::stats::DirStatus;
use crate::types::{AddressFamily, Route};

//------------ DirectLookup --------------------------------------------------

const SECONDARY_BITS: u32 = 8;
const PRIMARY_SIZE: usize = 1 << 24;
const SECONDARY_BLOCKS: u32 = 1 << 15;
const SECONDARY_SIZE: usize = (SECONDARY_BLOCKS as usize) << 8;
const SECONDARY_MASK: u64 = 0xff;

const CHUNK_PREFLEN: u16 = 16;
const DIR_CHUNKS: u32 = 1 << 16;
const CHUNK_SHIFT: u32 = 16;
const CHUNK_MASK: u32 = 0xffff;

/// The tag bit marking a primary entry as a direct nexthop encoding.
/// Direct entries hold `nexthop ^ 0xffff`; with nexthop handles below
/// 2^15 that always sets this bit, while secondary block indices never
/// do.
const DIRECT_BIT: u16 = 0x8000;

/// IPv4 lookup engine in the DIR-24-8-BASIC scheme: a flat 2^24-entry
/// primary table indexed by the upper 24 address bits, spilling into
/// 256-entry secondary blocks wherever a /24 does not resolve uniformly.
/// A lookup is one primary read and at most one secondary read.
///
/// Updates go to the authoritative [`RouteTable`] first and only mark
/// the affected /16 chunks stale; a deferred batch pass later re-expands
/// each stale chunk from the tree in one ordered walk.
pub struct DirectLookup {
    table: RouteTable<u32>,

    // Lookup structures.
    primary: Box<[u16]>,
    secondary: Box<[u16]>,

    // Auxiliary structures.
    range_buf: Vec<Frag>,
    secondary_used: u32,
    secondary_free_head: u16,
    pending: PendingSet,
    updates_pending: u32,
    last_update: Duration,
    scheduler: Option<Box<dyn UpdateScheduler>>,
}

impl DirectLookup {
    pub fn new() -> Self {
        // All of the address space resolves to the default route.
        let primary = vec![0u16 ^ 0xffff; PRIMARY_SIZE].into_boxed_slice();
        let mut secondary = vec![0u16; SECONDARY_SIZE].into_boxed_slice();
        // Thread all secondary blocks onto the free list through their
        // first slot.
        for i in 0..SECONDARY_BLOCKS {
            secondary[(i << SECONDARY_BITS) as usize] = (i + 1) as u16;
        }
        DirectLookup {
            table: RouteTable::new(),
            primary,
            secondary,
            range_buf: Vec::new(),
            secondary_used: 0,
            secondary_free_head: 0,
            pending: PendingSet::new(DIR_CHUNKS),
            updates_pending: 0,
            last_update: Duration::ZERO,
            scheduler: None,
        }
    }

    /// Attach the deferred-update timer and synchronously drain any
    /// updates accumulated during construction.
    pub fn initialize(&mut self, scheduler: Box<dyn UpdateScheduler>) {
        self.scheduler = Some(scheduler);
        if self.pending.has_pending() {
            self.apply_pending();
        }
    }

    pub fn add_route(
        &mut self,
        route: &Route<u32>,
        set: bool,
    ) -> Result<Option<Route<u32>>, RouteStoreError> {
        let old = self.table.add_route(route, set)?;
        self.schedule_update(route);
        Ok(old)
    }

    pub fn remove_route(
        &mut self,
        addr: u32,
        masklen: u8,
    ) -> Result<Route<u32>, RouteStoreError> {
        let old = self.table.remove_route(addr, masklen)?;
        self.schedule_update(&old);
        Ok(old)
    }

    /// Longest-prefix-match lookup against the expanded tables. Returns
    /// `(port, gateway)`; a port of −1 means discard.
    pub fn lookup_route(&self, addr: u32) -> (i32, u32) {
        let (gw, port) = self.table.resolve(self.lookup_nexthop(addr));
        (port, gw)
    }

    fn lookup_nexthop(&self, dst: u32) -> u16 {
        let pri = self.primary[(dst >> SECONDARY_BITS) as usize];
        if pri & DIRECT_BIT != 0 {
            pri ^ 0xffff
        } else {
            self.secondary
                [(((pri as u32) << SECONDARY_BITS) + (dst & 0xff)) as usize]
        }
    }

    /// The engine's timer callback.
    pub fn run_timer(&mut self) {
        if self.updates_pending > 0 {
            self.apply_pending();
        }
    }

    /// Rebuild every stale chunk now.
    pub fn apply_pending(&mut self) {
        let t_start = Instant::now();
        for chunk in self.pending.take_marked() {
            self.update_chunk(chunk);
        }
        self.last_update = t_start.elapsed();
        self.updates_pending = 0;
        debug!(
            "chunk rebuild batch took {} us",
            self.last_update.as_micros()
        );
    }

    /// Remove all routes and reset the tables to all-default in one
    /// step, without going through per-chunk rebuilds.
    pub fn flush(&mut self) {
        self.table.flush();
        self.primary.fill(0u16 ^ 0xffff);
        for i in 0..SECONDARY_BLOCKS {
            self.secondary[(i << SECONDARY_BITS) as usize] = (i + 1) as u16;
        }
        self.secondary_free_head = 0;
        self.secondary_used = 0;
        self.pending.clear();
        self.updates_pending = 0;
    }

    pub fn prefix_count(&self) -> u32 {
        self.table.prefix_count()
    }

    pub fn nexthop_count(&self) -> u32 {
        self.table.nexthop_count()
    }

    pub fn dump_routes(&self) -> String {
        self.table.dump_routes()
    }

    pub fn table(&self) -> &RouteTable<u32> {
        &self.table
    }

    pub fn status(&self) -> DirStatus {
        let direct_hits = self
            .primary
            .iter()
            .filter(|&&pri| pri & DIRECT_BIT != 0)
            .count() as u32;
        DirStatus {
            prefixes: self.table.prefix_count(),
            nexthops: self.table.nexthop_count(),
            direct_bytes: 2 * PRIMARY_SIZE,
            secondary_bytes: (2 << SECONDARY_BITS)
                * self.secondary_used as usize,
            secondary_used: self.secondary_used,
            direct_hits,
            last_update: self.last_update,
        }
    }

    // Mark the /16 chunks overlapping the route's range stale and arm
    // the deferred rebuild on the first update of a batch.
    fn schedule_update(&mut self, route: &Route<u32>) {
        // A default route change only touches nexthop slot 0.
        if route.masklen == 0 {
            return;
        }
        let (start, end) = route.range();
        self.pending
            .mark_range(start >> CHUNK_SHIFT, end >> CHUNK_SHIFT);
        if self.updates_pending == 0 {
            if let Some(sched) = self.scheduler.as_mut() {
                if sched.is_initialized() {
                    sched.arm_after(UPDATE_HOLDDOWN);
                }
            }
        }
        self.updates_pending += 1;
    }

    fn update_chunk(&mut self, chunk: u32) {
        let first = chunk << CHUNK_SHIFT;
        let last = first | CHUNK_MASK;
        trace!("updating chunk {:08x}-{:08x}", first, last);

        // Flatten the chunk into fragments by walking the tree.
        let mut frags = std::mem::take(&mut self.range_buf);
        {
            let table = &self.table;
            let mut col = FragCollector::new(first, &mut frags, |addr| {
                covering_entry(table, addr)
            });
            table.walk_from(first, CHUNK_PREFLEN as u8, |leaf| {
                col.visit(
                    leaf.key,
                    leaf.key.range_end(leaf.plen),
                    leaf.plen as u16,
                    leaf.nexthop,
                );
                WalkAction::Continue
            });
            col.drain(CHUNK_PREFLEN, last);
        }

        // Release the secondary blocks the old expansion of this chunk
        // held; the fill below allocates fresh ones as needed.
        for i in (chunk << SECONDARY_BITS)..((chunk + 1) << SECONDARY_BITS) {
            let pri = self.primary[i as usize];
            if pri & DIRECT_BIT == 0 {
                self.secondary[((pri as u32) << SECONDARY_BITS) as usize] =
                    self.secondary_free_head;
                self.secondary_free_head = pri;
                self.secondary_used -= 1;
            }
        }

        // Transform range notation into table entries covering
        // [first, last].
        let mut pos = frags[0].start as u64;
        let mut nh = frags[0].nexthop;
        for i in 1..=frags.len() {
            let frag_end = if i < frags.len() {
                frags[i].start as u64
            } else {
                last as u64 + 1
            };
            while pos < frag_end {
                if pos & SECONDARY_MASK == 0 && frag_end >= pos + 256 {
                    // The whole /24 resolves uniformly: direct hit.
                    self.primary[(pos >> SECONDARY_BITS) as usize] =
                        nh ^ 0xffff;
                    pos += 256;
                } else if pos & SECONDARY_MASK == 0 {
                    // A fragment boundary inside this /24: allocate a
                    // secondary block for it.
                    assert!(
                        self.secondary_used < SECONDARY_BLOCKS,
                        "out of secondary blocks: more than 2^15 /24 \
                         networks carry a /25-or-longer prefix"
                    );
                    let blk = self.secondary_free_head;
                    self.primary[(pos >> SECONDARY_BITS) as usize] = blk;
                    self.secondary_free_head = self.secondary
                        [((blk as u32) << SECONDARY_BITS) as usize];
                    self.secondary_used += 1;
                    self.secondary[((blk as u32) << SECONDARY_BITS) as usize] =
                        nh;
                    pos += 1;
                } else {
                    // Fill up the /24's secondary block.
                    let blk =
                        self.primary[(pos >> SECONDARY_BITS) as usize] as u32;
                    self.secondary[((blk << SECONDARY_BITS)
                        + (pos as u32 & 0xff))
                        as usize] = nh;
                    pos += 1;
                }
            }
            if i < frags.len() {
                nh = frags[i].nexthop;
            }
        }

        self.range_buf = frags;
    }
}

impl Default for DirectLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(addr: u32, len: u8, port: i32) -> Route<u32> {
        Route::new(addr, len, 0, port)
    }

    impl DirectLookup {
        // Every allocated secondary block is reachable through exactly
        // one primary entry.
        fn check_secondary_consistency(&self) {
            let mut seen = std::collections::HashSet::new();
            for &pri in self.primary.iter() {
                if pri & DIRECT_BIT == 0 {
                    assert!(
                        seen.insert(pri),
                        "secondary block {} double-referenced",
                        pri
                    );
                }
            }
            assert_eq!(seen.len() as u32, self.secondary_used);
        }
    }

    // Compare the expanded tables against the authoritative tree over a
    // set of probe addresses.
    fn assert_matches_table(dir: &DirectLookup, probes: &[u32]) {
        for &addr in probes {
            assert_eq!(
                dir.lookup_route(addr),
                dir.table().lookup_route(addr),
                "mismatch at {:#010x}",
                addr
            );
        }
    }

    #[test]
    fn lookup_before_and_after_apply() {
        let mut dir = DirectLookup::new();
        dir.add_route(&route(0x0a000000, 8, 1), false).unwrap();
        // Not applied yet: the tables still answer default.
        assert_eq!(dir.lookup_route(0x0a010203).0, -1);
        dir.apply_pending();
        assert_eq!(dir.lookup_route(0x0a010203).0, 1);
        assert_eq!(dir.lookup_route(0x0b000001).0, -1);
    }

    #[test]
    fn halves_of_address_space_stay_direct() {
        let mut dir = DirectLookup::new();
        dir.add_route(&route(0, 1, 1), false).unwrap();
        dir.add_route(&route(0x80000000, 1, 2), false).unwrap();
        dir.apply_pending();
        assert_eq!(dir.lookup_route(0).0, 1);
        assert_eq!(dir.lookup_route(0x7fffffff).0, 1);
        assert_eq!(dir.lookup_route(0x80000000).0, 2);
        assert_eq!(dir.lookup_route(u32::MAX).0, 2);
        // No /24 needed finer granularity.
        assert_eq!(dir.status().secondary_used, 0);
    }

    #[test]
    fn sub_24_prefixes_use_secondary_blocks() {
        let mut dir = DirectLookup::new();
        dir.add_route(&route(0x0a050180, 25, 1), false).unwrap();
        dir.add_route(&route(0x0a0501c0, 26, 2), false).unwrap();
        dir.apply_pending();
        assert_eq!(dir.status().secondary_used, 1);
        dir.check_secondary_consistency();

        assert_eq!(dir.lookup_route(0x0a050170).0, -1);
        assert_eq!(dir.lookup_route(0x0a050180).0, 1);
        assert_eq!(dir.lookup_route(0x0a0501bf).0, 1);
        assert_eq!(dir.lookup_route(0x0a0501c0).0, 2);
        assert_eq!(dir.lookup_route(0x0a0501ff).0, 2);
        assert_eq!(dir.lookup_route(0x0a050200).0, -1);

        // Removing both returns the /24 to a direct encoding and frees
        // the block.
        dir.remove_route(0x0a050180, 25).unwrap();
        dir.remove_route(0x0a0501c0, 26).unwrap();
        dir.apply_pending();
        assert_eq!(dir.status().secondary_used, 0);
        assert_eq!(dir.lookup_route(0x0a0501c0).0, -1);
        dir.check_secondary_consistency();
    }

    #[test]
    fn host_route_at_top_of_chunk() {
        let mut dir = DirectLookup::new();
        dir.add_route(&route(0x0a05ffff, 32, 3), false).unwrap();
        dir.add_route(&route(0x0a050000, 16, 1), false).unwrap();
        dir.apply_pending();
        assert_eq!(dir.lookup_route(0x0a05ffff).0, 3);
        assert_eq!(dir.lookup_route(0x0a05fffe).0, 1);
        assert_eq!(dir.lookup_route(0x0a050000).0, 1);
    }

    #[test]
    fn top_of_address_space() {
        let mut dir = DirectLookup::new();
        dir.add_route(&route(0xffffff00, 24, 7), false).unwrap();
        dir.add_route(&route(0xffffffff, 32, 8), false).unwrap();
        dir.apply_pending();
        assert_eq!(dir.lookup_route(0xffffff00).0, 7);
        assert_eq!(dir.lookup_route(0xfffffffe).0, 7);
        assert_eq!(dir.lookup_route(0xffffffff).0, 8);
        assert_eq!(dir.lookup_route(0xfffffe00).0, -1);
    }

    #[test]
    fn replace_and_remove_reconverge() {
        let mut dir = DirectLookup::new();
        dir.add_route(&route(0x0a000000, 8, 1), false).unwrap();
        dir.add_route(&route(0x0a010000, 16, 2), false).unwrap();
        dir.apply_pending();
        assert_eq!(dir.lookup_route(0x0a010203).0, 2);

        dir.add_route(&route(0x0a010000, 16, 9), true).unwrap();
        dir.apply_pending();
        assert_eq!(dir.lookup_route(0x0a010203).0, 9);

        dir.remove_route(0x0a010000, 16).unwrap();
        dir.apply_pending();
        assert_eq!(dir.lookup_route(0x0a010203).0, 1);

        let probes = [
            0x0a000000, 0x0a00ffff, 0x0a010000, 0x0a020000, 0x0affffff,
            0x0b000000, 0x09ffffff,
        ];
        assert_matches_table(&dir, &probes);
    }

    #[test]
    fn flush_resets_everything() {
        let mut dir = DirectLookup::new();
        for i in 0..64u32 {
            dir.add_route(&route(0x0a000000 | (i << 9), 25, i as i32 + 1), false)
                .unwrap();
        }
        dir.apply_pending();
        assert!(dir.status().secondary_used > 0);
        dir.check_secondary_consistency();
        dir.flush();
        assert_eq!(dir.prefix_count(), 0);
        assert_eq!(dir.nexthop_count(), 0);
        assert_eq!(dir.status().secondary_used, 0);
        assert_eq!(dir.lookup_route(0x0a000000).0, -1);
        assert_eq!(dir.lookup_route(0).0, -1);

        // The engine is fully reusable after a flush.
        dir.add_route(&route(0x0a000080, 25, 5), false).unwrap();
        dir.apply_pending();
        assert_eq!(dir.lookup_route(0x0a0000ff).0, 5);
        assert_eq!(dir.status().secondary_used, 1);
    }
}
