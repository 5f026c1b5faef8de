use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::chunk::{covering_entry, Frag, FragCollector};
use crate::pending::{PendingSet, UpdateScheduler, UPDATE_HOLDDOWN};
use crate::radix::{WalkAction, WalkOutcome};
use crate::table::RouteTable;
use crate::types::errors::RouteStoreError;
use crate::types::stats::DxrStatus;
use crate::types::{AddressFamily, Route};

//------------ DxrLookup -----------------------------------------------------

// D20R is the sweetspot configuration: 4 MiB of direct descriptors and
// 4096-address chunks. The packed field widths below hold for direct
// bit counts between 16 and 20.
const DIRECT_BITS: u32 = 20;
const DIRECT_TBL_SIZE: usize = 1 << DIRECT_BITS;
const RANGE_SHIFT: u32 = 32 - DIRECT_BITS;
const RANGE_MASK: u32 = u32::MAX >> DIRECT_BITS;

// A direct descriptor packs {fragments:12, long_format:1, base:19}.
const DESC_BASE_BITS: u32 = 19;
const BASE_MAX: u32 = (1 << DESC_BASE_BITS) - 1;
const FRAG_BITS: u32 = 31 - DESC_BASE_BITS;
const LONG_FORMAT_BIT: u32 = 1 << FRAG_BITS;
const FRAG_MAX: u32 = LONG_FORMAT_BIT - 1;

const CHUNK_HASH_BITS: u32 = 16;
const CHUNK_HASH_SIZE: usize = 1 << CHUNK_HASH_BITS;
const CHUNK_HASH_MASK: u32 = (CHUNK_HASH_SIZE - 1) as u32;

/// Walk abort code: the chunk under construction cannot be represented
/// in the short range format.
const ABORT_LONG_FORMAT: i32 = 1;

/// Nothing, on descriptor lists.
const NIL: u32 = u32::MAX;

const _: () = assert!(DIRECT_BITS >= 16 && DIRECT_BITS <= 20);

fn desc_word(fragments: u32, long_format: bool, base: u32) -> u32 {
    debug_assert!(fragments <= FRAG_MAX && base <= BASE_MAX);
    (base << (FRAG_BITS + 1)) | ((long_format as u32) << FRAG_BITS) | fragments
}

fn d_fragments(d: u32) -> u32 {
    d & FRAG_MAX
}

fn d_long_format(d: u32) -> bool {
    d & LONG_FORMAT_BIT != 0
}

fn d_base(d: u32) -> u32 {
    d >> (FRAG_BITS + 1)
}

fn with_base(d: u32, base: u32) -> u32 {
    desc_word(d_fragments(d), d_long_format(d), base)
}

// Short range entries pack two per word: {nexthop:8, start:8} in each
// half, `start` being the chunk offset divided by 256.
fn short_get(word: u32, idx: u32) -> (u32, u16) {
    let half = (word >> ((idx & 1) * 16)) & 0xffff;
    (half >> 8, (half & 0xff) as u16)
}

fn short_put(word: &mut u32, idx: u32, start: u32, nexthop: u16) {
    debug_assert!(start <= 0xff && nexthop <= 0xff);
    let half = (start << 8) | nexthop as u32;
    let shift = (idx & 1) * 16;
    *word = (*word & !(0xffff << shift)) | (half << shift);
}

/// A chunk stored in the range table, shared by every direct entry whose
/// expansion came out byte-identical. Free descriptors track holes in
/// the range table instead.
///
/// Descriptors sit on two intrusive index lists: `all` orders every
/// descriptor by descending base, covering the range table without gap
/// or overlap, while `link` threads a descriptor onto its hash bucket
/// when live and onto the sorted free list when empty.
#[derive(Clone, Copy, Debug)]
struct ChunkDesc {
    hash: u32,
    refcount: u32,
    base: u32,
    /// Words in use; 0 marks a free descriptor.
    cur_size: u32,
    max_size: u32,
    /// Head of the member chain of direct entries sharing this chunk,
    /// continued through `ChunkPtr::chunk_next`; −1 ends it.
    chunk_first: i32,
    all_next: u32,
    all_prev: u32,
    link_next: u32,
    link_prev: u32,
}

#[derive(Clone, Copy, Debug)]
struct ChunkPtr {
    desc: u32,
    chunk_next: i32,
}

#[derive(Clone, Copy)]
enum LinkHead {
    Unused,
    Bucket(u32),
}

/// IPv4 lookup engine in the DXR scheme: the upper 20 address bits index
/// a packed descriptor, which either is the answer itself or points at a
/// short sorted list of ranges in one contiguous range table, searched
/// by binary search over the remaining 12 bits.
///
/// Chunks with identical content are interned: they share one stored
/// copy found through a content hash, and freed copies leave holes that
/// get merged and compacted away after every update batch. Updates mark
/// stale /20 chunks and are applied in deferred batches, like
/// [`crate::dir24_8::DirectLookup`] does for /16s.
pub struct DxrLookup {
    table: RouteTable<u32>,

    // Lookup structures.
    direct_tbl: Box<[u32]>,
    range_tbl: Box<[u32]>,

    // Chunk bookkeeping.
    descs: Vec<ChunkDesc>,
    desc_free: Vec<u32>,
    cptbl: Box<[ChunkPtr]>,
    chunk_hash_heads: Box<[u32]>,
    all_head: u32,
    unused_head: u32,
    range_tbl_free: u32,
    chunks_short: u32,
    chunks_long: u32,
    fragments_short: u32,
    fragments_long: u32,
    aggr_chunks_short: u32,
    aggr_chunks_long: u32,
    aggr_fragments_short: u32,
    aggr_fragments_long: u32,

    range_buf: Vec<Frag>,
    pending: PendingSet,
    updates_pending: u32,
    last_update: Duration,
    scheduler: Option<Box<dyn UpdateScheduler>>,
}

impl DxrLookup {
    pub fn new() -> Self {
        // Every chunk starts out folded onto the default nexthop.
        let direct_tbl =
            vec![desc_word(FRAG_MAX, false, 0); DIRECT_TBL_SIZE]
                .into_boxed_slice();
        DxrLookup {
            table: RouteTable::new(),
            direct_tbl,
            range_tbl: vec![0u32; (BASE_MAX + 1) as usize]
                .into_boxed_slice(),
            descs: Vec::new(),
            desc_free: Vec::new(),
            cptbl: vec![
                ChunkPtr {
                    desc: NIL,
                    chunk_next: -1
                };
                DIRECT_TBL_SIZE
            ]
            .into_boxed_slice(),
            chunk_hash_heads: vec![NIL; CHUNK_HASH_SIZE].into_boxed_slice(),
            all_head: NIL,
            unused_head: NIL,
            range_tbl_free: 0,
            chunks_short: 0,
            chunks_long: 0,
            fragments_short: 0,
            fragments_long: 0,
            aggr_chunks_short: 0,
            aggr_chunks_long: 0,
            aggr_fragments_short: 0,
            aggr_fragments_long: 0,
            range_buf: Vec::new(),
            pending: PendingSet::new(DIRECT_TBL_SIZE as u32),
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
        let d = self.direct_tbl[(dst >> RANGE_SHIFT) as usize];
        let fragments = d_fragments(d);
        let base = d_base(d);
        if fragments == FRAG_MAX {
            // Single-value chunk: the descriptor is the answer.
            return base as u16;
        }

        // Find the last range starting at or below the masked address.
        let mut masked = dst & RANGE_MASK;
        if d_long_format(d) {
            let mut lo = 0u32;
            let mut hi = fragments;
            while lo < hi {
                let mid = (lo + hi + 1) / 2;
                if self.range_tbl[(base + mid) as usize] >> 16 <= masked {
                    lo = mid;
                } else {
                    hi = mid - 1;
                }
            }
            (self.range_tbl[(base + lo) as usize] & 0xffff) as u16
        } else {
            masked >>= 8;
            let mut lo = 0u32;
            let mut hi = 2 * fragments + 1;
            while lo < hi {
                let mid = (lo + hi + 1) / 2;
                let word = self.range_tbl[(base + mid / 2) as usize];
                if short_get(word, mid).0 <= masked {
                    lo = mid;
                } else {
                    hi = mid - 1;
                }
            }
            let word = self.range_tbl[(base + lo / 2) as usize];
            short_get(word, lo).1
        }
    }

    /// The engine's timer callback.
    pub fn run_timer(&mut self) {
        if self.updates_pending > 0 {
            self.apply_pending();
        }
    }

    /// Rebuild every stale chunk now, then compact the range table.
    pub fn apply_pending(&mut self) {
        let t_start = Instant::now();
        for chunk in self.pending.take_marked() {
            self.update_chunk(chunk);
        }
        self.prune_empty_chunks();
        self.last_update = t_start.elapsed();
        self.updates_pending = 0;
        debug!(
            "chunk rebuild batch took {} us",
            self.last_update.as_micros()
        );
    }

    /// Remove all routes, tearing the whole expansion down through the
    /// regular chunk machinery.
    pub fn flush(&mut self) {
        self.table.flush();
        self.pending.mark_all();
        self.updates_pending = 1;
        self.apply_pending();
        assert_eq!(self.chunks_short, 0);
        assert_eq!(self.chunks_long, 0);
        assert_eq!(self.fragments_short, 0);
        assert_eq!(self.fragments_long, 0);
        assert_eq!(self.range_tbl_free, 0);
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

    pub fn status(&self) -> DxrStatus {
        let mut max_chunk = 0;
        let mut i = self.all_head;
        while i != NIL {
            max_chunk = max_chunk.max(self.descs[i as usize].cur_size);
            i = self.descs[i as usize].all_next;
        }
        let direct_hits = self
            .direct_tbl
            .iter()
            .filter(|&&d| d_fragments(d) == FRAG_MAX)
            .count() as u32;
        DxrStatus {
            prefixes: self.table.prefix_count(),
            nexthops: self.table.nexthop_count(),
            direct_bytes: 4 * DIRECT_TBL_SIZE,
            range_bytes: 4 * self.range_tbl_free as usize,
            direct_hits,
            max_chunk,
            chunks_short: self.chunks_short,
            chunks_long: self.chunks_long,
            fragments_short: self.fragments_short,
            fragments_long: self.fragments_long,
            aggr_chunks_short: self.aggr_chunks_short,
            aggr_chunks_long: self.aggr_chunks_long,
            aggr_fragments_short: self.aggr_fragments_short,
            aggr_fragments_long: self.aggr_fragments_long,
            last_update: self.last_update,
        }
    }

    fn schedule_update(&mut self, route: &Route<u32>) {
        // A default route change only touches nexthop slot 0.
        if route.masklen == 0 {
            return;
        }
        let (start, end) = route.range();
        self.pending
            .mark_range(start >> RANGE_SHIFT, end >> RANGE_SHIFT);
        if self.updates_pending == 0 {
            if let Some(sched) = self.scheduler.as_mut() {
                if sched.is_initialized() {
                    sched.arm_after(UPDATE_HOLDDOWN);
                }
            }
        }
        self.updates_pending += 1;
    }

    //--- Chunk expansion

    fn update_chunk(&mut self, chunk: u32) {
        if d_fragments(self.direct_tbl[chunk as usize]) != FRAG_MAX {
            self.chunk_unref(chunk);
        }
        let first = chunk << RANGE_SHIFT;
        let last = first | RANGE_MASK;
        trace!("updating chunk {:08x}-{:08x}", first, last);

        let mut frags = std::mem::take(&mut self.range_buf);
        // Optimistically collect for the short format: any visited route
        // that cannot be represented aborts the walk, and the chunk is
        // re-collected without the checks.
        let table = &self.table;
        let mut short_ok = {
            let mut col = FragCollector::new(first, &mut frags, |a| {
                covering_entry(table, a)
            });
            let outcome =
                table.walk_from(first, DIRECT_BITS as u8, |leaf| {
                    let start = leaf.key;
                    let end = leaf.key.range_end(leaf.plen);
                    if start & 0xff != 0
                        || end < (start | 0xff)
                        || leaf.nexthop > 0xff
                    {
                        return WalkAction::Abort(ABORT_LONG_FORMAT);
                    }
                    col.visit(start, end, leaf.plen as u16, leaf.nexthop);
                    WalkAction::Continue
                });
            match outcome {
                WalkOutcome::Aborted(_) => false,
                _ => {
                    col.drain(DIRECT_BITS as u16, last);
                    true
                }
            }
        };
        if !short_ok {
            let mut col = FragCollector::new(first, &mut frags, |a| {
                covering_entry(table, a)
            });
            table.walk_from(first, DIRECT_BITS as u8, |leaf| {
                col.visit(
                    leaf.key,
                    leaf.key.range_end(leaf.plen),
                    leaf.plen as u16,
                    leaf.nexthop,
                );
                WalkAction::Continue
            });
            col.drain(DIRECT_BITS as u16, last);
        } else {
            // Boundary fragments exposed by covering routes the walk
            // never visited can still break the short constraints.
            short_ok = frags
                .iter()
                .all(|f| f.start & 0xff == 0 && f.nexthop <= 0xff);
        }

        if frags.len() == 1 {
            // Single-value chunk: fold the nexthop into the descriptor,
            // nothing gets stored.
            self.direct_tbl[chunk as usize] =
                desc_word(FRAG_MAX, false, frags[0].nexthop as u32);
        } else if short_ok {
            let base = self.range_tbl_free;
            let mut real = frags.len() as u32;
            let words = (real + 1) / 2;
            assert!(base + words <= BASE_MAX, "range table exhausted");
            self.range_tbl[base as usize..(base + words) as usize].fill(0);
            for (j, f) in frags.iter().enumerate() {
                short_put(
                    &mut self.range_tbl[base as usize + j / 2],
                    j as u32,
                    (f.start & RANGE_MASK) >> 8,
                    f.nexthop,
                );
            }
            if real & 1 == 1 {
                // Pad to an even entry count by duplicating the last
                // entry.
                let f = frags[frags.len() - 1];
                short_put(
                    &mut self.range_tbl[(base + words - 1) as usize],
                    real,
                    (f.start & RANGE_MASK) >> 8,
                    f.nexthop,
                );
                real += 1;
            }
            self.direct_tbl[chunk as usize] =
                desc_word(words - 1, false, base);
            self.chunks_short += 1;
            self.fragments_short += real;
            self.range_tbl_free += words;
            self.chunk_ref(chunk);
        } else {
            let count = frags.len() as u32;
            let base = self.range_tbl_free;
            assert!(count - 1 < FRAG_MAX, "chunk fragment overflow");
            assert!(base + count <= BASE_MAX, "range table exhausted");
            for (j, f) in frags.iter().enumerate() {
                self.range_tbl[(base + j as u32) as usize] =
                    ((f.start & RANGE_MASK) << 16) | f.nexthop as u32;
            }
            self.direct_tbl[chunk as usize] =
                desc_word(count - 1, true, base);
            self.chunks_long += 1;
            self.fragments_long += count;
            self.range_tbl_free += count;
            self.chunk_ref(chunk);
        }

        self.range_buf = frags;
    }

    //--- Chunk interning

    fn chunk_hash(&self, fdesc: u32) -> u32 {
        let base = d_base(fdesc) as usize;
        let n = d_fragments(fdesc) as usize;
        let mut hash = d_fragments(fdesc);
        for w in &self.range_tbl[base..=base + n] {
            hash = (hash << 1)
                .wrapping_add(hash >> 1)
                .wrapping_add(*w);
        }
        hash.wrapping_add(hash >> 16)
    }

    /// Intern the chunk staged at the tail of the range table: share an
    /// existing identical descriptor, recycle a free one, or keep the
    /// staged copy under a new descriptor.
    fn chunk_ref(&mut self, chunk: u32) {
        let fdesc = self.direct_tbl[chunk as usize];
        let hash = self.chunk_hash(fdesc);
        let base = d_base(fdesc);
        let size = d_fragments(fdesc) + 1;
        let long_format = d_long_format(fdesc);

        // An existing chunk with identical content?
        let bucket = LinkHead::Bucket(hash & CHUNK_HASH_MASK);
        let mut i = self.link_head(bucket);
        while i != NIL {
            let cd = self.descs[i as usize];
            if cd.hash == hash
                && cd.cur_size == size
                && self.range_tbl[base as usize..(base + size) as usize]
                    == self.range_tbl
                        [cd.base as usize..(cd.base + size) as usize]
            {
                self.descs[i as usize].refcount += 1;
                self.direct_tbl[chunk as usize] = with_base(fdesc, cd.base);
                if long_format {
                    self.aggr_chunks_long += 1;
                    self.aggr_fragments_long += size;
                    self.chunks_long -= 1;
                    self.fragments_long -= size;
                } else {
                    self.aggr_chunks_short += 1;
                    self.aggr_fragments_short += size << 1;
                    self.chunks_short -= 1;
                    self.fragments_short -= size << 1;
                }
                // Roll the staged copy back off the tail.
                self.range_tbl_free -= size;
                self.cptbl[chunk as usize] = ChunkPtr {
                    desc: i,
                    chunk_next: self.descs[i as usize].chunk_first,
                };
                self.descs[i as usize].chunk_first = chunk as i32;
                trace!("chunk {:05x} shares descriptor {}", chunk, i);
                return;
            }
            i = cd.link_next;
        }

        // No match. Recycle the smallest sufficient free descriptor, if
        // any.
        let mut best = NIL;
        let mut j = self.unused_head;
        while j != NIL {
            let cd = self.descs[j as usize];
            if cd.max_size >= size
                && (best == NIL
                    || cd.max_size < self.descs[best as usize].max_size)
            {
                best = j;
                if cd.max_size == size {
                    break;
                }
            }
            j = cd.link_next;
        }

        let di = if best != NIL {
            let dst = self.descs[best as usize].base;
            self.range_tbl.copy_within(
                base as usize..(base + size) as usize,
                dst as usize,
            );
            self.direct_tbl[chunk as usize] = with_base(fdesc, dst);
            self.range_tbl_free -= size;
            if self.descs[best as usize].max_size > size {
                // Split the trailing remainder off into a fresh free
                // descriptor.
                let rest = self.desc_alloc(ChunkDesc {
                    hash: 0,
                    refcount: 0,
                    base: dst + size,
                    cur_size: 0,
                    max_size: self.descs[best as usize].max_size - size,
                    chunk_first: -1,
                    all_next: NIL,
                    all_prev: NIL,
                    link_next: NIL,
                    link_prev: NIL,
                });
                self.all_insert_before(best, rest);
                self.link_insert_after(best, rest);
                self.descs[best as usize].max_size = size;
            }
            self.link_remove(LinkHead::Unused, best);
            best
        } else {
            let di = self.desc_alloc(ChunkDesc {
                hash: 0,
                refcount: 0,
                base,
                cur_size: 0,
                max_size: size,
                chunk_first: -1,
                all_next: NIL,
                all_prev: NIL,
                link_next: NIL,
                link_prev: NIL,
            });
            self.all_insert_head(di);
            di
        };

        let cd = &mut self.descs[di as usize];
        cd.hash = hash;
        cd.refcount = 1;
        cd.cur_size = size;
        cd.chunk_first = chunk as i32;
        self.cptbl[chunk as usize] = ChunkPtr {
            desc: di,
            chunk_next: -1,
        };
        self.link_insert_head(bucket, di);
    }

    /// Drop one chunk's reference to its descriptor; at zero the
    /// descriptor becomes a free-space record, merged with any
    /// address-adjacent free neighbors.
    fn chunk_unref(&mut self, chunk: u32) {
        let fdesc = self.direct_tbl[chunk as usize];
        let size = d_fragments(fdesc) + 1;
        let long_format = d_long_format(fdesc);
        let mut di = self.cptbl[chunk as usize].desc;
        assert_ne!(di, NIL, "chunk_unref of an unknown chunk");

        self.descs[di as usize].refcount -= 1;
        if self.descs[di as usize].refcount > 0 {
            if long_format {
                self.aggr_fragments_long -= size;
                self.aggr_chunks_long -= 1;
            } else {
                self.aggr_fragments_short -= size << 1;
                self.aggr_chunks_short -= 1;
            }
            // Unlink this chunk from the member chain.
            if self.descs[di as usize].chunk_first == chunk as i32 {
                self.descs[di as usize].chunk_first =
                    self.cptbl[chunk as usize].chunk_next;
            } else {
                let mut i = self.descs[di as usize].chunk_first;
                while self.cptbl[i as usize].chunk_next != chunk as i32 {
                    i = self.cptbl[i as usize].chunk_next;
                }
                self.cptbl[i as usize].chunk_next =
                    self.cptbl[chunk as usize].chunk_next;
            }
            self.cptbl[chunk as usize] = ChunkPtr {
                desc: NIL,
                chunk_next: -1,
            };
            return;
        }

        let bucket =
            LinkHead::Bucket(self.descs[di as usize].hash & CHUNK_HASH_MASK);
        self.link_remove(bucket, di);
        self.descs[di as usize].chunk_first = -1;
        self.descs[di as usize].cur_size = 0;
        self.cptbl[chunk as usize] = ChunkPtr {
            desc: NIL,
            chunk_next: -1,
        };

        // Keep the free list sorted by ascending base.
        if self.unused_head == NIL {
            self.link_insert_head(LinkHead::Unused, di);
        } else {
            let mut u = self.unused_head;
            loop {
                if self.descs[u as usize].base > self.descs[di as usize].base
                {
                    self.link_insert_before(LinkHead::Unused, u, di);
                    break;
                }
                let next = self.descs[u as usize].link_next;
                if next == NIL {
                    self.link_insert_after(u, di);
                    break;
                }
                u = next;
            }
        }

        // Merge with the address-adjacent free neighbor below, then the
        // one above.
        let below = self.descs[di as usize].all_next;
        if below != NIL && self.descs[below as usize].link_next == di {
            self.link_remove(LinkHead::Unused, di);
            self.all_remove(di);
            self.descs[below as usize].max_size +=
                self.descs[di as usize].max_size;
            self.desc_free_slot(di);
            di = below;
        }
        let above = self.descs[di as usize].link_next;
        if above != NIL && self.descs[above as usize].all_next == di {
            self.link_remove(LinkHead::Unused, above);
            self.all_remove(above);
            self.descs[di as usize].max_size +=
                self.descs[above as usize].max_size;
            self.desc_free_slot(above);
        }

        if long_format {
            self.chunks_long -= 1;
            self.fragments_long -= size;
        } else {
            self.chunks_short -= 1;
            self.fragments_short -= size << 1;
        }
    }

    /// Compact the range table: repeatedly take the lowest free
    /// descriptor, shift everything live above it down over the hole and
    /// rebase the descriptors and direct entries pointing into the moved
    /// span.
    fn prune_empty_chunks(&mut self) {
        loop {
            let c1 = self.unused_head;
            if c1 == NIL {
                break;
            }
            let c1_base = self.descs[c1 as usize].base;
            let c1_max = self.descs[c1 as usize].max_size;
            let from = c1_base + c1_max;
            let to = c1_base;
            let next_free = self.descs[c1 as usize].link_next;

            let (len, fix_start);
            if next_free != NIL {
                // More free space above: shift the live span in between
                // down, the next free descriptor absorbs the hole.
                len = self.descs[next_free as usize].base - from;
                self.descs[next_free as usize].max_size += c1_max;
                fix_start = next_free;
            } else if c1 != self.all_head {
                // Single hole with live data above it.
                len = self.range_tbl_free - from;
                self.range_tbl_free -= c1_max;
                fix_start = self.all_head;
            } else {
                // Single hole at the top of the heap: shrink and done.
                self.range_tbl_free -= c1_max;
                self.all_remove(c1);
                self.link_remove(LinkHead::Unused, c1);
                self.desc_free_slot(c1);
                break;
            }

            self.range_tbl.copy_within(
                from as usize..(from + len) as usize,
                to as usize,
            );
            let mut cd = fix_start;
            while cd != c1 {
                self.descs[cd as usize].base -= c1_max;
                let mut ch = self.descs[cd as usize].chunk_first;
                while ch >= 0 {
                    let f = self.direct_tbl[ch as usize];
                    if d_fragments(f) != FRAG_MAX {
                        self.direct_tbl[ch as usize] =
                            with_base(f, d_base(f) - c1_max);
                    }
                    ch = self.cptbl[ch as usize].chunk_next;
                }
                cd = self.descs[cd as usize].all_next;
            }
            self.all_remove(c1);
            self.link_remove(LinkHead::Unused, c1);
            self.desc_free_slot(c1);
        }
    }

    //--- Descriptor arena and intrusive lists

    fn desc_alloc(&mut self, d: ChunkDesc) -> u32 {
        match self.desc_free.pop() {
            Some(i) => {
                self.descs[i as usize] = d;
                i
            }
            None => {
                self.descs.push(d);
                (self.descs.len() - 1) as u32
            }
        }
    }

    fn desc_free_slot(&mut self, idx: u32) {
        self.desc_free.push(idx);
    }

    fn all_insert_head(&mut self, idx: u32) {
        let head = self.all_head;
        self.descs[idx as usize].all_prev = NIL;
        self.descs[idx as usize].all_next = head;
        if head != NIL {
            self.descs[head as usize].all_prev = idx;
        }
        self.all_head = idx;
    }

    fn all_insert_before(&mut self, at: u32, idx: u32) {
        let prev = self.descs[at as usize].all_prev;
        self.descs[idx as usize].all_prev = prev;
        self.descs[idx as usize].all_next = at;
        self.descs[at as usize].all_prev = idx;
        match prev {
            NIL => self.all_head = idx,
            p => self.descs[p as usize].all_next = idx,
        }
    }

    fn all_remove(&mut self, idx: u32) {
        let prev = self.descs[idx as usize].all_prev;
        let next = self.descs[idx as usize].all_next;
        match prev {
            NIL => self.all_head = next,
            p => self.descs[p as usize].all_next = next,
        }
        if next != NIL {
            self.descs[next as usize].all_prev = prev;
        }
    }

    fn link_head(&self, head: LinkHead) -> u32 {
        match head {
            LinkHead::Unused => self.unused_head,
            LinkHead::Bucket(b) => self.chunk_hash_heads[b as usize],
        }
    }

    fn set_link_head(&mut self, head: LinkHead, v: u32) {
        match head {
            LinkHead::Unused => self.unused_head = v,
            LinkHead::Bucket(b) => self.chunk_hash_heads[b as usize] = v,
        }
    }

    fn link_insert_head(&mut self, head: LinkHead, idx: u32) {
        let old = self.link_head(head);
        self.descs[idx as usize].link_prev = NIL;
        self.descs[idx as usize].link_next = old;
        if old != NIL {
            self.descs[old as usize].link_prev = idx;
        }
        self.set_link_head(head, idx);
    }

    fn link_insert_before(&mut self, head: LinkHead, at: u32, idx: u32) {
        let prev = self.descs[at as usize].link_prev;
        self.descs[idx as usize].link_prev = prev;
        self.descs[idx as usize].link_next = at;
        self.descs[at as usize].link_prev = idx;
        match prev {
            NIL => self.set_link_head(head, idx),
            p => self.descs[p as usize].link_next = idx,
        }
    }

    fn link_insert_after(&mut self, at: u32, idx: u32) {
        let next = self.descs[at as usize].link_next;
        self.descs[idx as usize].link_prev = at;
        self.descs[idx as usize].link_next = next;
        self.descs[at as usize].link_next = idx;
        if next != NIL {
            self.descs[next as usize].link_prev = idx;
        }
    }

    fn link_remove(&mut self, head: LinkHead, idx: u32) {
        let prev = self.descs[idx as usize].link_prev;
        let next = self.descs[idx as usize].link_next;
        match prev {
            NIL => self.set_link_head(head, next),
            p => self.descs[p as usize].link_next = next,
        }
        if next != NIL {
            self.descs[next as usize].link_prev = prev;
        }
    }
}

impl Default for DxrLookup {
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

    impl DxrLookup {
        // Structural invariants of the chunk bookkeeping, checked after
        // every batch in tests.
        fn check_invariants(&self) {
            // The all list, ordered by descending base, covers exactly
            // [0, range_tbl_free) with neither gap nor overlap.
            let mut expected_top = self.range_tbl_free;
            let mut i = self.all_head;
            while i != NIL {
                let d = self.descs[i as usize];
                assert_eq!(
                    d.base + d.max_size,
                    expected_top,
                    "gap or overlap at descriptor {}",
                    i
                );
                assert!(d.cur_size <= d.max_size);
                expected_top = d.base;
                i = d.all_next;
            }
            assert_eq!(expected_top, 0, "all list does not reach base 0");

            // Every descriptor's refcount equals the number of direct
            // entries pointing at its base, and its member chain lists
            // exactly those chunks.
            let mut i = self.all_head;
            while i != NIL {
                let d = self.descs[i as usize];
                if d.cur_size > 0 {
                    let mut members = 0;
                    let mut ch = d.chunk_first;
                    while ch >= 0 {
                        assert_eq!(self.cptbl[ch as usize].desc, i);
                        assert_eq!(
                            d_base(self.direct_tbl[ch as usize]),
                            d.base
                        );
                        members += 1;
                        ch = self.cptbl[ch as usize].chunk_next;
                    }
                    assert_eq!(members, d.refcount);
                }
                i = d.all_next;
            }
            let pointing = self
                .direct_tbl
                .iter()
                .filter(|&&f| d_fragments(f) != FRAG_MAX)
                .count() as u32;
            let mut refs = 0;
            let mut i = self.all_head;
            while i != NIL {
                refs += self.descs[i as usize].refcount;
                i = self.descs[i as usize].all_next;
            }
            assert_eq!(pointing, refs);
        }
    }

    #[test]
    fn lookup_before_and_after_apply() {
        let mut dxr = DxrLookup::new();
        dxr.add_route(&route(0x0a000000, 8, 1), false).unwrap();
        assert_eq!(dxr.lookup_route(0x0a010203).0, -1);
        dxr.apply_pending();
        assert_eq!(dxr.lookup_route(0x0a010203).0, 1);
        assert_eq!(dxr.lookup_route(0x0b000001).0, -1);
        dxr.check_invariants();
    }

    #[test]
    fn aligned_routes_build_short_chunks() {
        let mut dxr = DxrLookup::new();
        // Two /22s in one /20 chunk, 256-aligned, small handles.
        dxr.add_route(&route(0x0a050000, 22, 1), false).unwrap();
        dxr.add_route(&route(0x0a050800, 22, 2), false).unwrap();
        dxr.apply_pending();
        dxr.check_invariants();

        let st = dxr.status();
        assert_eq!(st.chunks_short, 1);
        assert_eq!(st.chunks_long, 0);
        assert_eq!(dxr.lookup_route(0x0a050123).0, 1);
        assert_eq!(dxr.lookup_route(0x0a0507ff).0, -1);
        assert_eq!(dxr.lookup_route(0x0a050933).0, 2);
        assert_eq!(dxr.lookup_route(0x0a050c00).0, -1);
    }

    #[test]
    fn misaligned_routes_fall_back_to_long_chunks() {
        let mut dxr = DxrLookup::new();
        dxr.add_route(&route(0x0a050040, 26, 1), false).unwrap();
        dxr.apply_pending();
        dxr.check_invariants();

        let st = dxr.status();
        assert_eq!(st.chunks_short, 0);
        assert_eq!(st.chunks_long, 1);
        assert_eq!(dxr.lookup_route(0x0a05003f).0, -1);
        assert_eq!(dxr.lookup_route(0x0a050040).0, 1);
        assert_eq!(dxr.lookup_route(0x0a05007f).0, 1);
        assert_eq!(dxr.lookup_route(0x0a050080).0, -1);
    }

    #[test]
    fn identical_chunks_share_one_descriptor() {
        let mut dxr = DxrLookup::new();
        // The same relative layout in three different /20 chunks.
        dxr.add_route(&route(0x0a050800, 21, 1), false).unwrap();
        dxr.add_route(&route(0x0a061800, 21, 1), false).unwrap();
        dxr.add_route(&route(0x0a072800, 21, 1), false).unwrap();
        dxr.apply_pending();
        dxr.check_invariants();

        let st = dxr.status();
        assert_eq!(st.chunks_short, 1);
        assert_eq!(st.aggr_chunks_short, 2);
        // One stored copy, three direct entries on it.
        assert_eq!(dxr.lookup_route(0x0a050900).0, 1);
        assert_eq!(dxr.lookup_route(0x0a061900).0, 1);
        assert_eq!(dxr.lookup_route(0x0a072900).0, 1);

        // Dropping one sharer keeps the copy alive.
        dxr.remove_route(0x0a072800, 21).unwrap();
        dxr.apply_pending();
        dxr.check_invariants();
        assert_eq!(dxr.status().chunks_short, 1);
        assert_eq!(dxr.status().aggr_chunks_short, 1);
        assert_eq!(dxr.lookup_route(0x0a072900).0, -1);
        assert_eq!(dxr.lookup_route(0x0a061900).0, 1);
    }

    #[test]
    fn holes_get_merged_and_pruned() {
        let mut dxr = DxrLookup::new();
        // Distinct content in several chunks, then remove from the
        // middle so compaction has to shift and rebase.
        for i in 0..6u32 {
            dxr.add_route(
                &route(0x0a000000 + (i << RANGE_SHIFT) + 0x800, 21, i as i32 + 1),
                false,
            )
            .unwrap();
        }
        dxr.apply_pending();
        dxr.check_invariants();
        let used_before = dxr.range_tbl_free;

        dxr.remove_route(0x0a001800, 21).unwrap();
        dxr.remove_route(0x0a003800, 21).unwrap();
        dxr.apply_pending();
        dxr.check_invariants();
        assert!(dxr.range_tbl_free < used_before);
        assert_eq!(dxr.unused_head, NIL);

        for (i, probe) in
            [0x0a000900u32, 0x0a002900, 0x0a004900, 0x0a005900].iter().enumerate()
        {
            let want = [1, 3, 5, 6][i];
            assert_eq!(dxr.lookup_route(*probe).0, want);
        }
        assert_eq!(dxr.lookup_route(0x0a001900).0, -1);
        assert_eq!(dxr.lookup_route(0x0a003900).0, -1);
    }

    #[test]
    fn freed_descriptors_get_recycled_within_a_batch() {
        let mut dxr = DxrLookup::new();
        dxr.add_route(&route(0x0a000800, 21, 1), false).unwrap();
        dxr.add_route(&route(0x0a001800, 21, 2), false).unwrap();
        dxr.apply_pending();
        dxr.check_invariants();

        // One batch that both frees a descriptor (the emptied chunk
        // comes first) and stages a new chunk able to reuse its space.
        dxr.remove_route(0x0a000800, 21).unwrap();
        dxr.add_route(&route(0x0a001800, 21, 3), true).unwrap();
        dxr.apply_pending();
        dxr.check_invariants();

        assert_eq!(dxr.lookup_route(0x0a000900).0, -1);
        assert_eq!(dxr.lookup_route(0x0a001900).0, 3);
        assert_eq!(dxr.unused_head, NIL);
    }

    #[test]
    fn big_handles_force_long_format() {
        let mut dxr = DxrLookup::new();
        // Burn through 300 handles so the interesting route gets one
        // above 0xff.
        for i in 0..300u32 {
            dxr.add_route(&route(0x14000000 + (i << 12), 24, i as i32), false)
                .unwrap();
        }
        dxr.add_route(&route(0x0a050000, 21, 7777), false).unwrap();
        dxr.apply_pending();
        dxr.check_invariants();
        assert_eq!(dxr.lookup_route(0x0a050001).0, 7777);
        // The chunk holding the big handle cannot be short.
        let d = dxr.direct_tbl[(0x0a050000u32 >> RANGE_SHIFT) as usize];
        assert!(d_long_format(d));
    }

    #[test]
    fn flush_tears_down_all_chunks() {
        let mut dxr = DxrLookup::new();
        for i in 0..32u32 {
            dxr.add_route(&route(0x0a000000 + (i << 13), 20, (i % 5) as i32), false)
                .unwrap();
        }
        dxr.add_route(&route(0x0a050040, 26, 9), false).unwrap();
        dxr.apply_pending();
        dxr.check_invariants();

        dxr.flush();
        dxr.check_invariants();
        assert_eq!(dxr.prefix_count(), 0);
        assert_eq!(dxr.nexthop_count(), 0);
        assert_eq!(dxr.lookup_route(0x0a000001).0, -1);
        assert_eq!(dxr.lookup_route(0).0, -1);

        // And the engine rebuilds cleanly afterwards.
        dxr.add_route(&route(0x0a050800, 21, 3), false).unwrap();
        dxr.apply_pending();
        dxr.check_invariants();
        assert_eq!(dxr.lookup_route(0x0a050900).0, 3);
    }

    #[test]
    fn chunk_straddling_routes_touch_every_chunk() {
        let mut dxr = DxrLookup::new();
        // A /14 spans 64 /20 chunks.
        dxr.add_route(&route(0x0a040000, 14, 2), false).unwrap();
        dxr.apply_pending();
        dxr.check_invariants();
        assert_eq!(dxr.lookup_route(0x0a040000).0, 2);
        assert_eq!(dxr.lookup_route(0x0a059999).0, 2);
        assert_eq!(dxr.lookup_route(0x0a07ffff).0, 2);
        assert_eq!(dxr.lookup_route(0x0a080000).0, -1);
        // All of them fold to a single value, nothing is stored.
        assert_eq!(dxr.range_tbl_free, 0);
    }
}
