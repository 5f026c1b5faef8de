use crate::table::RouteTable;
use crate::types::AddressFamily;

//------------ Chunk expansion helpers ---------------------------------------
//
// Both accelerators rebuild a stale chunk the same way: walk the radix
// tree across the chunk's address range in key order and flatten the
// visited routes into an ordered list of fragments, runs of addresses
// resolving to one nexthop. The machinery for that lives here; only the
// encoding of the fragment list differs per engine.

/// One entry on the prefix-length-priority stack: a covering route and
/// its address range.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct HeapEntry {
    pub start: u32,
    pub end: u32,
    pub preflen: u16,
    pub nexthop: u16,
}

/// The range covering `addr` according to the table's most specific
/// route, or the all-of-v4 default range when nothing covers it.
pub(crate) fn covering_entry(
    table: &RouteTable<u32>,
    addr: u32,
) -> HeapEntry {
    match table.longest_leaf(addr) {
        Some(l) => HeapEntry {
            start: l.key,
            end: l.key.range_end(l.plen),
            preflen: l.plen as u16,
            nexthop: l.nexthop,
        },
        None => HeapEntry {
            start: 0,
            end: u32::MAX,
            preflen: 0,
            nexthop: 0,
        },
    }
}

//------------ RangeHeap -----------------------------------------------------

/// Fixed-depth stack of nested covering ranges, ordered by ascending
/// prefix length from bottom to top. The top is always the most specific
/// route covering the walk's current position.
pub(crate) struct RangeHeap {
    entries: [HeapEntry; 33],
    top: usize,
}

impl RangeHeap {
    fn new(bottom: HeapEntry) -> Self {
        let mut entries = [HeapEntry::default(); 33];
        entries[0] = bottom;
        RangeHeap { entries, top: 0 }
    }

    fn top(&self) -> HeapEntry {
        self.entries[self.top]
    }

    fn len(&self) -> usize {
        self.top + 1
    }

    fn pop(&mut self) {
        debug_assert!(self.top > 0);
        self.top -= 1;
    }

    fn replace_bottom(&mut self, e: HeapEntry) {
        debug_assert_eq!(self.top, 0);
        self.entries[0] = e;
    }

    /// Insert `e` at its prefix-length position, shifting more specific
    /// entries up. Re-injecting the entry already on top is a no-op.
    fn inject(&mut self, e: HeapEntry) {
        let mut i = self.top as isize;
        while i >= 0 {
            let cur = self.entries[i as usize];
            if e.preflen > cur.preflen {
                break;
            } else if e.preflen < cur.preflen {
                self.entries[i as usize + 1] = cur;
                i -= 1;
            } else {
                // Equal length means the identical route, seen both by
                // the initial longest match and by the walk. It can
                // only be on top, so nothing got shifted yet.
                debug_assert_eq!(i, self.top as isize);
                debug_assert_eq!(cur, e);
                return;
            }
        }
        self.entries[(i + 1) as usize] = e;
        self.top += 1;
    }
}

//------------ FragCollector -------------------------------------------------

/// One maximal run of addresses resolving to the same nexthop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Frag {
    pub start: u32,
    pub nexthop: u16,
}

/// Builds a chunk's sorted, coalesced fragment list from an ordered
/// route walk.
///
/// Feed it every route the walk yields, in key order with shorter
/// prefixes first among equal keys, then call [`FragCollector::drain`].
/// The `covering` callback re-seeds the stack with the most specific
/// route around a position whenever the walk steps past the end of
/// everything currently stacked.
pub(crate) struct FragCollector<'a, F: FnMut(u32) -> HeapEntry> {
    frags: &'a mut Vec<Frag>,
    heap: RangeHeap,
    covering: F,
}

impl<'a, F: FnMut(u32) -> HeapEntry> FragCollector<'a, F> {
    pub fn new(first: u32, frags: &'a mut Vec<Frag>, mut covering: F) -> Self {
        let bottom = covering(first);
        frags.clear();
        frags.push(Frag {
            start: first,
            nexthop: bottom.nexthop,
        });
        FragCollector {
            frags,
            heap: RangeHeap::new(bottom),
            covering,
        }
    }

    /// Account for the next route the walk yielded.
    pub fn visit(&mut self, start: u32, end: u32, preflen: u16, nexthop: u16) {
        debug_assert!(start >= self.heap.top().start);
        self.pop_until(start);

        // The equal-base test runs against the post-pop top: a pop can
        // have re-seeded the stack with a more specific route starting
        // right here, and that one keeps the fragment.
        let top = self.heap.top();
        if start == top.start && preflen <= top.preflen {
            // A route no more specific than the one already covering
            // this base slides in under it, the fragment list stays as
            // is.
            self.heap.inject(HeapEntry {
                start,
                end,
                preflen,
                nexthop,
            });
            return;
        }

        self.place(start, nexthop);
        self.heap.inject(HeapEntry {
            start,
            end,
            preflen,
            nexthop,
        });
    }

    /// Flush the ranges still stacked inside the chunk once the walk is
    /// done. `last` is the chunk's highest address.
    pub fn drain(&mut self, chunk_preflen: u16, last: u32) {
        while self.heap.top().preflen > chunk_preflen {
            let oend = self.heap.top().end;
            if self.heap.len() > 1 {
                self.heap.pop();
            } else {
                let e = (self.covering)(oend.wrapping_add(1));
                self.heap.replace_bottom(e);
            }
            let t = self.heap.top();
            if t.end > oend && t.nexthop != self.last_nexthop() {
                // Stop once the popped range already reached the upper
                // chunk boundary.
                if oend >= last {
                    break;
                }
                self.place(oend + 1, t.nexthop);
            }
        }
    }

    // Pop every range ending before `pos`, emitting the boundary
    // fragment of each newly exposed wider range.
    fn pop_until(&mut self, pos: u32) {
        while pos > self.heap.top().end {
            let oend = self.heap.top().end;
            if self.heap.len() > 1 {
                self.heap.pop();
            } else {
                let e = (self.covering)(oend.wrapping_add(1));
                self.heap.replace_bottom(e);
            }
            let t = self.heap.top();
            if t.end > oend && t.nexthop != self.last_nexthop() {
                self.place(oend + 1, t.nexthop);
            }
        }
    }

    // Extend the fragment list so that addresses from `start` on resolve
    // to `nexthop`. Positions never move backwards, so this either opens
    // a new fragment, rewrites the one opened right at `start`, or
    // coalesces away a fragment made redundant by the rewrite.
    fn place(&mut self, start: u32, nexthop: u16) {
        let last = self.frags.len() - 1;
        if start > self.frags[last].start {
            if nexthop != self.frags[last].nexthop {
                self.frags.push(Frag { start, nexthop });
            }
        } else {
            debug_assert_eq!(start, self.frags[last].start);
            if nexthop != self.frags[last].nexthop {
                if last > 0 && self.frags[last - 1].nexthop == nexthop {
                    self.frags.pop();
                } else {
                    self.frags[last].nexthop = nexthop;
                }
            }
        }
    }

    fn last_nexthop(&self) -> u16 {
        self.frags[self.frags.len() - 1].nexthop
    }
}
