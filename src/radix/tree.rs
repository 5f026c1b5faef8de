use log::trace;

use super::node::{NodeArena, NodeIdx, RadixNode};
use crate::types::errors::RouteStoreError;
use crate::types::AddressFamily;

//------------ Walk protocol -------------------------------------------------

/// What a walk callback wants the walker to do next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkAction {
    /// Keep going.
    Continue,
    /// End the walk cleanly.
    Stop,
    /// Unwind the walk and hand the code back to the caller.
    Abort(i32),
}

/// How a walk ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkOutcome {
    /// The subtree was exhausted.
    Complete,
    /// The callback returned [`WalkAction::Stop`].
    Stopped,
    /// The callback returned [`WalkAction::Abort`].
    Aborted(i32),
}

/// A routed prefix as presented to tree walkers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LeafRef<AF> {
    pub key: AF,
    pub plen: u8,
    pub nexthop: u16,
}

//------------ RadixTree -----------------------------------------------------

/// A path-compressed binary trie over prefixes, the authoritative route
/// store behind every lookup engine in this crate.
///
/// Nodes are keyed by `(prefix, length)` and held in an arena; a route
/// with the same key as a shorter route sits in the subtree below it, so
/// equal-key prefixes of different lengths form an ancestor chain rather
/// than a side list. Branching at a node is on the bit right after its
/// prefix, which keeps an in-order traversal sorted by key, shortest
/// prefix first among equal keys.
///
/// The longest-match walk descends while the current node's prefix still
/// covers the search key, remembering the last route seen; the deepest
/// such route is the answer. No backtracking is needed because every
/// covering prefix lies on the descent path.
pub struct RadixTree<AF: AddressFamily> {
    arena: NodeArena<AF>,
    root: Option<NodeIdx>,
    leaves: u32,
}

impl<AF: AddressFamily> RadixTree<AF> {
    pub fn new() -> Self {
        RadixTree {
            arena: NodeArena::new(),
            root: None,
            leaves: 0,
        }
    }

    /// The number of routed prefixes in the tree.
    pub fn len(&self) -> u32 {
        self.leaves
    }

    pub fn is_empty(&self) -> bool {
        self.leaves == 0
    }

    /// Insert a route for `key/plen`. Fails without mutating the tree if
    /// one is already present.
    pub fn add(
        &mut self,
        key: AF,
        plen: u8,
        nexthop: u16,
    ) -> Result<(), RouteStoreError> {
        debug_assert!(plen <= AF::BITS);
        let key = key.truncate_to_len(plen);
        trace!("radix add {:?}/{}", key, plen);

        let mut cur = match self.root {
            None => {
                self.root = Some(self.arena.alloc(RadixNode {
                    key,
                    plen,
                    nexthop: Some(nexthop),
                    parent: None,
                    children: [None, None],
                }));
                self.leaves += 1;
                return Ok(());
            }
            Some(r) => r,
        };

        loop {
            let n = *self.arena.get(cur);
            let branch =
                key.common_prefix_len(n.key).min(plen).min(n.plen);

            if branch < n.plen {
                // The new prefix diverges somewhere above `cur`: a new
                // node gets spliced in between `cur` and its parent.
                let new_idx = if branch == plen {
                    // `key` is a proper prefix of `n.key`; the new
                    // routed node adopts `cur` as its only child.
                    let idx = self.arena.alloc(RadixNode {
                        key,
                        plen,
                        nexthop: Some(nexthop),
                        parent: n.parent,
                        children: [None, None],
                    });
                    let bit = n.key.is_bit_set(plen) as usize;
                    self.arena.get_mut(idx).children[bit] = Some(cur);
                    idx
                } else {
                    // True divergence: glue node at the first
                    // differing bit, `cur` and the new leaf below it.
                    let glue = self.arena.alloc(RadixNode {
                        key: key.truncate_to_len(branch),
                        plen: branch,
                        nexthop: None,
                        parent: n.parent,
                        children: [None, None],
                    });
                    let leaf = self.arena.alloc(RadixNode {
                        key,
                        plen,
                        nexthop: Some(nexthop),
                        parent: Some(glue),
                        children: [None, None],
                    });
                    let bit = key.is_bit_set(branch) as usize;
                    self.arena.get_mut(glue).children[bit] = Some(leaf);
                    self.arena.get_mut(glue).children[1 - bit] =
                        Some(cur);
                    glue
                };
                self.replace_child(n.parent, cur, Some(new_idx));
                self.arena.get_mut(cur).parent = Some(new_idx);
                self.leaves += 1;
                return Ok(());
            }

            // branch == n.plen: the new prefix passes through `cur`.
            if plen == n.plen {
                debug_assert_eq!(key, n.key);
                if n.nexthop.is_some() {
                    return Err(RouteStoreError::RouteAlreadyExists);
                }
                self.arena.get_mut(cur).nexthop = Some(nexthop);
                self.leaves += 1;
                return Ok(());
            }

            let bit = key.is_bit_set(n.plen) as usize;
            match n.children[bit] {
                Some(c) => cur = c,
                None => {
                    let leaf = self.arena.alloc(RadixNode {
                        key,
                        plen,
                        nexthop: Some(nexthop),
                        parent: Some(cur),
                        children: [None, None],
                    });
                    self.arena.get_mut(cur).children[bit] = Some(leaf);
                    self.leaves += 1;
                    return Ok(());
                }
            }
        }
    }

    /// Remove the route for exactly `key/plen` and return its nexthop
    /// handle. Fails without mutating the tree if none is present.
    pub fn delete(
        &mut self,
        key: AF,
        plen: u8,
    ) -> Result<u16, RouteStoreError> {
        let key = key.truncate_to_len(plen);
        let idx = self
            .find_exact(key, plen)
            .ok_or(RouteStoreError::RouteNotFound)?;
        trace!("radix delete {:?}/{}", key, plen);
        let nh = self.arena.get_mut(idx).nexthop.take();
        self.leaves -= 1;
        self.cleanup(idx);
        nh.ok_or(RouteStoreError::RouteNotFound)
    }

    /// The nexthop handle of the route stored for exactly `key/plen`.
    pub fn lookup_exact(&self, key: AF, plen: u8) -> Option<u16> {
        self.find_exact(key.truncate_to_len(plen), plen)
            .and_then(|idx| self.arena.get(idx).nexthop)
    }

    /// Swap the nexthop handle of the route stored for exactly
    /// `key/plen`, returning the old one.
    pub(crate) fn replace_nexthop(
        &mut self,
        key: AF,
        plen: u8,
        nexthop: u16,
    ) -> Option<u16> {
        let idx = self.find_exact(key.truncate_to_len(plen), plen)?;
        self.arena.get_mut(idx).nexthop.replace(nexthop)
    }

    /// The most specific route covering `addr`, if any.
    pub fn match_longest(&self, addr: AF) -> Option<LeafRef<AF>> {
        let mut best = None;
        let mut cur = self.root?;
        loop {
            let n = self.arena.get(cur);
            if addr.truncate_to_len(n.plen) != n.key {
                break;
            }
            if let Some(nh) = n.nexthop {
                best = Some(LeafRef {
                    key: n.key,
                    plen: n.plen,
                    nexthop: nh,
                });
            }
            if n.plen >= AF::BITS {
                break;
            }
            match n.children[addr.is_bit_set(n.plen) as usize] {
                Some(c) => cur = c,
                None => break,
            }
        }
        best
    }

    /// Visit every routed prefix in key order, shortest prefix first
    /// among equal keys.
    pub fn walk<F>(&self, f: F) -> WalkOutcome
    where
        F: FnMut(LeafRef<AF>) -> WalkAction,
    {
        self.walk_from(AF::ZERO, 0, f)
    }

    /// Visit, in the same order as [`RadixTree::walk`], every routed
    /// prefix whose key falls within `start/plen`.
    pub fn walk_from<F>(&self, start: AF, plen: u8, mut f: F) -> WalkOutcome
    where
        F: FnMut(LeafRef<AF>) -> WalkAction,
    {
        let start = start.truncate_to_len(plen);
        let end = start.range_end(plen);
        match self.root {
            Some(r) => self.walk_node(r, start, end, &mut f),
            None => WalkOutcome::Complete,
        }
    }

    fn walk_node<F>(
        &self,
        idx: NodeIdx,
        start: AF,
        end: AF,
        f: &mut F,
    ) -> WalkOutcome
    where
        F: FnMut(LeafRef<AF>) -> WalkAction,
    {
        let n = self.arena.get(idx);
        if n.key > end {
            // The whole subtree lies past the range.
            return WalkOutcome::Complete;
        }
        if n.key >= start {
            if let Some(nh) = n.nexthop {
                match f(LeafRef {
                    key: n.key,
                    plen: n.plen,
                    nexthop: nh,
                }) {
                    WalkAction::Continue => {}
                    WalkAction::Stop => return WalkOutcome::Stopped,
                    WalkAction::Abort(e) => {
                        return WalkOutcome::Aborted(e)
                    }
                }
            }
        }
        for child in n.children.into_iter().flatten() {
            let c = self.arena.get(child);
            if c.key.range_end(c.plen) < start {
                // The whole subtree lies before the range.
                continue;
            }
            match self.walk_node(child, start, end, f) {
                WalkOutcome::Complete => {}
                other => return other,
            }
        }
        WalkOutcome::Complete
    }

    fn find_exact(&self, key: AF, plen: u8) -> Option<NodeIdx> {
        let mut cur = self.root?;
        loop {
            let n = self.arena.get(cur);
            if n.plen > plen || key.truncate_to_len(n.plen) != n.key {
                return None;
            }
            if n.plen == plen {
                return if n.nexthop.is_some() { Some(cur) } else { None };
            }
            cur = n.children[key.is_bit_set(n.plen) as usize]?;
        }
    }

    fn replace_child(
        &mut self,
        parent: Option<NodeIdx>,
        old: NodeIdx,
        new: Option<NodeIdx>,
    ) {
        match parent {
            Some(p) => {
                let pn = self.arena.get_mut(p);
                if pn.children[0] == Some(old) {
                    pn.children[0] = new;
                } else {
                    debug_assert_eq!(pn.children[1], Some(old));
                    pn.children[1] = new;
                }
            }
            None => self.root = new,
        }
    }

    // Splice or drop `idx` if it no longer carries a route and has fewer
    // than two children, then the same for a glue parent left with a
    // single child.
    fn cleanup(&mut self, idx: NodeIdx) {
        let n = *self.arena.get(idx);
        if n.nexthop.is_some() {
            return;
        }
        let mut kids = n.children.into_iter().flatten();
        match (kids.next(), kids.next()) {
            (Some(_), Some(_)) => {}
            (Some(child), None) => {
                self.arena.get_mut(child).parent = n.parent;
                self.replace_child(n.parent, idx, Some(child));
                self.arena.free(idx);
            }
            (None, _) => {
                self.replace_child(n.parent, idx, None);
                self.arena.free(idx);
                if let Some(p) = n.parent {
                    self.cleanup(p);
                }
            }
        }
    }
}

impl<AF: AddressFamily> Default for RadixTree<AF> {
    fn default() -> Self {
        Self::new()
    }
}
