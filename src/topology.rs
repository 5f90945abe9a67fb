//! Rank tree used to route collective traffic.
//!
//! [`TreeTopology`] lays ranks out as a k-ary heap rooted at rank 0:
//! the children of `r` are `k*r + 1 ..= k*r + k` (clipped to the cluster) and
//! the parent of `r > 0` is `(r - 1) / k`. The mapping is a pure function of
//! `(size, arity)`, so every process that agrees on those two numbers computes
//! the same tree.

use crate::debug_invariants::DebugInvariants;
use crate::rpc_error::RpcError;
use std::ops::Range;

/// Integer identity of a process within the cluster.
pub type Rank = usize;

/// The fixed root of every collective.
pub const ROOT: Rank = 0;

/// Default branching factor (binary tree).
pub const DEFAULT_ARITY: usize = 2;

/// Deterministic rooted tree over ranks `0..size`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TreeTopology {
    size: usize,
    arity: usize,
}

impl TreeTopology {
    /// Build a k-ary tree over `size` ranks.
    ///
    /// # Errors
    /// `InvalidConfig` when `size == 0` or `arity == 0`.
    pub fn new(size: usize, arity: usize) -> Result<Self, RpcError> {
        if size == 0 {
            return Err(RpcError::InvalidConfig(
                "cluster size must be at least 1".into(),
            ));
        }
        if arity == 0 {
            return Err(RpcError::InvalidConfig(
                "tree arity must be at least 1".into(),
            ));
        }
        Ok(Self { size, arity })
    }

    /// Binary tree over `size` ranks.
    pub fn binary(size: usize) -> Result<Self, RpcError> {
        Self::new(size, DEFAULT_ARITY)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn contains(&self, rank: Rank) -> bool {
        rank < self.size
    }

    pub fn is_root(&self, rank: Rank) -> bool {
        rank == ROOT
    }

    /// Parent of `rank`; `None` for the root and for ranks outside the cluster.
    pub fn parent(&self, rank: Rank) -> Option<Rank> {
        if rank == ROOT || !self.contains(rank) {
            None
        } else {
            Some((rank - 1) / self.arity)
        }
    }

    /// Children of `rank` in ascending order. Empty for leaves and for ranks
    /// outside the cluster.
    pub fn children(&self, rank: Rank) -> Range<Rank> {
        if !self.contains(rank) {
            return 0..0;
        }
        let first = rank.saturating_mul(self.arity).saturating_add(1);
        let last = first.saturating_add(self.arity).min(self.size);
        if first >= last { 0..0 } else { first..last }
    }

    pub fn n_children(&self, rank: Rank) -> usize {
        self.children(rank).len()
    }

    /// The `i`-th child of `rank`, if it exists.
    pub fn child(&self, rank: Rank, i: usize) -> Option<Rank> {
        self.children(rank).nth(i)
    }

    pub fn is_leaf(&self, rank: Rank) -> bool {
        self.children(rank).is_empty()
    }

    /// Number of edges between `rank` and the root.
    pub fn depth(&self, rank: Rank) -> usize {
        let mut depth = 0;
        let mut cur = rank;
        while let Some(p) = self.parent(cur) {
            cur = p;
            depth += 1;
        }
        depth
    }

    /// Depth of the deepest rank.
    pub fn height(&self) -> usize {
        // Heap layout: the last rank is always among the deepest.
        self.depth(self.size - 1)
    }

    /// Messages one barrier moves across the whole cluster: one notify up and
    /// one release down per non-root rank.
    pub fn barrier_message_count(&self) -> usize {
        2 * (self.size - 1)
    }
}

impl DebugInvariants for TreeTopology {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "TreeTopology");
    }

    fn validate_invariants(&self) -> Result<(), RpcError> {
        if self.parent(ROOT).is_some() {
            return Err(RpcError::InvalidConfig("root has a parent".into()));
        }
        let mut seen = vec![false; self.size];
        seen[ROOT] = true;
        for r in 0..self.size {
            if self.children(r).len() > self.arity {
                return Err(RpcError::InvalidConfig(format!(
                    "rank {r} has more than {} children",
                    self.arity
                )));
            }
            for c in self.children(r) {
                if seen[c] {
                    return Err(RpcError::InvalidConfig(format!(
                        "rank {c} reached twice"
                    )));
                }
                if self.parent(c) != Some(r) {
                    return Err(RpcError::InvalidConfig(format!(
                        "rank {c} is a child of {r} but reports parent {:?}",
                        self.parent(c)
                    )));
                }
                seen[c] = true;
            }
        }
        if let Some(missing) = seen.iter().position(|s| !s) {
            return Err(RpcError::InvalidConfig(format!(
                "rank {missing} is not reachable from the root"
            )));
        }
        Ok(())
    }
}
