//! Bandwidth-reducing constraint ordering.
//!
//! Each constraint is a node; a [`ConstraintPair`] whose producer differs
//! from its consumer is an (undirected) edge. The ordering is
//! Cuthill-McKee: take the lowest-degree unvisited node as a root, traverse
//! breadth-first visiting each node's neighbours in ascending order of
//! degree, and number nodes in visitation order. Disconnected components
//! are handled by picking a new root whenever the queue runs dry.
//!
//! Ties are broken by current position, so the result is deterministic.
//!
//! # Example
//!
//! ```
//! use sim_satisfy::{sort_constraints, ConstraintPair};
//!
//! // 0 - 2 - 1 as a path, stored out of order.
//! let pairs = [ConstraintPair::new(0, 2), ConstraintPair::new(2, 1)];
//! let order = sort_constraints(3, &pairs);
//!
//! assert_eq!(order, vec![0, 2, 1]);
//! ```

use std::collections::VecDeque;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Directed dependency edge: `producer`'s restriction has a non-zero effect
/// on `consumer`'s error.
///
/// Both ends are positions in the manager's current constraint order.
/// Pairs are derived data and are rebuilt with every full Jacobian rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConstraintPair {
    /// Constraint whose error is affected.
    pub consumer: usize,
    /// Constraint whose restriction has the effect.
    pub producer: usize,
}

impl ConstraintPair {
    /// Create a new pair.
    #[must_use]
    pub const fn new(consumer: usize, producer: usize) -> Self {
        Self { consumer, producer }
    }

    /// Whether this pair is a diagonal (self) block.
    #[must_use]
    pub const fn is_diagonal(&self) -> bool {
        self.consumer == self.producer
    }

    /// The same pair after a reordering, given `new_position[old] = new`.
    #[must_use]
    pub fn remapped(&self, new_position: &[usize]) -> Self {
        Self::new(new_position[self.consumer], new_position[self.producer])
    }
}

/// Compute a bandwidth-reducing order of `node_count` constraints.
///
/// Returns `order` with `order[new] = old`. Pairs referring to positions at
/// or beyond `node_count` are ignored.
#[must_use]
pub fn sort_constraints(node_count: usize, pairs: &[ConstraintPair]) -> Vec<usize> {
    let mut neighbours: Vec<Vec<usize>> = vec![Vec::new(); node_count];
    for pair in pairs {
        if pair.is_diagonal() || pair.consumer >= node_count || pair.producer >= node_count {
            continue;
        }
        neighbours[pair.consumer].push(pair.producer);
        neighbours[pair.producer].push(pair.consumer);
    }
    for list in &mut neighbours {
        list.sort_unstable();
        list.dedup();
    }

    let degree: Vec<usize> = neighbours.iter().map(Vec::len).collect();
    for list in &mut neighbours {
        list.sort_by_key(|&n| (degree[n], n));
    }

    let mut roots: Vec<usize> = (0..node_count).collect();
    roots.sort_by_key(|&n| (degree[n], n));

    let mut visited = vec![false; node_count];
    let mut order = Vec::with_capacity(node_count);
    let mut queue = VecDeque::new();

    for root in roots {
        if visited[root] {
            continue;
        }
        visited[root] = true;
        queue.push_back(root);

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &next in &neighbours[node] {
                if !visited[next] {
                    visited[next] = true;
                    queue.push_back(next);
                }
            }
        }
    }

    order
}

/// Inverse of an order: `new_position[old] = new`.
#[must_use]
pub fn inverse_order(order: &[usize]) -> Vec<usize> {
    let mut new_position = vec![0; order.len()];
    for (new, &old) in order.iter().enumerate() {
        new_position[old] = new;
    }
    new_position
}

/// Whether `order` leaves every constraint where it is.
#[must_use]
pub fn is_identity(order: &[usize]) -> bool {
    order.iter().enumerate().all(|(new, &old)| new == old)
}
