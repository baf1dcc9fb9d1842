//! Rotating assignment of addresses to cluster nodes.
//!
//! Each tick pairs at most `min(nodes, addresses)` nodes with distinct
//! addresses. The larger of the two lists is rotated by the tick cursor so
//! that, over `lcm(nodes, addresses)` ticks, every node gets to measure every
//! address and idle turns are spread evenly.
//!
//! Node order is fixed: the local node first, then peers sorted by id.

use std::sync::atomic::{AtomicU64, Ordering};

/// Node that carries out an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Local,
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub target: Target,
    pub address: String,
}

/// Compute the assignments for one tick.
///
/// `peers` may come in any order; `addresses` is used in configured order.
pub fn plan(peers: &[String], addresses: &[String], cursor: u64) -> Vec<Assignment> {
    let mut sorted_peers: Vec<&String> = peers.iter().collect();
    sorted_peers.sort();

    let nodes: Vec<Target> = std::iter::once(Target::Local)
        .chain(sorted_peers.into_iter().map(|id| Target::Remote(id.clone())))
        .collect();

    let node_count = nodes.len();
    let address_count = addresses.len();
    let active = node_count.min(address_count);

    if address_count > node_count {
        let offset = (cursor % address_count as u64) as usize;
        nodes
            .into_iter()
            .enumerate()
            .map(|(i, target)| Assignment {
                target,
                address: addresses[(i + offset) % address_count].clone(),
            })
            .collect()
    } else {
        let offset = (cursor % node_count as u64) as usize;
        (0..active)
            .map(|i| Assignment {
                target: nodes[(i + offset) % node_count].clone(),
                address: addresses[i].clone(),
            })
            .collect()
    }
}

/// Owns the rotation cursor.
#[derive(Debug, Default)]
pub struct Scheduler {
    cursor: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan the next tick and advance the cursor by one.
    pub fn next_plan(&self, peers: &[String], addresses: &[String]) -> Vec<Assignment> {
        let cursor = self.cursor.fetch_add(1, Ordering::SeqCst);
        plan(peers, addresses, cursor)
    }

    /// Number of ticks planned so far.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }
}
