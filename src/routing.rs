//! Longest-prefix routing over hierarchical addresses.
//!
//! The table is a trie keyed per label, so a lookup costs one map probe per
//! label of the destination. Among entries matching a destination, the
//! longest prefix wins; ties break by highest priority, then by earliest
//! insertion.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::address::Address;
use crate::types::PeerId;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub prefix: String,
    pub next_hop: PeerId,
    pub priority: i32,
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    entries: Vec<RouteEntry>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.entries.is_empty()
    }

    fn prune(&mut self) {
        self.children.retain(|_, child| {
            child.prune();
            !child.is_empty()
        });
    }
}

#[derive(Debug, Default)]
struct Inner {
    root: TrieNode,
    /// Entries at the root are the explicitly configured catch-all routes.
    next_seq: u64,
}

/// Routing table shared across the node. Reads run in parallel; writes take
/// the exclusive lock.
#[derive(Debug, Default)]
pub struct RoutingTable {
    inner: RwLock<Inner>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route. `next_hop` need not correspond to a live session.
    pub fn insert(&self, prefix: &Address, next_hop: PeerId, priority: i32) {
        let mut inner = self.inner.write().expect("routing table lock poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let node = prefix.labels().fold(&mut inner.root, |node, label| {
            node.children.entry(label.to_string()).or_default()
        });
        node.entries.push(RouteEntry {
            prefix: prefix.as_str().to_string(),
            next_hop,
            priority,
            seq,
        });
    }

    /// Insert the catch-all default route, matching every destination.
    pub fn insert_default(&self, next_hop: PeerId, priority: i32) {
        let mut inner = self.inner.write().expect("routing table lock poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.root.entries.push(RouteEntry {
            prefix: String::new(),
            next_hop,
            priority,
            seq,
        });
    }

    /// Remove all routes with exactly this prefix and next hop.
    pub fn remove(&self, prefix: &Address, next_hop: &PeerId) {
        let mut inner = self.inner.write().expect("routing table lock poisoned");
        let mut node = Some(&mut inner.root);
        for label in prefix.labels() {
            node = node.and_then(|n| n.children.get_mut(label));
        }
        if let Some(node) = node {
            node.entries.retain(|e| &e.next_hop != next_hop);
        }
        inner.root.prune();
    }

    /// Remove every route pointing at `peer`, e.g. when the peer is
    /// decommissioned.
    pub fn remove_all_for_peer(&self, peer: &PeerId) {
        let mut inner = self.inner.write().expect("routing table lock poisoned");
        fn walk(node: &mut TrieNode, peer: &PeerId) {
            node.entries.retain(|e| &e.next_hop != peer);
            for child in node.children.values_mut() {
                walk(child, peer);
            }
        }
        walk(&mut inner.root, peer);
        inner.root.prune();
    }

    /// Longest label-aligned prefix match; ties by highest priority, then
    /// earliest insertion. Absent when nothing matches.
    pub fn lookup(&self, addr: &Address) -> Option<PeerId> {
        let inner = self.inner.read().expect("routing table lock poisoned");
        let mut best: Option<&RouteEntry> = best_of(&inner.root.entries);
        let mut node = &inner.root;
        for label in addr.labels() {
            match node.children.get(label) {
                Some(child) => {
                    node = child;
                    if let Some(candidate) = best_of(&node.entries) {
                        // Deeper always wins over shallower.
                        best = Some(candidate);
                    }
                }
                None => break,
            }
        }
        best.map(|e| e.next_hop.clone())
    }

    /// Snapshot of all entries, for the admin surface.
    pub fn entries(&self) -> Vec<RouteEntry> {
        let inner = self.inner.read().expect("routing table lock poisoned");
        let mut out = Vec::new();
        fn walk(node: &TrieNode, out: &mut Vec<RouteEntry>) {
            out.extend(node.entries.iter().cloned());
            for child in node.children.values() {
                walk(child, out);
            }
        }
        walk(&inner.root, &mut out);
        out.sort_by(|a, b| a.prefix.cmp(&b.prefix).then(a.seq.cmp(&b.seq)));
        out
    }
}

fn best_of(entries: &[RouteEntry]) -> Option<&RouteEntry> {
    entries.iter().min_by_key(|e| (Reverse(e.priority), e.seq))
}
