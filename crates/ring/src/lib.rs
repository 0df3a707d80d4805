//! Consistent hash ring with virtual nodes.
//!
//! Each physical node owns many positions on a 64-bit ring; a key is
//! served by the first position clockwise of its hash. Virtual nodes
//! smooth the per-node share, and replica sets are built by continuing
//! the clockwise walk until enough *distinct* physical nodes are seen.
//!
//! The ring is built once at startup from the static cluster config and
//! treated as immutable by the coordinator; mutation is only exercised
//! by tests and requires external serialization.

use dkvs_common::hash::hash64;
use dkvs_common::NodeInfo;
use std::collections::BTreeMap;
use std::collections::HashMap;

/// Default number of virtual nodes per physical node.
pub const DEFAULT_VNODES: u32 = 128;

#[derive(Debug, Default)]
pub struct HashRing {
    /// position -> owning node. Positions are unique; collisions are
    /// dropped at insertion.
    ring: BTreeMap<u64, NodeInfo>,
    /// node_id -> address, one entry per physical node.
    nodes: HashMap<u32, String>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a physical node with `vnodes` ring positions. Position `i` is
    /// the hash of `"<node_id>:<i>"`; a position already taken by an
    /// earlier insertion is skipped.
    pub fn add_node(&mut self, node_id: u32, address: &str, vnodes: u32) {
        self.nodes.insert(node_id, address.to_string());
        let info = NodeInfo::new(node_id, address);

        for i in 0..vnodes {
            let vnode_key = format!("{}:{}", node_id, i);
            let position = hash64(vnode_key.as_bytes());

            if self.ring.contains_key(&position) {
                tracing::warn!(position, node_id, vnode = i, "ring position collision, skipping");
                continue;
            }
            self.ring.insert(position, info.clone());
        }
    }

    /// Remove every position owned by `node_id`.
    pub fn remove_node(&mut self, node_id: u32) {
        self.ring.retain(|_, info| info.node_id != node_id);
        self.nodes.remove(&node_id);
    }

    /// The node owning `key`: first position strictly greater than the
    /// key's hash, wrapping to the ring's smallest position.
    pub fn get_node(&self, key: &[u8]) -> Option<&NodeInfo> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = hash64(key);
        self.ring
            .range(hash.wrapping_add(1)..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, info)| info)
    }

    /// The replica set for `key`: up to `count` distinct physical nodes,
    /// in clockwise walk order starting from the owner. Deterministic for
    /// a given ring.
    pub fn get_replica_nodes(&self, key: &[u8], count: usize) -> Vec<NodeInfo> {
        let mut result: Vec<NodeInfo> = Vec::new();
        if self.ring.is_empty() || count == 0 {
            return result;
        }
        let want = count.min(self.nodes.len());

        let hash = hash64(key);
        let walk = self
            .ring
            .range(hash.wrapping_add(1)..)
            .chain(self.ring.range(..=hash));

        for (_, info) in walk {
            if result.iter().any(|n| n.node_id == info.node_id) {
                continue;
            }
            result.push(info.clone());
            if result.len() == want {
                break;
            }
        }
        result
    }

    /// Number of physical nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of ring positions (virtual nodes).
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Iterate over the physical nodes (id, address).
    pub fn nodes(&self) -> impl Iterator<Item = (u32, &str)> {
        self.nodes.iter().map(|(id, addr)| (*id, addr.as_str()))
    }

    /// Address of a physical node, if present.
    pub fn address_of(&self, node_id: u32) -> Option<&str> {
        self.nodes.get(&node_id).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
