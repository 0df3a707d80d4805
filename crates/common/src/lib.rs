//! dkvs-common: shared types for the dkvs project.
//!
//! Provides the [`Version`] used for last-write-wins conflict resolution,
//! the [`NodeInfo`] identity carried on the hash ring, and the 64-bit
//! key hash every component agrees on.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod hash;

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Logical timestamp used for last-write-wins conflict resolution.
///
/// Ordering is lexicographic on `(timestamp_ms, node_id)`: the wall-clock
/// timestamp decides, and the writing node's id breaks exact ties. Two
/// identical versions compare as *not newer* — replays are idempotent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Id of the node that minted this version. Tiebreaker: higher wins.
    pub node_id: u32,
}

impl Version {
    pub fn new(timestamp_ms: u64, node_id: u32) -> Self {
        Self {
            timestamp_ms,
            node_id,
        }
    }

    /// `true` if `self` is strictly newer than `other` under LWW rules.
    pub fn is_newer_than(&self, other: &Version) -> bool {
        if self.timestamp_ms != other.timestamp_ms {
            return self.timestamp_ms > other.timestamp_ms;
        }
        self.node_id > other.node_id
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.timestamp_ms, self.node_id)
    }
}

// ---------------------------------------------------------------------------
// NodeInfo
// ---------------------------------------------------------------------------

/// A physical node as known to the hash ring: a stable numeric id plus the
/// `host:port` address its peers dial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: u32,
    pub address: String,
}

impl NodeInfo {
    pub fn new(node_id: u32, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
        }
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}({})", self.node_id, self.address)
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
