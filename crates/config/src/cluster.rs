//! Cluster membership file parsing.
//!
//! The file is one `<name> <host>:<port>` entry per line; blank lines
//! and `#` comments are skipped. Malformed lines are logged and skipped
//! rather than failing the whole file.
//!
//! Node ids are derived deterministically from names: the decimal digits
//! embedded in the name (`node12` -> 12), or a stable hash of the whole
//! name when it carries no digits.

use dkvs_common::hash::hash64;
use std::path::Path;

/// One line of the cluster file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl PeerEntry {
    /// `host:port` as dialed by peers.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The ring id derived from this entry's name.
    pub fn node_id(&self) -> u32 {
        node_id_for_name(&self.name)
    }
}

/// Derive a node id from a node name: concatenated decimal digits if the
/// name has any, else a murmur hash of the name truncated to 32 bits.
pub fn node_id_for_name(name: &str) -> u32 {
    let mut id: u32 = 0;
    let mut saw_digit = false;
    for c in name.chars() {
        if let Some(d) = c.to_digit(10) {
            saw_digit = true;
            id = id.wrapping_mul(10).wrapping_add(d);
        }
    }
    if saw_digit && id != 0 {
        return id;
    }
    (hash64(name.as_bytes()) & 0xFFFF_FFFF) as u32
}

/// Parse a cluster file from disk.
pub fn parse_cluster_file(path: &Path) -> std::io::Result<Vec<PeerEntry>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_cluster_str(&contents))
}

/// Parse cluster file contents.
pub fn parse_cluster_str(contents: &str) -> Vec<PeerEntry> {
    let mut entries = Vec::new();

    for (line_num, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(name), Some(address)) = (parts.next(), parts.next()) else {
            tracing::warn!(line = line_num + 1, "skipping malformed cluster entry: {}", raw);
            continue;
        };

        let Some((host, port_str)) = address.rsplit_once(':') else {
            tracing::warn!(line = line_num + 1, "skipping address without port: {}", address);
            continue;
        };
        if host.is_empty() {
            tracing::warn!(line = line_num + 1, "skipping address without host: {}", address);
            continue;
        }
        let Ok(port) = port_str.parse::<u16>() else {
            tracing::warn!(line = line_num + 1, "skipping invalid port: {}", port_str);
            continue;
        };
        if port == 0 {
            tracing::warn!(line = line_num + 1, "skipping port 0: {}", address);
            continue;
        }

        entries.push(PeerEntry {
            name: name.to_string(),
            host: host.to_string(),
            port,
        });
    }

    entries
}
