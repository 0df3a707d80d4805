//! Durable store for hinted-handoff hints.
//!
//! A hint is a write that could not be delivered to its intended
//! replica. Hints are kept per target node in memory and appended to
//! `<dir>/hints_<target>.dat` so they survive a coordinator restart;
//! the whole file is deleted once a replay batch for that target
//! succeeds. Disk append failures degrade the store to memory-only for
//! that hint — the in-memory path never blocks on I/O.
//!
//! On-disk record (little-endian):
//!
//! ```text
//! [target_node_id u32] [addr_len u32] [addr] [key_len u32] [key]
//! [val_len u32] [value] [timestamp_ms u64] [node_id u32] [is_del u8]
//! ```

use dkvs_common::Version;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A pending write destined for a specific replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    pub target_node_id: u32,
    pub target_address: String,
    pub key: Vec<u8>,
    /// Empty for deletes.
    pub value: Vec<u8>,
    pub is_del: bool,
    pub version: Version,
}

/// In-memory hint map with optional on-disk backing.
#[derive(Debug)]
pub struct HintStore {
    hints: Mutex<HashMap<u32, Vec<Hint>>>,
    dir: Option<PathBuf>,
}

impl HintStore {
    /// A store backed by `dir`, or memory-only when `dir` is `None`.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            hints: Mutex::new(HashMap::new()),
            dir,
        }
    }

    /// Record a hint. The in-memory insert happens under the lock; the
    /// disk append runs after it is released.
    pub fn store(&self, hint: Hint) {
        {
            let mut hints = self.hints.lock();
            hints.entry(hint.target_node_id).or_default().push(hint.clone());
        }
        if self.dir.is_some() {
            self.append_to_disk(&hint);
        }
    }

    /// Snapshot copy of the pending hints for one target.
    pub fn hints_for(&self, target_node_id: u32) -> Vec<Hint> {
        self.hints
            .lock()
            .get(&target_node_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop every hint for `target_node_id`, removing the on-disk file
    /// as a whole.
    pub fn clear_for(&self, target_node_id: u32) {
        self.hints.lock().remove(&target_node_id);
        if let Some(dir) = &self.dir {
            let path = hint_file_path(dir, target_node_id);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove hint file {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Target node ids with at least one pending hint.
    pub fn targets(&self) -> Vec<u32> {
        self.hints
            .lock()
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| *k)
            .collect()
    }

    /// Total pending hints across all targets.
    pub fn size(&self) -> usize {
        self.hints.lock().values().map(Vec::len).sum()
    }

    /// Scan the backing directory and load every persisted hint into the
    /// in-memory map. Torn tail records are tolerated: parsing of a file
    /// stops at the first short or malformed record. Returns the number
    /// of hints loaded.
    pub fn load(&self) -> usize {
        let Some(dir) = &self.dir else { return 0 };
        let Ok(entries) = std::fs::read_dir(dir) else { return 0 };

        let mut loaded = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("hints_") || !name.ends_with(".dat") {
                continue;
            }

            let Ok(data) = std::fs::read(entry.path()) else {
                tracing::warn!("unreadable hint file {:?}", entry.path());
                continue;
            };

            let hints = decode_hints(&data);
            loaded += hints.len();
            let mut map = self.hints.lock();
            for hint in hints {
                map.entry(hint.target_node_id).or_default().push(hint);
            }
        }

        if loaded > 0 {
            tracing::info!(loaded, "recovered persisted hints");
        }
        loaded
    }

    fn append_to_disk(&self, hint: &Hint) {
        let Some(dir) = &self.dir else { return };

        let result = (|| -> std::io::Result<()> {
            std::fs::create_dir_all(dir)?;
            let path = hint_file_path(dir, hint.target_node_id);
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            file.write_all(&encode_hint(hint))?;
            Ok(())
        })();

        if let Err(e) = result {
            tracing::warn!(
                target_node_id = hint.target_node_id,
                "hint disk append failed, keeping in memory only: {}",
                e
            );
        }
    }
}

fn hint_file_path(dir: &Path, target_node_id: u32) -> PathBuf {
    dir.join(format!("hints_{}.dat", target_node_id))
}

// ---------------------------------------------------------------------------
// Record codec
// ---------------------------------------------------------------------------

fn encode_hint(hint: &Hint) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        4 + 4 + hint.target_address.len() + 4 + hint.key.len() + 4 + hint.value.len() + 13,
    );
    buf.extend_from_slice(&hint.target_node_id.to_le_bytes());
    buf.extend_from_slice(&(hint.target_address.len() as u32).to_le_bytes());
    buf.extend_from_slice(hint.target_address.as_bytes());
    buf.extend_from_slice(&(hint.key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&hint.key);
    buf.extend_from_slice(&(hint.value.len() as u32).to_le_bytes());
    buf.extend_from_slice(&hint.value);
    buf.extend_from_slice(&hint.version.timestamp_ms.to_le_bytes());
    buf.extend_from_slice(&hint.version.node_id.to_le_bytes());
    buf.push(u8::from(hint.is_del));
    buf
}

/// Parse records until the data runs out or a record is torn.
fn decode_hints(data: &[u8]) -> Vec<Hint> {
    let mut hints = Vec::new();
    let mut pos = 0usize;

    while pos < data.len() {
        match decode_hint(data, pos) {
            Some((hint, next)) => {
                hints.push(hint);
                pos = next;
            }
            None => {
                tracing::warn!(offset = pos, "stopping hint load at torn record");
                break;
            }
        }
    }
    hints
}

fn decode_hint(data: &[u8], mut pos: usize) -> Option<(Hint, usize)> {
    fn u32_at(data: &[u8], pos: &mut usize) -> Option<u32> {
        let b = data.get(*pos..*pos + 4)?;
        *pos += 4;
        let mut arr = [0u8; 4];
        arr.copy_from_slice(b);
        Some(u32::from_le_bytes(arr))
    }
    fn u64_at(data: &[u8], pos: &mut usize) -> Option<u64> {
        let b = data.get(*pos..*pos + 8)?;
        *pos += 8;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Some(u64::from_le_bytes(arr))
    }
    fn bytes_at(data: &[u8], pos: &mut usize, n: usize) -> Option<Vec<u8>> {
        let b = data.get(*pos..*pos + n)?;
        *pos += n;
        Some(b.to_vec())
    }

    let target_node_id = u32_at(data, &mut pos)?;
    let addr_len = u32_at(data, &mut pos)? as usize;
    let addr = bytes_at(data, &mut pos, addr_len)?;
    let key_len = u32_at(data, &mut pos)? as usize;
    let key = bytes_at(data, &mut pos, key_len)?;
    let val_len = u32_at(data, &mut pos)? as usize;
    let value = bytes_at(data, &mut pos, val_len)?;
    let timestamp_ms = u64_at(data, &mut pos)?;
    let node_id = u32_at(data, &mut pos)?;
    let is_del = *data.get(pos)? != 0;
    pos += 1;

    let target_address = String::from_utf8(addr).ok()?;

    Some((
        Hint {
            target_node_id,
            target_address,
            key,
            value,
            is_del,
            version: Version::new(timestamp_ms, node_id),
        },
        pos,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
