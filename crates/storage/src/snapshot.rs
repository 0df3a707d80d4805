//! Full-store snapshots.
//!
//! File format (`<dir>/snapshot_<seq>.dat`, integers little-endian):
//!
//! ```text
//! [magic "DKVS"] [seq_no u64] [count u32]
//! count * ( [is_tombstone u8] [key_len u32] [key] [val_len u32] [value]
//!           [timestamp_ms u64] [node_id u32] )
//! ```
//!
//! A snapshot at sequence N is consistent with the store after applying
//! WAL records with `seq_no <= N`, so boot-time restore loads the latest
//! snapshot and replays only the WAL tail.
//!
//! Files are written to a temporary name and renamed into place, so a
//! crash mid-write never leaves a file that `find_latest` would pick up.

use crate::store::{Store, ValueEntry};
use dkvs_common::Version;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"DKVS";

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("bad snapshot magic")]
    BadMagic,
    #[error("snapshot truncated at entry {0}")]
    Truncated(usize),
}

/// Decoded snapshot contents.
#[derive(Debug, Clone)]
pub struct SnapshotData {
    pub seq_no: u64,
    pub entries: Vec<(Vec<u8>, ValueEntry)>,
}

/// Serialize every entry of `store` (tombstones included) into
/// `<dir>/snapshot_<seq_no>.dat`. Returns the final path.
pub fn save(store: &Store, seq_no: u64, dir: &Path) -> Result<PathBuf, SnapshotError> {
    std::fs::create_dir_all(dir)?;

    let final_path = dir.join(format!("snapshot_{}.dat", seq_no));
    let tmp_path = dir.join(format!("snapshot_{}.dat.tmp", seq_no));

    let entries = store.all_entries();

    let mut buf = Vec::with_capacity(16 + entries.len() * 64);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&seq_no.to_le_bytes());
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());

    for (key, entry) in &entries {
        buf.push(u8::from(entry.is_tombstone));
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&(entry.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&entry.value);
        buf.extend_from_slice(&entry.version.timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&entry.version.node_id.to_le_bytes());
    }

    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp_path, &final_path)?;
    Ok(final_path)
}

/// Parse a snapshot file. Bad magic and truncation are hard errors; the
/// caller treats them as "no snapshot present".
pub fn load(path: &Path) -> Result<SnapshotData, SnapshotError> {
    let data = std::fs::read(path)?;

    if data.len() < 16 || &data[..4] != MAGIC {
        return Err(SnapshotError::BadMagic);
    }

    let mut reader = Reader {
        data: &data,
        pos: 4,
    };

    let seq_no = reader.u64(0)?;
    let count = reader.u32(0)? as usize;

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let is_tombstone = reader.u8(i)? != 0;
        let key_len = reader.u32(i)? as usize;
        let key = reader.bytes(key_len, i)?;
        let val_len = reader.u32(i)? as usize;
        let value = reader.bytes(val_len, i)?;
        let timestamp_ms = reader.u64(i)?;
        let node_id = reader.u32(i)?;

        entries.push((
            key,
            ValueEntry {
                is_tombstone,
                value,
                version: Version::new(timestamp_ms, node_id),
            },
        ));
    }

    Ok(SnapshotData { seq_no, entries })
}

/// The snapshot file with the largest sequence number in `dir`, if any.
/// Only names of the exact form `snapshot_<digits>.dat` are considered.
pub fn find_latest(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;

    let mut best: Option<(u64, PathBuf)> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(seq) = name
            .strip_prefix("snapshot_")
            .and_then(|rest| rest.strip_suffix(".dat"))
            .and_then(|digits| digits.parse::<u64>().ok())
        else {
            continue;
        };
        if best.as_ref().map_or(true, |(b, _)| seq > *b) {
            best = Some((seq, entry.path()));
        }
    }

    best.map(|(_, path)| path)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, entry: usize) -> Result<&'a [u8], SnapshotError> {
        if self.pos + n > self.data.len() {
            return Err(SnapshotError::Truncated(entry));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, entry: usize) -> Result<u8, SnapshotError> {
        Ok(self.take(1, entry)?[0])
    }

    fn u32(&mut self, entry: usize) -> Result<u32, SnapshotError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4, entry)?);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self, entry: usize) -> Result<u64, SnapshotError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8, entry)?);
        Ok(u64::from_le_bytes(b))
    }

    fn bytes(&mut self, n: usize, entry: usize) -> Result<Vec<u8>, SnapshotError> {
        Ok(self.take(n, entry)?.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
