//! Append-only write-ahead log with CRC-protected records.
//!
//! Record binary format (all integers little-endian):
//!
//! ```text
//! [CRC32 u32] [seq_no u64] [timestamp_ms u64] [op u8]
//! [key_len u32] [key ...] [val_len u32] [value ...]
//! ```
//!
//! The CRC32 (IEEE) covers everything after the checksum field. Recovery
//! reads records sequentially and stops at the first checksum mismatch or
//! truncated record, so a torn tail from a crash is discarded cleanly.
//!
//! Durability is batched two ways: an op-count threshold fsyncs inline
//! once enough appends have accumulated, and a background timer thread
//! fsyncs whenever the log is dirty. After [`Wal::sync`] returns, every
//! record whose sequence number `append` has handed out is durable.

use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const WAL_FILE: &str = "wal.bin";

/// Fixed bytes before the key: seq (8) + timestamp (8) + op (1) + key_len (4).
const FIXED_PAYLOAD: usize = 21;
/// Smallest possible record: CRC + fixed payload + val_len, empty key/value.
const MIN_RECORD: usize = 4 + FIXED_PAYLOAD + 4;

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Operation types recorded in the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Set = 0,
    Del = 1,
}

/// A single WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub seq_no: u64,
    pub timestamp_ms: u64,
    pub op: WalOp,
    pub key: Vec<u8>,
    /// Empty for [`WalOp::Del`].
    pub value: Vec<u8>,
}

struct WalFile {
    file: File,
    next_seq_no: u64,
}

struct Shared {
    file: Mutex<WalFile>,
    dirty: AtomicBool,
    ops_since_sync: AtomicU32,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
}

impl Shared {
    fn sync(&self) -> io::Result<()> {
        let guard = self.file.lock();
        guard.file.sync_all()?;
        drop(guard);
        self.dirty.store(false, Ordering::Release);
        self.ops_since_sync.store(0, Ordering::Release);
        Ok(())
    }
}

/// Append-only durable log at `<dir>/wal.bin`.
pub struct Wal {
    shared: Arc<Shared>,
    path: PathBuf,
    fsync_batch_ops: u32,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Wal {
    /// Open (or create) the WAL at `<dir>/wal.bin`.
    ///
    /// `fsync_interval_ms` > 0 starts a background thread that fsyncs the
    /// file whenever it is dirty; `fsync_batch_ops` > 0 additionally fsyncs
    /// inline once that many appends have accumulated.
    pub fn open(
        dir: &Path,
        fsync_interval_ms: u32,
        fsync_batch_ops: u32,
    ) -> Result<Self, WalError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(WAL_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let shared = Arc::new(Shared {
            file: Mutex::new(WalFile {
                file,
                next_seq_no: 1,
            }),
            dirty: AtomicBool::new(false),
            ops_since_sync: AtomicU32::new(0),
            shutdown: Mutex::new(false),
            shutdown_cv: Condvar::new(),
        });

        let flusher = if fsync_interval_ms > 0 {
            let shared = shared.clone();
            let interval = Duration::from_millis(u64::from(fsync_interval_ms));
            Some(std::thread::spawn(move || flusher_loop(&shared, interval)))
        } else {
            None
        };

        Ok(Self {
            shared,
            path,
            fsync_batch_ops,
            flusher: Mutex::new(flusher),
        })
    }

    /// Append a record, assigning it the next sequence number. Returns the
    /// assigned sequence number. Durability follows the batching policy;
    /// call [`sync`](Wal::sync) to force it.
    pub fn append(
        &self,
        op: WalOp,
        key: &[u8],
        value: &[u8],
        timestamp_ms: u64,
    ) -> Result<u64, WalError> {
        let seq_no = {
            let mut guard = self.shared.file.lock();
            let seq_no = guard.next_seq_no;
            let buf = encode_record(seq_no, timestamp_ms, op, key, value);
            guard.file.write_all(&buf)?;
            guard.next_seq_no += 1;
            seq_no
        };

        self.shared.dirty.store(true, Ordering::Release);
        let ops = self.shared.ops_since_sync.fetch_add(1, Ordering::AcqRel) + 1;
        if self.fsync_batch_ops > 0 && ops >= self.fsync_batch_ops {
            self.shared.sync()?;
        }

        Ok(seq_no)
    }

    /// Read every valid record from the start of the file, stopping at the
    /// first corrupt or truncated record. Seeds the next sequence number
    /// from the highest one observed.
    pub fn recover(&self) -> Result<Vec<WalRecord>, WalError> {
        let data = std::fs::read(&self.path)?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        let mut max_seq = 0u64;

        while offset < data.len() {
            match decode_record(&data[offset..]) {
                Some((record, consumed)) => {
                    max_seq = max_seq.max(record.seq_no);
                    records.push(record);
                    offset += consumed;
                }
                None => {
                    tracing::warn!(
                        offset,
                        "WAL recovery halted (corrupt or truncated record)"
                    );
                    break;
                }
            }
        }

        let mut guard = self.shared.file.lock();
        if max_seq + 1 > guard.next_seq_no {
            guard.next_seq_no = max_seq + 1;
        }

        Ok(records)
    }

    /// Fsync the file. On return, every appended record is durable.
    pub fn sync(&self) -> Result<(), WalError> {
        self.shared.sync()?;
        Ok(())
    }

    /// The last assigned sequence number (0 if nothing was appended).
    pub fn current_seq_no(&self) -> u64 {
        self.shared.file.lock().next_seq_no - 1
    }

    /// Stop the background flusher and perform a final fsync. Safe to call
    /// more than once; also invoked on drop.
    pub fn close(&self) -> Result<(), WalError> {
        {
            let mut shutdown = self.shared.shutdown.lock();
            *shutdown = true;
        }
        self.shared.shutdown_cv.notify_all();

        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }

        self.shared.sync()?;
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("WAL close on drop failed: {}", e);
        }
    }
}

fn flusher_loop(shared: &Shared, interval: Duration) {
    let mut shutdown = shared.shutdown.lock();
    loop {
        if *shutdown {
            return;
        }
        shared.shutdown_cv.wait_for(&mut shutdown, interval);
        if *shutdown {
            return;
        }
        if shared.dirty.load(Ordering::Acquire) {
            // Release the shutdown lock during the fsync so close() is
            // never blocked on disk.
            drop(shutdown);
            if let Err(e) = shared.sync() {
                tracing::warn!("background WAL fsync failed: {}", e);
            }
            shutdown = shared.shutdown.lock();
        }
    }
}

// ---------------------------------------------------------------------------
// Record codec
// ---------------------------------------------------------------------------

fn encode_record(
    seq_no: u64,
    timestamp_ms: u64,
    op: WalOp,
    key: &[u8],
    value: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(FIXED_PAYLOAD + key.len() + 4 + value.len());
    payload.extend_from_slice(&seq_no.to_le_bytes());
    payload.extend_from_slice(&timestamp_ms.to_le_bytes());
    payload.push(op as u8);
    payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
    payload.extend_from_slice(key);
    payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
    payload.extend_from_slice(value);

    let crc = crc32fast::hash(&payload);

    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(b)
}

/// Decode one record from the front of `data`. `None` means the bytes are
/// truncated, length-inconsistent or fail the checksum — recovery stops.
fn decode_record(data: &[u8]) -> Option<(WalRecord, usize)> {
    if data.len() < MIN_RECORD {
        return None;
    }

    let stored_crc = read_u32(data, 0);
    let payload = &data[4..];

    let seq_no = read_u64(payload, 0);
    let timestamp_ms = read_u64(payload, 8);
    let op = match payload[16] {
        0 => WalOp::Set,
        1 => WalOp::Del,
        _ => return None,
    };
    let key_len = read_u32(payload, 17) as usize;

    // val_len sits after the key; make sure it is in range.
    if FIXED_PAYLOAD + key_len + 4 > payload.len() {
        return None;
    }
    let val_len = read_u32(payload, FIXED_PAYLOAD + key_len) as usize;

    let payload_len = FIXED_PAYLOAD + key_len + 4 + val_len;
    if payload_len > payload.len() {
        return None;
    }

    let computed = crc32fast::hash(&payload[..payload_len]);
    if computed != stored_crc {
        return None;
    }

    let key = payload[FIXED_PAYLOAD..FIXED_PAYLOAD + key_len].to_vec();
    let val_start = FIXED_PAYLOAD + key_len + 4;
    let value = payload[val_start..val_start + val_len].to_vec();

    Some((
        WalRecord {
            seq_no,
            timestamp_ms,
            op,
            key,
            value,
        },
        4 + payload_len,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
