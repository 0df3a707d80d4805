//! Storage layer for dkvs: sharded in-memory store + WAL + snapshots.
//!
//! Writes are versioned and resolved last-write-wins; deletes leave
//! tombstones so stale replicas cannot resurrect removed keys. The WAL
//! provides durability, snapshots bound recovery time.

pub mod restore;
pub mod snapshot;
pub mod store;
pub mod wal;

pub use store::{Store, ValueEntry};
pub use wal::{Wal, WalOp, WalRecord};
