//! Quorum coordinator: every node's entry point for parsed commands.
//!
//! A command arrives from any client at any node; the coordinator looks
//! up the key's replica set on the hash ring, scatters the operation and
//! answers once the quorum outcome is known:
//!
//! 1. `PING` short-circuits; `RSET`/`RDEL`/`RGET` execute locally (this
//!    node was explicitly addressed as a replica).
//! 2. Client `SET`/`DEL` fan out to N replicas under one coordinator-
//!    minted version and need W acks.
//! 3. Client `GET` queries R replicas, returns the highest version and
//!    asynchronously repairs stale replicas.
//! 4. `FWD` frames are accepted for the legacy single-owner routing path
//!    but never emitted by the quorum paths.
//!
//! Failed write legs become hints; [`Coordinator::replay_hints_for`]
//! pushes them out when the heartbeat sees the target again.

use crate::hint_store::{Hint, HintStore};
use crate::transport::{ReplicaTransport, TransportError};
use dkvs_common::{now_ms, NodeInfo, Version};
use dkvs_proto::{self as proto, Command, Parse, VersionedReply};
use dkvs_ring::HashRing;
use dkvs_storage::{snapshot, Store, Wal, WalOp};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Hop budget stamped on outgoing legacy `FWD` frames.
const FWD_DEFAULT_HOPS: u32 = 2;

/// Replication and durability knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Replicas per key (N).
    pub replication_factor: usize,
    /// Acks required for a write (W).
    pub write_quorum: usize,
    /// Replicas queried on a read (R).
    pub read_quorum: usize,
    /// Local write attempts between snapshots (0 disables snapshotting).
    pub snapshot_interval: u64,
    /// Where snapshots go; `None` disables snapshotting.
    pub snapshot_dir: Option<PathBuf>,
}

/// Shared-by-reference coordinator; all interior state is synchronized,
/// so worker tasks call it concurrently through an `Arc`.
pub struct Coordinator<T: ReplicaTransport> {
    node_id: u32,
    store: Arc<Store>,
    ring: Arc<HashRing>,
    transport: Arc<T>,
    wal: Option<Arc<Wal>>,
    hints: Arc<HintStore>,
    config: CoordinatorConfig,
    ops_since_snapshot: AtomicU64,
}

impl<T: ReplicaTransport> std::fmt::Debug for Coordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: ReplicaTransport> Coordinator<T> {
    pub fn new(
        node_id: u32,
        store: Arc<Store>,
        ring: Arc<HashRing>,
        transport: Arc<T>,
        hints: Arc<HintStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            node_id,
            store,
            ring,
            transport,
            wal: None,
            hints,
            config,
            ops_since_snapshot: AtomicU64::new(0),
        }
    }

    /// Attach a WAL; local writes then append before applying.
    pub fn with_wal(mut self, wal: Arc<Wal>) -> Self {
        self.wal = Some(wal);
        self
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub(crate) fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    pub(crate) fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub(crate) fn hints(&self) -> &Arc<HintStore> {
        &self.hints
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Handle one parsed command and produce the complete response line.
    /// Never fails: every outcome, including internal errors, is a wire
    /// response.
    pub async fn handle_command(&self, cmd: Command) -> Vec<u8> {
        match cmd {
            Command::Ping => proto::format_pong(),

            Command::Fwd {
                hops_remaining,
                inner_line,
            } => {
                if hops_remaining == 0 {
                    return proto::format_error("ROUTING_LOOP");
                }
                let mut framed = inner_line;
                framed.push(b'\n');
                match proto::parse_frame(&framed) {
                    Parse::Frame { command, .. } => self.execute_local(command),
                    _ => proto::format_error("MALFORMED_FWD"),
                }
            }

            Command::RSet { .. } | Command::RDel { .. } | Command::RGet { .. } => {
                self.execute_local(cmd)
            }

            Command::Set { key, value } => self.quorum_write(key, value, false).await,
            Command::Del { key } => self.quorum_write(key, Vec::new(), true).await,
            Command::Get { key } => self.quorum_read(key).await,
        }
    }

    // -----------------------------------------------------------------------
    // Local execution
    // -----------------------------------------------------------------------

    /// Execute a command against the local replica only. Used for R*
    /// commands and for the inner command of a `FWD` frame.
    fn execute_local(&self, cmd: Command) -> Vec<u8> {
        match cmd {
            Command::Ping => proto::format_pong(),

            Command::Get { key } => match self.store.get(&key) {
                Some((value, _)) => proto::format_value(&value),
                None => proto::format_not_found(),
            },

            // Client SET/DEL reach this path only via FWD: mint a fresh
            // version with this node's id.
            Command::Set { key, value } => {
                let version = Version::new(now_ms(), self.node_id);
                self.apply_replica_write(&key, &value, false, version);
                proto::format_ok()
            }
            Command::Del { key } => {
                let version = Version::new(now_ms(), self.node_id);
                self.apply_replica_write(&key, &[], true, version);
                proto::format_ok()
            }

            // Replication commands carry the coordinator's version so all
            // replicas store identical metadata.
            Command::RSet { key, value, version } => {
                self.apply_replica_write(&key, &value, false, version);
                proto::format_ok()
            }
            Command::RDel { key, version } => {
                self.apply_replica_write(&key, &[], true, version);
                proto::format_ok()
            }

            Command::RGet { key } => match self.store.get(&key) {
                Some((value, version)) => proto::format_versioned_value(&value, version),
                None => proto::format_not_found(),
            },

            Command::Fwd { .. } => proto::format_error("INTERNAL"),
        }
    }

    /// WAL append + LWW apply + snapshot bookkeeping for one local write.
    ///
    /// The LWW guard may reject the write as stale; that is still an
    /// acknowledged attempt — the replica has considered the write, and
    /// a stale write would not have advanced the key anywhere.
    fn apply_replica_write(&self, key: &[u8], value: &[u8], is_del: bool, version: Version) {
        if let Some(wal) = &self.wal {
            let op = if is_del { WalOp::Del } else { WalOp::Set };
            if let Err(e) = wal.append(op, key, value, version.timestamp_ms) {
                tracing::warn!("WAL append failed: {}", e);
            }
        }

        if is_del {
            self.store.del(key, version);
        } else {
            self.store.set(key, value.to_vec(), version);
        }

        self.maybe_snapshot();
    }

    // -----------------------------------------------------------------------
    // Quorum write
    // -----------------------------------------------------------------------

    async fn quorum_write(&self, key: Vec<u8>, value: Vec<u8>, is_del: bool) -> Vec<u8> {
        let replicas = self
            .ring
            .get_replica_nodes(&key, self.config.replication_factor);
        if replicas.is_empty() {
            return proto::format_error("EMPTY_RING");
        }

        // One version shared by every leg: LWW then guarantees identical
        // metadata across the replica set for the surviving write.
        let version = Version::new(now_ms(), self.node_id);

        let acks = Arc::new(AtomicUsize::new(0));
        let mut legs = Vec::new();

        for replica in replicas {
            if replica.node_id == self.node_id {
                self.apply_replica_write(&key, &value, is_del, version);
                acks.fetch_add(1, Ordering::Relaxed);
                dkvs_metrics::metrics()
                    .replica_legs
                    .with_label_values(&["write_local", "ok"])
                    .inc();
                continue;
            }

            let transport = self.transport.clone();
            let hints = self.hints.clone();
            let acks = acks.clone();
            let key = key.clone();
            let value = value.clone();

            legs.push(tokio::spawn(async move {
                match transport
                    .replica_write(&replica.address, &key, &value, is_del, version)
                    .await
                {
                    Ok(()) => {
                        acks.fetch_add(1, Ordering::Relaxed);
                        dkvs_metrics::metrics()
                            .replica_legs
                            .with_label_values(&["write_remote", "ok"])
                            .inc();
                    }
                    Err(e) => {
                        tracing::debug!("write leg to {} failed: {}", replica, e);
                        dkvs_metrics::metrics()
                            .replica_legs
                            .with_label_values(&["write_remote", "err"])
                            .inc();
                        hints.store(Hint {
                            target_node_id: replica.node_id,
                            target_address: replica.address.clone(),
                            key,
                            value,
                            is_del,
                            version,
                        });
                        dkvs_metrics::metrics().hints_stored.inc();
                    }
                }
            }));
        }

        // All legs run to completion before the quorum verdict: a failed
        // leg must have recorded its hint by the time we answer.
        futures::future::join_all(legs).await;

        if acks.load(Ordering::Relaxed) >= self.config.write_quorum {
            dkvs_metrics::metrics().quorum_writes_ok.inc();
            proto::format_ok()
        } else {
            dkvs_metrics::metrics().quorum_writes_failed.inc();
            proto::format_error("QUORUM_FAILED")
        }
    }

    // -----------------------------------------------------------------------
    // Quorum read
    // -----------------------------------------------------------------------

    async fn quorum_read(&self, key: Vec<u8>) -> Vec<u8> {
        let replicas = self.ring.get_replica_nodes(&key, self.config.read_quorum);
        if replicas.is_empty() {
            return proto::format_error("EMPTY_RING");
        }

        struct Leg {
            replica: NodeInfo,
            reply: Option<VersionedReply>,
        }

        let mut legs: Vec<Leg> = Vec::new();
        let mut pending = Vec::new();

        for replica in replicas {
            if replica.node_id == self.node_id {
                let reply = match self.store.get(&key) {
                    Some((value, version)) => VersionedReply {
                        found: true,
                        value,
                        version,
                    },
                    None => VersionedReply::default(),
                };
                legs.push(Leg {
                    replica,
                    reply: Some(reply),
                });
                continue;
            }

            let transport = self.transport.clone();
            let key = key.clone();
            pending.push(tokio::spawn(async move {
                let result = transport.replica_read(&replica.address, &key).await;
                (replica, result)
            }));
        }

        for joined in futures::future::join_all(pending).await {
            let Ok((replica, result)) = joined else { continue };
            let reply = match result {
                Ok(reply) => {
                    dkvs_metrics::metrics()
                        .replica_legs
                        .with_label_values(&["read_remote", "ok"])
                        .inc();
                    Some(reply)
                }
                Err(e) => {
                    tracing::debug!("read leg to {} failed: {}", replica, e);
                    dkvs_metrics::metrics()
                        .replica_legs
                        .with_label_values(&["read_remote", "err"])
                        .inc();
                    None
                }
            };
            legs.push(Leg { replica, reply });
        }

        if legs.iter().all(|l| l.reply.is_none()) {
            dkvs_metrics::metrics().quorum_reads_failed.inc();
            return proto::format_error("QUORUM_FAILED");
        }
        dkvs_metrics::metrics().quorum_reads_ok.inc();

        // Highest version among replicas that found a value wins.
        let mut best: Option<&VersionedReply> = None;
        for leg in &legs {
            let Some(reply) = &leg.reply else { continue };
            if !reply.found {
                continue;
            }
            if best.map_or(true, |b| reply.version.is_newer_than(&b.version)) {
                best = Some(reply);
            }
        }

        let Some(best) = best else {
            return proto::format_not_found();
        };
        let winner_value = best.value.clone();
        let winner_version = best.version;

        // Replicas that answered with nothing or something older get the
        // winner pushed back, off the request path.
        let stale: Vec<NodeInfo> = legs
            .iter()
            .filter(|l| {
                l.reply
                    .as_ref()
                    .is_some_and(|r| !r.found || winner_version.is_newer_than(&r.version))
            })
            .map(|l| l.replica.clone())
            .collect();

        if !stale.is_empty() {
            self.spawn_read_repair(key, winner_value.clone(), winner_version, stale);
        }

        proto::format_value(&winner_value)
    }

    /// Fire-and-forget repair of stale replicas. The client response does
    /// not wait for it.
    fn spawn_read_repair(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        version: Version,
        stale: Vec<NodeInfo>,
    ) {
        let transport = self.transport.clone();
        let store = self.store.clone();
        let local_node_id = self.node_id;

        tokio::spawn(async move {
            for replica in stale {
                dkvs_metrics::metrics().read_repairs.inc();
                if replica.node_id == local_node_id {
                    store.set(&key, value.clone(), version);
                    continue;
                }
                if let Err(e) = transport
                    .replica_write(&replica.address, &key, &value, false, version)
                    .await
                {
                    tracing::debug!("read repair to {} failed: {}", replica, e);
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Legacy single-owner routing
    // -----------------------------------------------------------------------

    /// Relay a client command to `address` inside a `FWD` frame and return
    /// the peer's raw response. The quorum paths never call this; it backs
    /// single-owner routing setups and is kept for wire compatibility.
    pub async fn forward_to(&self, address: &str, cmd: &Command) -> Vec<u8> {
        let Some(line) = proto::encode_command_line(cmd) else {
            return proto::format_error("INTERNAL");
        };
        match self.transport.forward(address, FWD_DEFAULT_HOPS, &line).await {
            Ok(response) => response,
            Err(TransportError::Timeout) => proto::format_error("NODE_TIMEOUT"),
            Err(_) => proto::format_error("NODE_UNAVAILABLE"),
        }
    }

    // -----------------------------------------------------------------------
    // Hint replay
    // -----------------------------------------------------------------------

    /// Replay every pending hint for `target_node_id`, sending to
    /// `target_address` (or each hint's recorded address when empty).
    /// Hints are cleared only if the whole batch succeeds; replicas are
    /// idempotent under re-sent hints, so retrying the full batch later
    /// is safe. Returns whether the batch was cleared.
    pub async fn replay_hints_for(&self, target_node_id: u32, target_address: &str) -> bool {
        let pending = self.hints.hints_for(target_node_id);
        if pending.is_empty() {
            return true;
        }

        tracing::info!(
            target_node_id,
            count = pending.len(),
            "replaying hints to {}",
            target_address
        );

        let mut all_ok = true;
        for hint in pending {
            let address = if target_address.is_empty() {
                hint.target_address.as_str()
            } else {
                target_address
            };
            match self
                .transport
                .replica_write(address, &hint.key, &hint.value, hint.is_del, hint.version)
                .await
            {
                Ok(()) => dkvs_metrics::metrics().hints_replayed.inc(),
                Err(e) => {
                    tracing::warn!("hint replay to {} failed: {}", address, e);
                    all_ok = false;
                }
            }
        }

        if all_ok {
            self.hints.clear_for(target_node_id);
            tracing::info!(target_node_id, "all hints replayed and cleared");
        }
        all_ok
    }

    // -----------------------------------------------------------------------
    // Snapshot trigger
    // -----------------------------------------------------------------------

    fn maybe_snapshot(&self) {
        let (Some(wal), Some(dir)) = (&self.wal, &self.config.snapshot_dir) else {
            return;
        };
        if self.config.snapshot_interval == 0 {
            return;
        }

        let ops = self.ops_since_snapshot.fetch_add(1, Ordering::AcqRel) + 1;
        if ops < self.config.snapshot_interval {
            return;
        }
        self.ops_since_snapshot.store(0, Ordering::Release);

        // Sync first so the snapshot's seq covers only durable records.
        if let Err(e) = wal.sync() {
            tracing::warn!("WAL sync before snapshot failed: {}", e);
            return;
        }
        let seq = wal.current_seq_no();

        match snapshot::save(&self.store, seq, dir) {
            Ok(path) => {
                dkvs_metrics::metrics().snapshots_saved.inc();
                tracing::info!(seq, "snapshot saved to {}", path.display());
            }
            Err(e) => tracing::warn!("snapshot at seq {} failed: {}", seq, e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;
    use tempfile::TempDir;

    // -----------------------------------------------------------------------
    // Mock transport
    // -----------------------------------------------------------------------

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct WriteCall {
        address: String,
        key: Vec<u8>,
        value: Vec<u8>,
        is_del: bool,
        version: Version,
    }

    #[derive(Default)]
    struct MockTransport {
        fail_addresses: HashSet<String>,
        writes: Mutex<Vec<WriteCall>>,
        read_replies: Mutex<HashMap<String, VersionedReply>>,
    }

    impl MockTransport {
        fn failing(addresses: &[&str]) -> Self {
            Self {
                fail_addresses: addresses.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        fn set_read_reply(&self, address: &str, reply: VersionedReply) {
            self.read_replies.lock().insert(address.to_string(), reply);
        }

        fn writes(&self) -> Vec<WriteCall> {
            self.writes.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl ReplicaTransport for MockTransport {
        async fn replica_write(
            &self,
            address: &str,
            key: &[u8],
            value: &[u8],
            is_del: bool,
            version: Version,
        ) -> Result<(), TransportError> {
            if self.fail_addresses.contains(address) {
                return Err(TransportError::Unavailable("simulated failure".into()));
            }
            self.writes.lock().push(WriteCall {
                address: address.to_string(),
                key: key.to_vec(),
                value: value.to_vec(),
                is_del,
                version,
            });
            Ok(())
        }

        async fn replica_read(
            &self,
            address: &str,
            _key: &[u8],
        ) -> Result<VersionedReply, TransportError> {
            if self.fail_addresses.contains(address) {
                return Err(TransportError::Unavailable("simulated failure".into()));
            }
            Ok(self
                .read_replies
                .lock()
                .get(address)
                .cloned()
                .unwrap_or_default())
        }

        async fn ping(&self, address: &str) -> Result<(), TransportError> {
            if self.fail_addresses.contains(address) {
                return Err(TransportError::Unavailable("simulated failure".into()));
            }
            Ok(())
        }

        async fn forward(
            &self,
            _address: &str,
            _hops: u32,
            _inner_line: &[u8],
        ) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::Unavailable("not wired in mock".into()))
        }
    }

    // -----------------------------------------------------------------------
    // Builders
    // -----------------------------------------------------------------------

    fn config(n: usize, w: usize, r: usize) -> CoordinatorConfig {
        CoordinatorConfig {
            replication_factor: n,
            write_quorum: w,
            read_quorum: r,
            snapshot_interval: 0,
            snapshot_dir: None,
        }
    }

    fn single_node_coordinator() -> Coordinator<MockTransport> {
        let mut ring = HashRing::new();
        ring.add_node(1, "127.0.0.1:7001", 16);
        Coordinator::new(
            1,
            Arc::new(Store::new()),
            Arc::new(ring),
            Arc::new(MockTransport::default()),
            Arc::new(HintStore::new(None)),
            config(1, 1, 1),
        )
    }

    fn set_cmd(key: &[u8], value: &[u8]) -> Command {
        Command::Set {
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    // -----------------------------------------------------------------------
    // Local / single-node paths
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_ping() {
        let coord = single_node_coordinator();
        assert_eq!(coord.handle_command(Command::Ping).await, b"+PONG\n");
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let coord = single_node_coordinator();

        let resp = coord.handle_command(set_cmd(b"mykey", b"myvalue")).await;
        assert_eq!(resp, b"+OK\n");

        let resp = coord
            .handle_command(Command::Get { key: b"mykey".to_vec() })
            .await;
        assert_eq!(resp, b"$7 myvalue\n");
    }

    #[tokio::test]
    async fn test_del_then_get_not_found() {
        let coord = single_node_coordinator();
        coord.handle_command(set_cmd(b"mykey", b"myvalue")).await;

        // Let the wall clock advance so the delete's version is newer.
        tokio::time::sleep(Duration::from_millis(3)).await;

        let resp = coord
            .handle_command(Command::Del { key: b"mykey".to_vec() })
            .await;
        assert_eq!(resp, b"+OK\n");

        let resp = coord
            .handle_command(Command::Get { key: b"mykey".to_vec() })
            .await;
        assert_eq!(resp, b"-NOT_FOUND\n");
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let coord = single_node_coordinator();
        let resp = coord
            .handle_command(Command::Get { key: b"ghost".to_vec() })
            .await;
        assert_eq!(resp, b"-NOT_FOUND\n");
    }

    #[tokio::test]
    async fn test_empty_ring() {
        let coord = Coordinator::new(
            1,
            Arc::new(Store::new()),
            Arc::new(HashRing::new()),
            Arc::new(MockTransport::default()),
            Arc::new(HintStore::new(None)),
            config(3, 2, 2),
        );
        assert_eq!(
            coord.handle_command(set_cmd(b"k", b"v")).await,
            b"-ERR EMPTY_RING\n"
        );
        assert_eq!(
            coord.handle_command(Command::Get { key: b"k".to_vec() }).await,
            b"-ERR EMPTY_RING\n"
        );
    }

    // -----------------------------------------------------------------------
    // Replication commands
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_rset_then_rget_versioned() {
        let coord = single_node_coordinator();

        let resp = coord
            .handle_command(Command::RSet {
                key: b"rk".to_vec(),
                value: b"repval".to_vec(),
                version: Version::new(1_000_000, 99),
            })
            .await;
        assert_eq!(resp, b"+OK\n");

        let resp = coord
            .handle_command(Command::RGet { key: b"rk".to_vec() })
            .await;
        assert_eq!(resp, b"$V 6 repval 1000000 99\n");
    }

    #[tokio::test]
    async fn test_stale_rset_still_acks() {
        let coord = single_node_coordinator();
        coord
            .handle_command(Command::RSet {
                key: b"k".to_vec(),
                value: b"new".to_vec(),
                version: Version::new(200, 1),
            })
            .await;

        // Older write: LWW rejects it internally, but the replica still
        // acknowledges the attempt.
        let resp = coord
            .handle_command(Command::RSet {
                key: b"k".to_vec(),
                value: b"old".to_vec(),
                version: Version::new(100, 1),
            })
            .await;
        assert_eq!(resp, b"+OK\n");

        let resp = coord
            .handle_command(Command::RGet { key: b"k".to_vec() })
            .await;
        assert_eq!(resp, b"$V 3 new 200 1\n");
    }

    #[tokio::test]
    async fn test_rdel_tombstone_blocks_older_set() {
        let coord = single_node_coordinator();
        coord
            .handle_command(Command::RDel {
                key: b"k".to_vec(),
                version: Version::new(300, 1),
            })
            .await;
        coord
            .handle_command(Command::RSet {
                key: b"k".to_vec(),
                value: b"zombie".to_vec(),
                version: Version::new(200, 1),
            })
            .await;

        let resp = coord
            .handle_command(Command::RGet { key: b"k".to_vec() })
            .await;
        assert_eq!(resp, b"-NOT_FOUND\n");
    }

    // -----------------------------------------------------------------------
    // FWD
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_fwd_ttl_exhausted() {
        let coord = single_node_coordinator();
        let resp = coord
            .handle_command(Command::Fwd {
                hops_remaining: 0,
                inner_line: b"PING".to_vec(),
            })
            .await;
        assert_eq!(resp, b"-ERR ROUTING_LOOP\n");
    }

    #[tokio::test]
    async fn test_fwd_malformed_inner() {
        let coord = single_node_coordinator();
        let resp = coord
            .handle_command(Command::Fwd {
                hops_remaining: 2,
                inner_line: b"NOT A COMMAND".to_vec(),
            })
            .await;
        assert_eq!(resp, b"-ERR MALFORMED_FWD\n");
    }

    #[tokio::test]
    async fn test_fwd_executes_inner_locally() {
        let coord = single_node_coordinator();
        let resp = coord
            .handle_command(Command::Fwd {
                hops_remaining: 1,
                inner_line: b"SET 2 fk 3 fwd".to_vec(),
            })
            .await;
        assert_eq!(resp, b"+OK\n");

        let resp = coord
            .handle_command(Command::Get { key: b"fk".to_vec() })
            .await;
        assert_eq!(resp, b"$3 fwd\n");
    }

    // -----------------------------------------------------------------------
    // Quorum writes with failures
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_unreachable_sole_owner_fails_quorum_and_hints() {
        // The only replica for every key is a remote, unreachable peer.
        let mut ring = HashRing::new();
        ring.add_node(2, "10.9.9.9:7001", 16);

        let hints = Arc::new(HintStore::new(None));
        let coord = Coordinator::new(
            1,
            Arc::new(Store::new()),
            Arc::new(ring),
            Arc::new(MockTransport::failing(&["10.9.9.9:7001"])),
            hints.clone(),
            config(1, 1, 1),
        );

        let resp = coord.handle_command(set_cmd(b"mykey", b"myvalue")).await;
        assert_eq!(resp, b"-ERR QUORUM_FAILED\n");

        let pending = hints.hints_for(2);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, b"mykey");
        assert_eq!(pending[0].value, b"myvalue");
        assert_eq!(pending[0].target_address, "10.9.9.9:7001");
        assert!(!pending[0].is_del);
        assert_eq!(pending[0].version.node_id, 1, "version is coordinator-minted");
    }

    #[tokio::test]
    async fn test_write_succeeds_with_failed_leg_below_quorum() {
        // Two replicas: local + failing remote. W=1, so the local ack
        // carries the write; the remote failure leaves a hint.
        let mut ring = HashRing::new();
        ring.add_node(1, "127.0.0.1:7001", 16);
        ring.add_node(2, "10.9.9.9:7001", 16);

        let hints = Arc::new(HintStore::new(None));
        let store = Arc::new(Store::new());
        let coord = Coordinator::new(
            1,
            store.clone(),
            Arc::new(ring),
            Arc::new(MockTransport::failing(&["10.9.9.9:7001"])),
            hints.clone(),
            config(2, 1, 1),
        );

        let resp = coord.handle_command(set_cmd(b"k", b"v")).await;
        assert_eq!(resp, b"+OK\n");
        assert!(store.get(b"k").is_some());
        assert_eq!(hints.hints_for(2).len(), 1);
    }

    #[tokio::test]
    async fn test_write_fans_out_to_remote_replicas() {
        let mut ring = HashRing::new();
        ring.add_node(1, "127.0.0.1:7001", 16);
        ring.add_node(2, "10.0.0.2:7001", 16);
        ring.add_node(3, "10.0.0.3:7001", 16);

        let transport = Arc::new(MockTransport::default());
        let store = Arc::new(Store::new());
        let coord = Coordinator::new(
            1,
            store.clone(),
            Arc::new(ring),
            transport.clone(),
            Arc::new(HintStore::new(None)),
            config(3, 2, 2),
        );

        let resp = coord.handle_command(set_cmd(b"k", b"v")).await;
        assert_eq!(resp, b"+OK\n");

        // Local replica applied directly; both remotes saw RSETs with the
        // same minted version.
        let writes = transport.writes();
        assert_eq!(writes.len(), 2);
        let addrs: HashSet<&str> = writes.iter().map(|w| w.address.as_str()).collect();
        assert_eq!(addrs, HashSet::from(["10.0.0.2:7001", "10.0.0.3:7001"]));
        assert_eq!(writes[0].version, writes[1].version);
        assert_eq!(writes[0].version, store.get(b"k").unwrap().1);
    }

    #[tokio::test]
    async fn test_del_fans_out_as_rdel() {
        let mut ring = HashRing::new();
        ring.add_node(1, "127.0.0.1:7001", 16);
        ring.add_node(2, "10.0.0.2:7001", 16);

        let transport = Arc::new(MockTransport::default());
        let coord = Coordinator::new(
            1,
            Arc::new(Store::new()),
            Arc::new(ring),
            transport.clone(),
            Arc::new(HintStore::new(None)),
            config(2, 1, 1),
        );

        coord
            .handle_command(Command::Del { key: b"k".to_vec() })
            .await;
        let writes = transport.writes();
        assert_eq!(writes.len(), 1);
        assert!(writes[0].is_del);
        assert!(writes[0].value.is_empty());
    }

    // -----------------------------------------------------------------------
    // Quorum reads
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_read_picks_highest_version() {
        let mut ring = HashRing::new();
        ring.add_node(1, "127.0.0.1:7001", 16);
        ring.add_node(2, "10.0.0.2:7001", 16);
        ring.add_node(3, "10.0.0.3:7001", 16);

        let transport = Arc::new(MockTransport::default());
        let store = Arc::new(Store::new());
        store.set(b"k", b"stale".to_vec(), Version::new(100, 1));
        transport.set_read_reply(
            "10.0.0.2:7001",
            VersionedReply {
                found: true,
                value: b"fresh".to_vec(),
                version: Version::new(200, 2),
            },
        );
        // Node 3 has nothing (default reply: not found).

        let coord = Coordinator::new(
            1,
            store.clone(),
            Arc::new(ring),
            transport.clone(),
            Arc::new(HintStore::new(None)),
            config(3, 2, 3),
        );

        let resp = coord
            .handle_command(Command::Get { key: b"k".to_vec() })
            .await;
        assert_eq!(resp, b"$5 fresh\n");
    }

    #[tokio::test]
    async fn test_read_repair_pushes_winner_to_stale_replicas() {
        let mut ring = HashRing::new();
        ring.add_node(1, "127.0.0.1:7001", 16);
        ring.add_node(2, "10.0.0.2:7001", 16);
        ring.add_node(3, "10.0.0.3:7001", 16);

        let transport = Arc::new(MockTransport::default());
        let store = Arc::new(Store::new());
        store.set(b"k", b"stale".to_vec(), Version::new(100, 1));
        transport.set_read_reply(
            "10.0.0.2:7001",
            VersionedReply {
                found: true,
                value: b"fresh".to_vec(),
                version: Version::new(200, 2),
            },
        );

        let coord = Coordinator::new(
            1,
            store.clone(),
            Arc::new(ring),
            transport.clone(),
            Arc::new(HintStore::new(None)),
            config(3, 2, 3),
        );

        coord
            .handle_command(Command::Get { key: b"k".to_vec() })
            .await;

        // Give the fire-and-forget repair a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Local replica repaired in place.
        let (value, version) = store.get(b"k").unwrap();
        assert_eq!(value, b"fresh");
        assert_eq!(version, Version::new(200, 2));

        // Node 3 (not-found) got the winner pushed; node 2 held it already.
        let writes = transport.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].address, "10.0.0.3:7001");
        assert_eq!(writes[0].value, b"fresh");
        assert_eq!(writes[0].version, Version::new(200, 2));
        assert!(!writes[0].is_del);
    }

    #[tokio::test]
    async fn test_read_all_replicas_unreachable() {
        let mut ring = HashRing::new();
        ring.add_node(2, "10.9.9.9:7001", 16);

        let coord = Coordinator::new(
            1,
            Arc::new(Store::new()),
            Arc::new(ring),
            Arc::new(MockTransport::failing(&["10.9.9.9:7001"])),
            Arc::new(HintStore::new(None)),
            config(1, 1, 1),
        );

        let resp = coord
            .handle_command(Command::Get { key: b"k".to_vec() })
            .await;
        assert_eq!(resp, b"-ERR QUORUM_FAILED\n");
    }

    #[tokio::test]
    async fn test_read_not_found_when_no_replica_has_value() {
        let mut ring = HashRing::new();
        ring.add_node(1, "127.0.0.1:7001", 16);
        ring.add_node(2, "10.0.0.2:7001", 16);

        let coord = Coordinator::new(
            1,
            Arc::new(Store::new()),
            Arc::new(ring),
            Arc::new(MockTransport::default()),
            Arc::new(HintStore::new(None)),
            config(2, 1, 2),
        );

        let resp = coord
            .handle_command(Command::Get { key: b"nothing".to_vec() })
            .await;
        assert_eq!(resp, b"-NOT_FOUND\n");
    }

    // -----------------------------------------------------------------------
    // Hint replay
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_replay_hints_clears_on_success() {
        let hints = Arc::new(HintStore::new(None));
        hints.store(Hint {
            target_node_id: 2,
            target_address: "10.0.0.2:7001".into(),
            key: b"k1".to_vec(),
            value: b"v1".to_vec(),
            is_del: false,
            version: Version::new(100, 1),
        });
        hints.store(Hint {
            target_node_id: 2,
            target_address: "10.0.0.2:7001".into(),
            key: b"k2".to_vec(),
            value: Vec::new(),
            is_del: true,
            version: Version::new(200, 1),
        });

        let transport = Arc::new(MockTransport::default());
        let coord = Coordinator::new(
            1,
            Arc::new(Store::new()),
            Arc::new(HashRing::new()),
            transport.clone(),
            hints.clone(),
            config(1, 1, 1),
        );

        assert!(coord.replay_hints_for(2, "10.0.0.2:7001").await);
        assert_eq!(hints.size(), 0);

        let writes = transport.writes();
        assert_eq!(writes.len(), 2);
        assert!(!writes[0].is_del);
        assert!(writes[1].is_del);
    }

    #[tokio::test]
    async fn test_replay_failure_retains_hints() {
        let hints = Arc::new(HintStore::new(None));
        hints.store(Hint {
            target_node_id: 2,
            target_address: "10.9.9.9:7001".into(),
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            is_del: false,
            version: Version::new(100, 1),
        });

        let coord = Coordinator::new(
            1,
            Arc::new(Store::new()),
            Arc::new(HashRing::new()),
            Arc::new(MockTransport::failing(&["10.9.9.9:7001"])),
            hints.clone(),
            config(1, 1, 1),
        );

        assert!(!coord.replay_hints_for(2, "10.9.9.9:7001").await);
        assert_eq!(hints.size(), 1, "failed replay must retain hints");
    }

    #[tokio::test]
    async fn test_replay_uses_recorded_address_when_none_given() {
        let hints = Arc::new(HintStore::new(None));
        hints.store(Hint {
            target_node_id: 2,
            target_address: "10.0.0.2:7001".into(),
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            is_del: false,
            version: Version::new(100, 1),
        });

        let transport = Arc::new(MockTransport::default());
        let coord = Coordinator::new(
            1,
            Arc::new(Store::new()),
            Arc::new(HashRing::new()),
            transport.clone(),
            hints,
            config(1, 1, 1),
        );

        assert!(coord.replay_hints_for(2, "").await);
        assert_eq!(transport.writes()[0].address, "10.0.0.2:7001");
    }

    // -----------------------------------------------------------------------
    // WAL + snapshot integration
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_local_writes_hit_wal() {
        let dir = TempDir::new().unwrap();
        let wal = Arc::new(Wal::open(dir.path(), 0, 0).unwrap());

        let coord = single_node_coordinator().with_wal(wal.clone());
        coord.handle_command(set_cmd(b"k1", b"v1")).await;
        coord.handle_command(set_cmd(b"k2", b"v2")).await;
        coord
            .handle_command(Command::Del { key: b"k1".to_vec() })
            .await;
        wal.sync().unwrap();

        let records = wal.recover().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].op, WalOp::Set);
        assert_eq!(records[2].op, WalOp::Del);
        assert_eq!(records[2].key, b"k1");
    }

    #[tokio::test]
    async fn test_snapshot_triggered_by_write_count() {
        let dir = TempDir::new().unwrap();
        let wal_dir = dir.path().join("wal");
        let snap_dir = dir.path().join("snapshots");
        let wal = Arc::new(Wal::open(&wal_dir, 0, 0).unwrap());

        let mut ring = HashRing::new();
        ring.add_node(1, "127.0.0.1:7001", 16);
        let coord = Coordinator::new(
            1,
            Arc::new(Store::new()),
            Arc::new(ring),
            Arc::new(MockTransport::default()),
            Arc::new(HintStore::new(None)),
            CoordinatorConfig {
                replication_factor: 1,
                write_quorum: 1,
                read_quorum: 1,
                snapshot_interval: 5,
                snapshot_dir: Some(snap_dir.clone()),
            },
        )
        .with_wal(wal);

        for i in 0..4 {
            coord
                .handle_command(set_cmd(format!("k{}", i).as_bytes(), b"v"))
                .await;
        }
        assert!(snapshot::find_latest(&snap_dir).is_none());

        coord.handle_command(set_cmd(b"k4", b"v")).await;
        let latest = snapshot::find_latest(&snap_dir).expect("snapshot after 5th write");

        let data = snapshot::load(&latest).unwrap();
        assert_eq!(data.seq_no, 5);
        assert_eq!(data.entries.len(), 5);
    }
}
