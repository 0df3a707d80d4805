//! dkvs-node: entry point for a dkvs cluster node.
//!
//! Loads config and the cluster membership file, rebuilds state from
//! the latest snapshot plus the WAL tail, wires the coordinator over a
//! TCP replica transport, then serves line frames until Ctrl+C.

use dkvs_cluster::heartbeat::{self, HeartbeatConfig};
use dkvs_cluster::{Coordinator, CoordinatorConfig, HintStore};
use dkvs_net::{ConnectionPool, TcpReplicaTransport};
use dkvs_ring::HashRing;
use dkvs_storage::{restore, Store, Wal};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

fn main() -> std::process::ExitCode {
    dkvs_metrics::init_tracing();

    // First CLI arg is the YAML config path; defaults apply without one.
    let config = match std::env::args().nth(1) {
        Some(path) => match dkvs_config::load_from_file(std::path::Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                // W+R<=N and friends land here: refuse to start.
                tracing::error!("invalid config {}: {}", path, e);
                return std::process::ExitCode::FAILURE;
            }
        },
        None => dkvs_config::NodeConfig::default(),
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads as usize)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("failed to build runtime: {}", e);
            return std::process::ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {}", e);
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(config: dkvs_config::NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        node_id = config.node_id,
        port = config.port,
        n = config.replication_factor,
        w = config.write_quorum,
        r = config.read_quorum,
        "starting dkvs node"
    );

    // Build the ring from the static cluster file.
    let peers = dkvs_config::parse_cluster_file(&config.cluster_conf).unwrap_or_else(|e| {
        tracing::warn!(
            "cannot read cluster file {}: {}, running standalone",
            config.cluster_conf.display(),
            e
        );
        Vec::new()
    });

    let mut ring = HashRing::new();
    for peer in &peers {
        let id = peer.node_id();
        ring.add_node(id, &peer.address(), config.vnodes);
        tracing::info!("ring: {} (id={}) -> {}", peer.name, id, peer.address());
    }
    if ring.is_empty() {
        // A single-node deployment still owns all keys.
        ring.add_node(config.node_id, &format!("127.0.0.1:{}", config.port), config.vnodes);
    } else if ring.address_of(config.node_id).is_none() {
        tracing::warn!(
            node_id = config.node_id,
            "local node id missing from cluster file; this node will not be a replica"
        );
    }
    tracing::info!(
        nodes = ring.node_count(),
        vnodes = ring.len(),
        "hash ring built"
    );

    // Durability: WAL first, then snapshot + tail replay into the store.
    let wal = Arc::new(Wal::open(
        &config.wal_dir,
        config.fsync_interval_ms,
        config.fsync_batch_ops,
    )?);
    let store = Arc::new(Store::new());
    let summary = restore::restore(&store, &wal, &config.snapshot_dir, config.node_id)?;
    tracing::info!(
        snapshot_seq = summary.snapshot_seq,
        snapshot_entries = summary.snapshot_entries,
        wal_replayed = summary.wal_replayed,
        keys = store.len(),
        "state restored"
    );

    // Hints persisted before a previous crash.
    let hints = Arc::new(HintStore::new(Some(config.hints_dir.clone())));
    hints.load();

    let pool = Arc::new(ConnectionPool::new(
        dkvs_net::pool::DEFAULT_MAX_PER_PEER,
        dkvs_net::pool::DEFAULT_TIMEOUT,
    ));
    let transport = Arc::new(TcpReplicaTransport::new(pool.clone()));

    let coordinator = Arc::new(
        Coordinator::new(
            config.node_id,
            store,
            Arc::new(ring),
            transport,
            hints,
            CoordinatorConfig {
                replication_factor: config.replication_factor as usize,
                write_quorum: config.write_quorum as usize,
                read_quorum: config.read_quorum as usize,
                snapshot_interval: config.snapshot_interval,
                snapshot_dir: Some(config.snapshot_dir.clone()),
            },
        )
        .with_wal(wal.clone()),
    );

    // Peer liveness probing drives hint replay.
    let heartbeat = heartbeat::spawn_heartbeat_task(
        coordinator.clone(),
        HeartbeatConfig {
            interval: Duration::from_millis(u64::from(config.heartbeat_interval_ms)),
            timeout: Duration::from_millis(u64::from(config.heartbeat_timeout_ms)),
        },
    );

    if let Some(metrics_port) = config.metrics_port {
        let addr: std::net::SocketAddr = ([0, 0, 0, 0], metrics_port).into();
        tokio::spawn(async move {
            if let Err(e) = dkvs_metrics::serve_metrics(addr).await {
                tracing::warn!("metrics endpoint failed: {}", e);
            }
        });
    }

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!("serving on port {}", config.port);

    tokio::select! {
        result = dkvs_net::serve(listener, coordinator) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    // Ordered shutdown: stop background writers, then flush the WAL.
    heartbeat.stop().await;
    pool.close_all();
    wal.close()?;
    tracing::info!("WAL flushed and closed");

    Ok(())
}
