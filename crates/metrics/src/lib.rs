//! Tracing setup and Prometheus metrics for dkvs.
//!
//! A single [`NodeMetrics`] instance lives behind a `OnceLock`; every
//! crate increments counters through [`metrics()`]. An optional HTTP
//! endpoint serves the text exposition format for scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with env-filter (`RUST_LOG`),
/// defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// The global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a dkvs node.
pub struct NodeMetrics {
    pub registry: Registry,

    /// Client commands handled, labelled by command word.
    pub commands: IntCounterVec,
    /// Quorum writes that reached W acks / fell short.
    pub quorum_writes_ok: IntCounter,
    pub quorum_writes_failed: IntCounter,
    /// Quorum reads that got at least one response / none.
    pub quorum_reads_ok: IntCounter,
    pub quorum_reads_failed: IntCounter,
    /// Replica RPC legs, labelled by kind and outcome.
    pub replica_legs: IntCounterVec,
    /// Hinted handoff activity.
    pub hints_stored: IntCounter,
    pub hints_replayed: IntCounter,
    /// Read-repair pushes issued.
    pub read_repairs: IntCounter,
    /// Snapshots written.
    pub snapshots_saved: IntCounter,
    /// End-to-end command latency by command word.
    pub command_latency_secs: HistogramVec,
}

impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let commands = IntCounterVec::new(
            Opts::new("dkvs_commands_total", "Client commands handled, by type"),
            &["command"],
        )
        .expect("commands counter vec");

        let quorum_writes_ok = IntCounter::with_opts(Opts::new(
            "dkvs_quorum_writes_ok_total",
            "Quorum writes that reached W acks",
        ))
        .expect("quorum_writes_ok counter");
        let quorum_writes_failed = IntCounter::with_opts(Opts::new(
            "dkvs_quorum_writes_failed_total",
            "Quorum writes that fell short of W acks",
        ))
        .expect("quorum_writes_failed counter");

        let quorum_reads_ok = IntCounter::with_opts(Opts::new(
            "dkvs_quorum_reads_ok_total",
            "Quorum reads with at least one replica response",
        ))
        .expect("quorum_reads_ok counter");
        let quorum_reads_failed = IntCounter::with_opts(Opts::new(
            "dkvs_quorum_reads_failed_total",
            "Quorum reads with no replica response",
        ))
        .expect("quorum_reads_failed counter");

        let replica_legs = IntCounterVec::new(
            Opts::new(
                "dkvs_replica_legs_total",
                "Replica RPC legs, by kind and outcome",
            ),
            &["kind", "outcome"],
        )
        .expect("replica_legs counter vec");

        let hints_stored = IntCounter::with_opts(Opts::new(
            "dkvs_hints_stored_total",
            "Hints recorded for unreachable replicas",
        ))
        .expect("hints_stored counter");
        let hints_replayed = IntCounter::with_opts(Opts::new(
            "dkvs_hints_replayed_total",
            "Hints successfully replayed to recovered replicas",
        ))
        .expect("hints_replayed counter");

        let read_repairs = IntCounter::with_opts(Opts::new(
            "dkvs_read_repairs_total",
            "Read-repair pushes issued to stale replicas",
        ))
        .expect("read_repairs counter");

        let snapshots_saved = IntCounter::with_opts(Opts::new(
            "dkvs_snapshots_saved_total",
            "Snapshots written to disk",
        ))
        .expect("snapshots_saved counter");

        let command_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "dkvs_command_latency_seconds",
                "Client command latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["command"],
        )
        .expect("command_latency_secs histogram");

        for collector in [
            Box::new(commands.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(quorum_writes_ok.clone()),
            Box::new(quorum_writes_failed.clone()),
            Box::new(quorum_reads_ok.clone()),
            Box::new(quorum_reads_failed.clone()),
            Box::new(replica_legs.clone()),
            Box::new(hints_stored.clone()),
            Box::new(hints_replayed.clone()),
            Box::new(read_repairs.clone()),
            Box::new(snapshots_saved.clone()),
            Box::new(command_latency_secs.clone()),
        ] {
            registry.register(collector).expect("register collector");
        }

        Self {
            registry,
            commands,
            quorum_writes_ok,
            quorum_writes_failed,
            quorum_reads_ok,
            quorum_reads_failed,
            replica_legs,
            hints_stored,
            hints_replayed,
            read_repairs,
            snapshots_saved,
            command_latency_secs,
        }
    }
}

/// Encode all registered metrics in the Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&metrics().registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Timer guard for a command; records elapsed seconds on drop.
pub fn start_command_timer(command: &str) -> prometheus::HistogramTimer {
    metrics()
        .command_latency_secs
        .with_label_values(&[command])
        .start_timer()
}

// ---------------------------------------------------------------------------
// Scrape endpoint
// ---------------------------------------------------------------------------

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn scrape_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on `addr` (any path). Run from `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics endpoint listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(scrape_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
