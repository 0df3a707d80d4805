//! Abstraction over node-to-node RPCs.
//!
//! A trait at the domain seam with the concrete TCP implementation in
//! `dkvs-net`; unit tests substitute mocks. Every call maps to exactly
//! one request frame and one response line on the wire.

use dkvs_common::Version;
use dkvs_proto::VersionedReply;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer unavailable: {0}")]
    Unavailable(String),
    #[error("peer timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Transport for replica RPCs (RSET/RDEL/RGET/PING/FWD).
#[async_trait::async_trait]
pub trait ReplicaTransport: Send + Sync + 'static {
    /// Send an `RSET` (or `RDEL` when `is_del`) carrying `version` to the
    /// replica at `address`. Succeeds only on a `+OK` response.
    async fn replica_write(
        &self,
        address: &str,
        key: &[u8],
        value: &[u8],
        is_del: bool,
        version: Version,
    ) -> Result<(), TransportError>;

    /// Send an `RGET` and return the decoded versioned reply. A replica
    /// answering `-NOT_FOUND` is a successful call with `found == false`.
    async fn replica_read(
        &self,
        address: &str,
        key: &[u8],
    ) -> Result<VersionedReply, TransportError>;

    /// Liveness probe: `PING` answered by `+PONG`.
    async fn ping(&self, address: &str) -> Result<(), TransportError>;

    /// Legacy single-owner routing: wrap `inner_line` in a
    /// `FWD <hops> <line>` frame and relay the peer's raw response.
    async fn forward(
        &self,
        address: &str,
        hops: u32,
        inner_line: &[u8],
    ) -> Result<Vec<u8>, TransportError>;
}
