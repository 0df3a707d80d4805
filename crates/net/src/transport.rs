//! TCP implementation of the replica transport.
//!
//! Every RPC is one request frame followed by one response line on a
//! pooled connection. The connection is released back to the pool only
//! after the full response has been read; any error path drops it
//! instead, so the next caller always starts on a drained stream.

use crate::pool::{ConnectionPool, PooledConnection};
use dkvs_cluster::{ReplicaTransport, TransportError};
use dkvs_common::Version;
use dkvs_proto::{self as proto, VersionedReply};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug)]
pub struct TcpReplicaTransport {
    pool: Arc<ConnectionPool>,
}

impl TcpReplicaTransport {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Send `frame` and read exactly one newline-terminated response.
    async fn call(&self, address: &str, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let timeout = self.pool.timeout();
        let mut conn: PooledConnection = self
            .pool
            .acquire(address)
            .await
            .ok_or_else(|| TransportError::Unavailable(address.to_string()))?;

        match tokio::time::timeout(timeout, conn.stream.write_all(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TransportError::Unavailable(e.to_string())),
            Err(_) => return Err(TransportError::Timeout),
        }

        let mut response = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match tokio::time::timeout(timeout, conn.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    return Err(TransportError::Unavailable(format!(
                        "{} closed the connection",
                        address
                    )))
                }
                Ok(Ok(n)) => {
                    response.extend_from_slice(&chunk[..n]);
                    if response.last() == Some(&b'\n') {
                        break;
                    }
                }
                Ok(Err(e)) => return Err(TransportError::Unavailable(e.to_string())),
                Err(_) => return Err(TransportError::Timeout),
            }
        }

        // Full response consumed: the connection is drained and safe to reuse.
        self.pool.release(conn);
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ReplicaTransport for TcpReplicaTransport {
    async fn replica_write(
        &self,
        address: &str,
        key: &[u8],
        value: &[u8],
        is_del: bool,
        version: Version,
    ) -> Result<(), TransportError> {
        let frame = if is_del {
            proto::encode_rdel(key, version)
        } else {
            proto::encode_rset(key, value, version)
        };

        let response = self.call(address, &frame).await?;
        if response == b"+OK\n" {
            Ok(())
        } else {
            Err(TransportError::Protocol(
                String::from_utf8_lossy(&response).trim_end().to_string(),
            ))
        }
    }

    async fn replica_read(
        &self,
        address: &str,
        key: &[u8],
    ) -> Result<VersionedReply, TransportError> {
        let response = self.call(address, &proto::encode_rget(key)).await?;
        Ok(proto::parse_versioned_reply(&response))
    }

    async fn ping(&self, address: &str) -> Result<(), TransportError> {
        let response = self.call(address, &proto::encode_ping()).await?;
        if response == b"+PONG\n" {
            Ok(())
        } else {
            Err(TransportError::Protocol(
                String::from_utf8_lossy(&response).trim_end().to_string(),
            ))
        }
    }

    async fn forward(
        &self,
        address: &str,
        hops: u32,
        inner_line: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        self.call(address, &proto::format_forward(hops, inner_line))
            .await
    }
}
