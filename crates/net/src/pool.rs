//! Idle-connection reuse across peer addresses.
//!
//! Each address keeps a small stack of idle TCP connections. Acquire
//! pops one or dials a new connection; release pushes it back unless
//! the per-peer cap is reached, in which case the connection just
//! drops. Callers must release only after fully consuming a response —
//! a pooled connection always starts drained, so one-line framing on
//! replica RPCs never interleaves.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;

/// Default idle connections kept per peer.
pub const DEFAULT_MAX_PER_PEER: usize = 4;
/// Default connect/send/recv bound.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// A connection checked out of the pool.
#[derive(Debug)]
pub struct PooledConnection {
    pub stream: TcpStream,
    address: String,
}

#[derive(Debug)]
pub struct ConnectionPool {
    idle: Mutex<HashMap<String, Vec<TcpStream>>>,
    max_per_peer: usize,
    timeout: Duration,
}

impl ConnectionPool {
    pub fn new(max_per_peer: usize, timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_per_peer,
            timeout,
        }
    }

    /// The socket timeout callers should apply to send/recv on pooled
    /// connections.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Pop an idle connection for `address`, or dial a new one bounded
    /// by the pool timeout. `None` when the peer cannot be reached.
    pub async fn acquire(&self, address: &str) -> Option<PooledConnection> {
        let reused = self
            .idle
            .lock()
            .get_mut(address)
            .and_then(|stack| stack.pop());
        if let Some(stream) = reused {
            return Some(PooledConnection {
                stream,
                address: address.to_string(),
            });
        }

        match tokio::time::timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Some(PooledConnection {
                    stream,
                    address: address.to_string(),
                })
            }
            Ok(Err(e)) => {
                tracing::debug!("connect to {} failed: {}", address, e);
                None
            }
            Err(_) => {
                tracing::debug!("connect to {} timed out", address);
                None
            }
        }
    }

    /// Return a connection to the idle stack, or close it (by drop) if
    /// the peer's stack is full.
    pub fn release(&self, conn: PooledConnection) {
        let mut idle = self.idle.lock();
        let stack = idle.entry(conn.address).or_default();
        if stack.len() < self.max_per_peer {
            stack.push(conn.stream);
        }
    }

    /// Drop every idle connection.
    pub fn close_all(&self) {
        self.idle.lock().clear();
    }

    /// Idle connections currently held for `address`.
    pub fn idle_count(&self, address: &str) -> usize {
        self.idle.lock().get(address).map_or(0, Vec::len)
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_PEER, DEFAULT_TIMEOUT)
    }
}
