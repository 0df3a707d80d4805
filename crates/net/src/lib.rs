//! Network surface for dkvs: pooled peer connections, the TCP
//! implementation of the replica transport, and the client-facing
//! frame server.

pub mod pool;
pub mod server;
pub mod transport;

pub use pool::ConnectionPool;
pub use server::serve;
pub use transport::TcpReplicaTransport;
