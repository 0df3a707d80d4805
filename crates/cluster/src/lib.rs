//! Replication layer for dkvs.
//!
//! Provides the [`Coordinator`](coordinator::Coordinator) that turns
//! parsed wire commands into quorum writes, quorum reads with read
//! repair, and local replica operations; the durable
//! [`HintStore`](hint_store::HintStore) backing hinted handoff; the
//! [`ReplicaTransport`](transport::ReplicaTransport) seam implemented by
//! the network crate; and the peer [heartbeat](heartbeat) task that
//! triggers hint replay when peers recover.

pub mod coordinator;
pub mod heartbeat;
pub mod hint_store;
pub mod transport;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use hint_store::{Hint, HintStore};
pub use transport::{ReplicaTransport, TransportError};
