//! Peer liveness probing and hint replay triggering.
//!
//! A background task PINGs every ring peer on a fixed period and tracks
//! an UP/DOWN flag per node. A peer is marked DOWN once it has gone
//! `timeout` without answering; any successful probe marks it UP again.
//! Whenever a probe succeeds and the peer has pending hints, the
//! coordinator's replay kicks in — that is how writes stored during an
//! outage reach the replica after it recovers.
//!
//! The task is owned: [`HeartbeatHandle::stop`] signals shutdown and
//! joins it, so no probe or replay runs after stop returns.

use crate::coordinator::Coordinator;
use crate::transport::ReplicaTransport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Probe period.
    pub interval: Duration,
    /// Silence tolerated before a peer is marked DOWN.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            timeout: Duration::from_millis(5000),
        }
    }
}

/// Owned handle to the running heartbeat task.
pub struct HeartbeatHandle {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Signal shutdown and wait for the task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

struct PeerState {
    up: bool,
    last_seen: Option<Instant>,
}

/// Spawn the heartbeat task over every ring peer except the local node.
pub fn spawn_heartbeat_task<T: ReplicaTransport>(
    coordinator: Arc<Coordinator<T>>,
    config: HeartbeatConfig,
) -> HeartbeatHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut states: HashMap<u32, PeerState> = HashMap::new();
        let mut tick = tokio::time::interval(config.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown_rx.changed() => {
                    // A dropped handle counts as shutdown too.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
            }

            let peers: Vec<(u32, String)> = coordinator
                .ring()
                .nodes()
                .filter(|(id, _)| *id != coordinator.node_id())
                .map(|(id, addr)| (id, addr.to_string()))
                .collect();

            for (node_id, address) in peers {
                let state = states.entry(node_id).or_insert(PeerState {
                    up: true,
                    last_seen: None,
                });

                match coordinator.transport().ping(&address).await {
                    Ok(()) => {
                        if !state.up {
                            tracing::info!(node_id, "peer {} is UP again", address);
                        }
                        state.up = true;
                        state.last_seen = Some(Instant::now());

                        if !coordinator.hints().hints_for(node_id).is_empty() {
                            coordinator.replay_hints_for(node_id, &address).await;
                        }
                    }
                    Err(e) => {
                        let silent_for = state.last_seen.map(|t| t.elapsed());
                        let past_timeout =
                            silent_for.map_or(true, |d| d >= config.timeout);
                        if state.up && past_timeout {
                            tracing::warn!(
                                node_id,
                                "peer {} is DOWN ({}), holding writes as hints",
                                address,
                                e
                            );
                            state.up = false;
                        }
                    }
                }
            }
        }
    });

    HeartbeatHandle {
        shutdown: shutdown_tx,
        task,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
