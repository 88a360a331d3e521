//! Shared relay state: the subdomain registry, the pending-request table,
//! and the handful of primitives both need (liveness flags, close
//! signaling). Mirrors the teacher's `AppState` — `DashMap`-backed
//! registries, no single giant lock across the ingress, the upgrade
//! handler, the per-channel receive loop, and shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tunnel_protocol::{Frame, ResponseFrame};

use crate::config::RelayConfig;

/// One agent's attached control channel, as seen by the relay (spec §3).
pub struct TunnelConnection {
    pub id: String,
    /// Outbound frames destined for this agent.
    pub tx: mpsc::UnboundedSender<Frame>,
    /// Set by the inbound loop on every `pong`; cleared by the heartbeat
    /// tick. Two consecutive misses (never set between two ticks) marks
    /// the connection dead.
    pub alive: Arc<AtomicBool>,
    /// Notified by the heartbeat task (or any other cleanup path) to
    /// make the inbound read loop stop and tear the socket down.
    pub close: Arc<Notify>,
    heartbeat: JoinHandle<()>,
}

impl TunnelConnection {
    pub fn new(
        id: String,
        tx: mpsc::UnboundedSender<Frame>,
        alive: Arc<AtomicBool>,
        close: Arc<Notify>,
        heartbeat: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            tx,
            alive,
            close,
            heartbeat,
        }
    }
}

impl Drop for TunnelConnection {
    /// Every path that removes an entry from the registry — graceful
    /// disconnect, heartbeat death, or shutdown — cancels the heartbeat
    /// through this single choke point, so it can never leak.
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

/// The outcome eventually delivered to an ingress task waiting on one
/// public HTTP request (spec §3 `PendingRequest`).
pub enum PendingOutcome {
    Response(ResponseFrame),
    ShuttingDown,
}

/// One public HTTP request awaiting its reply through a tunnel.
pub struct PendingRequest {
    pub tunnel_id: String,
    pub reply: oneshot::Sender<PendingOutcome>,
}

/// Shared, `Arc`-cloned application state.
pub struct SharedState {
    pub config: RelayConfig,
    pub tunnels: DashMap<String, TunnelConnection>,
    pub pending: DashMap<String, PendingRequest>,
}

impl SharedState {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            tunnels: DashMap::new(),
            pending: DashMap::new(),
        })
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Marks the tunnel alive on a `pong` (spec §4.4).
    pub fn mark_alive(&self, id: &str) {
        if let Some(conn) = self.tunnels.get(id) {
            conn.alive.store(true, Ordering::SeqCst);
        }
    }

    /// Resolves a `tunnel-response` frame to its pending request, if any
    /// is still waiting. Removal is atomic per key, so a duplicate
    /// `tunnel-response` for the same id is silently ignored (spec §8).
    pub fn resolve_response(&self, response: ResponseFrame) {
        if let Some((_, pending)) = self.pending.remove(&response.id) {
            let _ = pending.reply.send(PendingOutcome::Response(response));
        }
    }

    /// Drains the pending table at shutdown, waking every still-waiting
    /// ingress task with a "shutting down" outcome (spec §4.5).
    pub fn drain_pending_for_shutdown(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.reply.send(PendingOutcome::ShuttingDown);
            }
        }
    }

    /// Closes and forgets every connected tunnel (spec §4.5).
    pub fn close_all_tunnels(&self) {
        let ids: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, conn)) = self.tunnels.remove(&id) {
                conn.close.notify_waiters();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config() -> RelayConfig {
        RelayConfig {
            listen_addr: "0.0.0.0:7070".parse().unwrap(),
            secrets: HashSet::from(["sk_test_key_123".to_string()]),
            base_domain: "tunnel.test.local".to_string(),
            max_tunnels: 10,
        }
    }

    fn insert_tunnel(state: &SharedState, id: &str) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let close = Arc::new(Notify::new());
        let heartbeat = tokio::spawn(async {});
        state.tunnels.insert(
            id.to_string(),
            TunnelConnection::new(id.to_string(), tx, alive, close, heartbeat),
        );
        rx
    }

    #[tokio::test]
    async fn resolve_response_delivers_once_and_ignores_duplicates() {
        let state = SharedState::new(config());
        let (reply_tx, reply_rx) = oneshot::channel();
        state.pending.insert(
            "corr-1".to_string(),
            PendingRequest {
                tunnel_id: "abc12345".to_string(),
                reply: reply_tx,
            },
        );

        state.resolve_response(ResponseFrame {
            id: "corr-1".to_string(),
            status: 200,
            headers: Default::default(),
            body: None,
        });
        assert!(matches!(
            reply_rx.await.unwrap(),
            PendingOutcome::Response(_)
        ));
        assert!(!state.pending.contains_key("corr-1"));

        // A second response for the same id finds nothing to resolve.
        state.resolve_response(ResponseFrame {
            id: "corr-1".to_string(),
            status: 200,
            headers: Default::default(),
            body: None,
        });
    }

    #[tokio::test]
    async fn drain_pending_wakes_every_waiter_with_shutdown() {
        let state = SharedState::new(config());
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        state.pending.insert(
            "a".to_string(),
            PendingRequest {
                tunnel_id: "t".to_string(),
                reply: tx1,
            },
        );
        state.pending.insert(
            "b".to_string(),
            PendingRequest {
                tunnel_id: "t".to_string(),
                reply: tx2,
            },
        );

        state.drain_pending_for_shutdown();

        assert!(matches!(rx1.await.unwrap(), PendingOutcome::ShuttingDown));
        assert!(matches!(rx2.await.unwrap(), PendingOutcome::ShuttingDown));
        assert_eq!(state.pending.len(), 0);
    }

    #[tokio::test]
    async fn close_all_tunnels_empties_registry_and_notifies() {
        let state = SharedState::new(config());
        let _rx = insert_tunnel(&state, "abc12345");
        assert_eq!(state.tunnel_count(), 1);

        state.close_all_tunnels();
        assert_eq!(state.tunnel_count(), 0);
    }

    #[tokio::test]
    async fn mark_alive_sets_flag_for_known_tunnel_only() {
        let state = SharedState::new(config());
        let _rx = insert_tunnel(&state, "abc12345");
        state.mark_alive("abc12345");
        assert!(state
            .tunnels
            .get("abc12345")
            .unwrap()
            .alive
            .load(Ordering::SeqCst));

        // Unknown id: no panic, no-op.
        state.mark_alive("does-not-exist");
    }
}
