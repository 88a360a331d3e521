//! Control-channel handshake and lifecycle.
//!
//! Contains the core WebSocket logic for the relay:
//! - Upgrading the `/tunnel` HTTP connection to a WebSocket, with
//!   authentication and admission gating first (spec §4.2)
//! - Managing the lifecycle of each connection: inbound/outbound tasks,
//!   heartbeat, cleanup (spec §4.4)
//! - Dispatching incoming frames to the appropriate handler (spec §4.4)

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};
use tunnel_protocol::{subdomain, Frame};

use crate::state::{SharedState, TunnelConnection};

pub const SECRET_HEADER: &str = "x-api-key";
pub const SUBDOMAIN_HEADER: &str = "x-subdomain";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// The outcome of checking a handshake attempt against the shared-secret
/// set and the tunnel cap, before any socket is touched (spec §4.2).
#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Admit,
    Unauthorized,
    CapReached,
}

/// Pure admission check: missing/unknown secret is rejected first, then
/// the live-tunnel count is checked against the configured cap. Kept
/// free of any axum/websocket type so it can be unit tested directly.
fn check_admission(
    secret: Option<&str>,
    secrets: &HashSet<String>,
    tunnel_count: usize,
    max_tunnels: usize,
) -> Admission {
    if !secret.is_some_and(|s| secrets.contains(s)) {
        return Admission::Unauthorized;
    }
    if tunnel_count >= max_tunnels {
        return Admission::CapReached;
    }
    Admission::Admit
}

/// `GET /tunnel` — authenticates and admits the agent, then upgrades to
/// the duplex control channel (spec §4.2).
pub async fn tunnel_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Response {
    let secret = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    match check_admission(
        secret,
        &state.config.secrets,
        state.tunnel_count(),
        state.config.max_tunnels,
    ) {
        Admission::Unauthorized => return StatusCode::UNAUTHORIZED.into_response(),
        Admission::CapReached => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "Max tunnel limit reached",
                    "limit": state.config.max_tunnels,
                })),
            )
                .into_response()
        }
        Admission::Admit => {}
    }

    let preferred = headers
        .get(SUBDOMAIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ws.on_upgrade(move |socket| handle_connection(socket, state, preferred))
}

/// Manages the full lifecycle of one attached agent's control channel.
async fn handle_connection(
    socket: WebSocket,
    state: Arc<SharedState>,
    preferred: Option<String>,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let alive = Arc::new(AtomicBool::new(true));
    let close = Arc::new(Notify::new());

    let id = reserve_and_insert(&state, preferred, tx.clone(), alive, close.clone());
    info!(tunnel = %id, "agent attached");

    let url = format!("https://{}.{}", id, state.config.base_domain);
    let _ = tx.send(Frame::TunnelAssigned {
        subdomain: id.clone(),
        url,
    });

    // Outbound task: serializes queued frames onto the socket.
    let outbound = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sink.send(Message::Text(frame.encode().into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = close.notified() => break,
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch_frame(&state, &id, &text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(tunnel = %id, error = %e, "transport error");
                        break;
                    }
                }
            }
        }
    }

    outbound.abort();
    info!(tunnel = %id, "agent detached");
    state.tunnels.remove(&id);
}

/// Resolves the TunnelId for a new attachment and inserts its registry
/// entry in the same atomic step (spec §4.2): the preferred label if it
/// is syntactically valid and free, otherwise a freshly minted random
/// one. `DashMap::entry` makes check-and-reserve atomic per candidate
/// key, closing the race window a separate check-then-insert would leave.
fn reserve_and_insert(
    state: &Arc<SharedState>,
    preferred: Option<String>,
    tx: mpsc::UnboundedSender<Frame>,
    alive: Arc<AtomicBool>,
    close: Arc<Notify>,
) -> String {
    use dashmap::mapref::entry::Entry;

    let mut try_insert = |label: String| -> Option<String> {
        match state.tunnels.entry(label.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(v) => {
                let heartbeat = tokio::spawn(heartbeat_loop(
                    state.clone(),
                    label.clone(),
                    alive.clone(),
                    tx.clone(),
                ));
                v.insert(TunnelConnection::new(
                    label.clone(),
                    tx.clone(),
                    alive.clone(),
                    close.clone(),
                    heartbeat,
                ));
                Some(label)
            }
        }
    };

    if let Some(label) = preferred {
        if subdomain::is_valid(&label) {
            if let Some(id) = try_insert(label) {
                return id;
            }
        }
    }

    loop {
        let candidate = subdomain::generate(rand::random::<u32>);
        if let Some(id) = try_insert(candidate) {
            return id;
        }
    }
}

/// Interprets one incoming frame by discriminant (spec §4.4). Anything
/// that fails to parse, or is observed traveling the wrong direction, is
/// dropped with a warning; the channel stays open.
fn dispatch_frame(state: &SharedState, tunnel_id: &str, text: &str) {
    let frame = match Frame::decode(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(tunnel = %tunnel_id, error = %e, "dropping unparsable frame");
            return;
        }
    };

    match frame {
        Frame::Pong => state.mark_alive(tunnel_id),
        Frame::TunnelResponse(response) => state.resolve_response(response),
        other => warn!(tunnel = %tunnel_id, frame = ?other, "ignoring frame in the wrong direction"),
    }
}

/// Per-connection heartbeat (spec §4.4, §5, §8). Ticks every 30s; a tick
/// that finds the alive flag still unset (no `pong` since the previous
/// tick) treats the connection as dead within 60s of its last `pong`.
async fn heartbeat_loop(
    state: Arc<SharedState>,
    id: String,
    alive: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Frame>,
) {
    loop {
        tokio::time::sleep(HEARTBEAT_INTERVAL).await;

        if !alive.swap(false, Ordering::SeqCst) {
            warn!(tunnel = %id, "heartbeat missed, closing tunnel");
            if let Some((_, conn)) = state.tunnels.remove(&id) {
                conn.close.notify_waiters();
            }
            return;
        }

        if tx.send(Frame::Ping).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config() -> crate::config::RelayConfig {
        crate::config::RelayConfig {
            listen_addr: "0.0.0.0:7070".parse().unwrap(),
            secrets: HashSet::from(["sk_test_key_123".to_string()]),
            base_domain: "tunnel.test.local".to_string(),
            max_tunnels: 10,
        }
    }

    fn channel() -> (mpsc::UnboundedSender<Frame>, Arc<AtomicBool>, Arc<Notify>) {
        let (tx, _rx) = mpsc::unbounded_channel();
        (tx, Arc::new(AtomicBool::new(true)), Arc::new(Notify::new()))
    }

    #[test]
    fn admission_rejects_missing_secret() {
        let secrets = HashSet::from(["sk_test_key_123".to_string()]);
        assert_eq!(check_admission(None, &secrets, 0, 10), Admission::Unauthorized);
    }

    #[test]
    fn admission_rejects_unknown_secret() {
        let secrets = HashSet::from(["sk_test_key_123".to_string()]);
        assert_eq!(
            check_admission(Some("wrong_key"), &secrets, 0, 10),
            Admission::Unauthorized
        );
    }

    #[test]
    fn admission_rejects_at_cap() {
        let secrets = HashSet::from(["sk_test_key_123".to_string()]);
        assert_eq!(
            check_admission(Some("sk_test_key_123"), &secrets, 10, 10),
            Admission::CapReached
        );
    }

    #[test]
    fn admission_checks_secret_before_cap() {
        let secrets = HashSet::from(["sk_test_key_123".to_string()]);
        assert_eq!(
            check_admission(Some("wrong_key"), &secrets, 10, 10),
            Admission::Unauthorized
        );
    }

    #[test]
    fn admission_admits_under_cap_with_valid_secret() {
        let secrets = HashSet::from(["sk_test_key_123".to_string()]);
        assert_eq!(
            check_admission(Some("sk_test_key_123"), &secrets, 9, 10),
            Admission::Admit
        );
    }

    #[tokio::test]
    async fn reserve_uses_preferred_label_when_free() {
        let state = SharedState::new(config());
        let (tx, alive, close) = channel();
        let id = reserve_and_insert(&state, Some("myapp".to_string()), tx, alive, close);
        assert_eq!(id, "myapp");
        assert!(state.tunnels.contains_key("myapp"));
    }

    #[tokio::test]
    async fn reserve_falls_back_to_random_when_preferred_taken() {
        let state = SharedState::new(config());
        let (tx1, alive1, close1) = channel();
        reserve_and_insert(&state, Some("myapp".to_string()), tx1, alive1, close1);

        let (tx2, alive2, close2) = channel();
        let id = reserve_and_insert(&state, Some("myapp".to_string()), tx2, alive2, close2);
        assert_ne!(id, "myapp");
        assert_eq!(id.len(), 8);
    }

    #[tokio::test]
    async fn reserve_falls_back_to_random_when_preferred_invalid() {
        let state = SharedState::new(config());
        let (tx, alive, close) = channel();
        let id = reserve_and_insert(&state, Some("UPPER".to_string()), tx, alive, close);
        assert_ne!(id, "UPPER");
        assert_eq!(id.len(), 8);
    }

    #[tokio::test]
    async fn reserve_mints_random_label_when_no_preference() {
        let state = SharedState::new(config());
        let (tx, alive, close) = channel();
        let id = reserve_and_insert(&state, None, tx, alive, close);
        assert_eq!(id.len(), 8);
        assert!(id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }
}
