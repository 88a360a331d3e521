//! Connect/handshake, receive loop, and reconnection (spec §4.6, §4.7).
//!
//! Mirrors the teacher's `run_agent_loop`: one task owns the socket for
//! the life of a single attachment, an outbound mpsc channel serializes
//! frames onto it, a heartbeat-reply path answers `ping` with `pong`
//! inline, and each `tunnel-request` is forwarded on its own spawned task
//! so a slow origin never stalls the receive loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use tunnel_protocol::Frame;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::forward::forward_request;

const SECRET_HEADER: &str = "x-api-key";
const SUBDOMAIN_HEADER: &str = "x-subdomain";

/// Backoff delays, in order, between reconnect attempts (spec §4.7).
const BACKOFF_SECS: [u64; 5] = [1, 2, 4, 8, 16];

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The public identity currently assigned to this agent's attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub subdomain: String,
    pub url: String,
}

/// Why a terminal `close` event was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The caller called [`Agent::close`].
    Requested,
    /// Reconnection exhausted its backoff budget (spec §4.7, §7).
    ReconnectExhausted,
}

/// One asynchronous occurrence a caller may want to observe (spec §9).
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// One completed proxy round-trip.
    Request {
        method: String,
        path: String,
        status: u16,
    },
    /// An out-of-band failure that doesn't close the channel by itself.
    Error(String),
    /// Emitted exactly once, at terminal teardown.
    Close(CloseReason),
}

/// A live (or reconnecting) agent attachment.
///
/// `assigned` is a `watch`-backed handle: the currently assigned
/// subdomain/URL, updated in place across reconnects per spec.md's
/// second Open Question (the public URL is observable and mutable for
/// the lifetime of the `Agent`, not fixed at connect time).
pub struct Agent {
    assigned: watch::Receiver<Assignment>,
    events: mpsc::UnboundedReceiver<AgentEvent>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl Agent {
    /// Issues the initial upgrade to `<relay>/tunnel` and, once the
    /// first `tunnel-assigned` frame arrives, returns a handle to the
    /// running attachment. A failed initial handshake (network error,
    /// wrong status, or a channel that closes before assigning) is
    /// returned directly to the caller; no `Agent` is created (spec §4.6).
    pub async fn connect(config: AgentConfig) -> Result<Agent> {
        let (stream, assignment) =
            handshake(&config, config.preferred_subdomain.clone()).await?;

        let (assigned_tx, assigned_rx) = watch::channel(assignment.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let close_notify = Arc::new(Notify::new());

        let task = tokio::spawn(run(
            config,
            stream,
            assignment,
            assigned_tx,
            events_tx,
            closed.clone(),
            close_notify.clone(),
        ));

        Ok(Agent {
            assigned: assigned_rx,
            events: events_rx,
            closed,
            close_notify,
            task,
        })
    }

    /// The subdomain/URL currently assigned to this attachment.
    pub fn assignment(&self) -> Assignment {
        self.assigned.borrow().clone()
    }

    /// Awaits the next event. Returns `None` once the event stream is
    /// exhausted (after the terminal `Close` event has been delivered).
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    /// Idempotent: a second call observes the same already-closed state
    /// and is a no-op (spec §8).
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_notify.notify_waiters();
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.close();
        self.task.abort();
    }
}

/// Performs one upgrade attempt and waits for the first frame, which
/// must be `tunnel-assigned` (spec §4.6).
async fn handshake(config: &AgentConfig, preferred: Option<String>) -> Result<(WsStream, Assignment)> {
    let url = websocket_url(&config.relay_url);
    let mut request = url
        .into_client_request()
        .map_err(AgentError::ConnectFailed)?;

    let headers = request.headers_mut();
    let secret_value = HeaderValue::from_str(&config.secret).map_err(|_| {
        AgentError::Config("TUNNEL_SECRET contains characters invalid in an HTTP header".into())
    })?;
    headers.insert(SECRET_HEADER, secret_value);
    if let Some(label) = &preferred {
        if let Ok(value) = HeaderValue::from_str(label) {
            headers.insert(SUBDOMAIN_HEADER, value);
        }
    }

    let (mut stream, _response) = match tokio_tungstenite::connect_async(request).await {
        Ok(pair) => pair,
        Err(tokio_tungstenite::tungstenite::Error::Http(resp))
            if resp.status() == StatusCode::UNAUTHORIZED =>
        {
            return Err(AgentError::AuthRejected(
                "relay rejected the shared secret".into(),
            ))
        }
        Err(e) => return Err(AgentError::ConnectFailed(e)),
    };

    match stream.next().await {
        Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
            Ok(Frame::TunnelAssigned { subdomain, url }) => {
                info!(%subdomain, %url, "assigned");
                Ok((stream, Assignment { subdomain, url }))
            }
            _ => Err(AgentError::NoAssignment),
        },
        _ => Err(AgentError::NoAssignment),
    }
}

/// Rewrites an `http(s)://` relay base URL to the `ws(s)://` scheme the
/// control-channel upgrade needs, and appends the fixed `/tunnel` path.
fn websocket_url(relay_url: &str) -> String {
    let base = relay_url.trim_end_matches('/');
    let with_ws_scheme = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{with_ws_scheme}/tunnel")
}

/// Owns one attachment end-to-end: the freshly-handshaken connection
/// passed in by the caller, then reconnection with backoff for as long
/// as the caller hasn't closed and attempts remain (spec §4.7).
async fn run(
    config: AgentConfig,
    mut stream: WsStream,
    mut assignment: Assignment,
    assigned_tx: watch::Sender<Assignment>,
    events_tx: mpsc::UnboundedSender<AgentEvent>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
) {
    let client = reqwest::Client::new();

    loop {
        run_connection(&mut stream, &config, &client, &events_tx, &close_notify).await;

        if closed.load(Ordering::SeqCst) {
            let _ = events_tx.send(AgentEvent::Close(CloseReason::Requested));
            return;
        }

        match reconnect_with_backoff(&config, &assignment, &closed, &close_notify).await {
            Some((new_stream, new_assignment)) => {
                stream = new_stream;
                assignment = new_assignment;
                let _ = assigned_tx.send(assignment.clone());
            }
            None => {
                if closed.load(Ordering::SeqCst) {
                    let _ = events_tx.send(AgentEvent::Close(CloseReason::Requested));
                } else {
                    let _ = events_tx.send(AgentEvent::Error(
                        "reconnect attempts exhausted".to_string(),
                    ));
                    let _ = events_tx.send(AgentEvent::Close(CloseReason::ReconnectExhausted));
                }
                return;
            }
        }
    }
}

/// Drives one open connection until it closes, for any reason: a
/// transport error, the relay hanging up, or a caller-initiated close.
async fn run_connection(
    stream: &mut WsStream,
    config: &AgentConfig,
    client: &reqwest::Client,
    events_tx: &mpsc::UnboundedSender<AgentEvent>,
    close_notify: &Arc<Notify>,
) {
    let (mut sink, mut source) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

    let outbound = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame.encode().into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = close_notify.notified() => break,
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&text, config, client, &outbound_tx, events_tx);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "transport error");
                        break;
                    }
                }
            }
        }
    }

    outbound.abort();
}

fn handle_frame(
    text: &str,
    config: &AgentConfig,
    client: &reqwest::Client,
    outbound_tx: &mpsc::UnboundedSender<Frame>,
    events_tx: &mpsc::UnboundedSender<AgentEvent>,
) {
    let frame = match Frame::decode(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "dropping unparsable frame");
            return;
        }
    };

    match frame {
        Frame::Ping => {
            let _ = outbound_tx.send(Frame::Pong);
        }
        Frame::TunnelRequest(request) => {
            let client = client.clone();
            let local_host = config.local_host.clone();
            let local_port = config.local_port;
            let outbound_tx = outbound_tx.clone();
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                let method = request.method.clone();
                let path = request.path.clone();
                let response = forward_request(&client, &local_host, local_port, request).await;
                let status = response.status;
                let _ = outbound_tx.send(Frame::TunnelResponse(response));
                let _ = events_tx.send(AgentEvent::Request { method, path, status });
            });
        }
        Frame::TunnelError { message } => {
            let _ = events_tx.send(AgentEvent::Error(message));
        }
        other => warn!(frame = ?other, "ignoring frame in the wrong direction"),
    }
}

/// Attempts reconnection at each backoff delay in turn, reusing the last
/// assigned subdomain as the preferred label. Returns `None` once the
/// caller has closed or every attempt has failed.
async fn reconnect_with_backoff(
    config: &AgentConfig,
    assignment: &Assignment,
    closed: &Arc<AtomicBool>,
    close_notify: &Arc<Notify>,
) -> Option<(WsStream, Assignment)> {
    for (attempt, delay_secs) in BACKOFF_SECS.iter().enumerate() {
        if closed.load(Ordering::SeqCst) {
            return None;
        }

        info!(attempt = attempt + 1, delay_secs, "reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(*delay_secs)) => {}
            _ = close_notify.notified() => return None,
        }

        if closed.load(Ordering::SeqCst) {
            return None;
        }

        match handshake(config, Some(assignment.subdomain.clone())).await {
            Ok(pair) => return Some(pair),
            Err(e) => warn!(error = %e, attempt = attempt + 1, "reconnect attempt failed"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_rewrites_http_scheme() {
        assert_eq!(
            websocket_url("http://tunnel.test.local:7070"),
            "ws://tunnel.test.local:7070/tunnel"
        );
    }

    #[test]
    fn websocket_url_rewrites_https_scheme() {
        assert_eq!(
            websocket_url("https://tunnel.test.local"),
            "wss://tunnel.test.local/tunnel"
        );
    }

    #[test]
    fn websocket_url_strips_trailing_slash() {
        assert_eq!(
            websocket_url("http://tunnel.test.local:7070/"),
            "ws://tunnel.test.local:7070/tunnel"
        );
    }

    #[test]
    fn backoff_sequence_matches_spec() {
        assert_eq!(BACKOFF_SECS, [1, 2, 4, 8, 16]);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let closed = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        let first = !closed.swap(true, Ordering::SeqCst);
        let second = !closed.swap(true, Ordering::SeqCst);
        if first {
            notify.notify_waiters();
        }
        assert!(first);
        assert!(!second);
    }
}
