//! Public HTTP ingress: the operational surface (`/health`, `/`) and the
//! per-subdomain proxy that turns one external HTTP request into a
//! [`RequestFrame`], waits for the matching [`ResponseFrame`], and writes
//! the reply back (spec §4.3, §4.4).

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;
use tunnel_protocol::{decode_body, encode_body, Frame, RequestFrame};
use uuid::Uuid;

use crate::state::{PendingOutcome, PendingRequest, SharedState};

/// Hard cap on an ingress request body (spec §5).
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
/// How long the relay waits for a `tunnel-response` before giving up (spec §5).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Handles every HTTP request that isn't the `/tunnel` upgrade.
pub async fn ingress(
    State(state): State<Arc<SharedState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let host = extract_host(&headers);
    let subdomain = resolve_subdomain(&host, &state.config.base_domain);

    let Some(subdomain) = subdomain else {
        return operational_surface(&state, uri.path());
    };

    let Some(tunnel) = state.tunnels.get(&subdomain) else {
        return (
            StatusCode::NOT_FOUND,
            axum::Json(json!({
                "error": format!("no tunnel registered for subdomain '{subdomain}'"),
                "subdomain": subdomain,
            })),
        )
            .into_response();
    };
    let tx = tunnel.tx.clone();
    drop(tunnel);

    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return too_large();
        }
    };

    let id = Uuid::new_v4().to_string();
    let request = RequestFrame {
        id: id.clone(),
        method: method.to_string(),
        path: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        headers: flatten_headers(&headers),
        body: encode_body(&body_bytes),
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    state.pending.insert(
        id.clone(),
        PendingRequest {
            tunnel_id: subdomain.clone(),
            reply: reply_tx,
        },
    );

    if tx.send(Frame::TunnelRequest(request)).is_err() {
        state.pending.remove(&id);
        state.tunnels.remove(&subdomain);
        return gateway_closed();
    }

    await_reply(&state, id, reply_rx).await
}

/// Waits for the matching `tunnel-response` or the 30s pending-request
/// timeout, whichever comes first, and removes the pending entry on
/// either path (spec §4.3 step 4, §5). Factored out of [`ingress`] so the
/// timeout race can be exercised without a full HTTP request.
async fn await_reply(
    state: &SharedState,
    id: String,
    reply_rx: oneshot::Receiver<PendingOutcome>,
) -> Response {
    tokio::select! {
        outcome = reply_rx => match outcome {
            Ok(PendingOutcome::Response(response)) => build_response(response),
            Ok(PendingOutcome::ShuttingDown) => shutting_down(),
            Err(_) => gateway_closed(),
        },
        _ = tokio::time::sleep(REQUEST_TIMEOUT) => {
            state.pending.remove(&id);
            gateway_timeout()
        }
    }
}

fn build_response(response: tunnel_protocol::ResponseFrame) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match decode_body(&response.body) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "agent sent an unparsable response body");
            Vec::new()
        }
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `/health` and the plain-text banner served on the base domain, and as
/// the fallback when the Host header doesn't resolve to any subdomain of
/// the base domain at all (spec §4.3).
fn operational_surface(state: &SharedState, path: &str) -> Response {
    if path == "/health" {
        return axum::Json(json!({
            "status": "ok",
            "tunnels": state.tunnel_count(),
            "maxTunnels": state.config.max_tunnels,
        }))
        .into_response();
    }
    "tunnel relay: point a subdomain request here to reach your agent\n".into_response()
}

fn too_large() -> Response {
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        [(axum::http::header::CONNECTION, "close")],
        axum::Json(json!({ "error": "request body exceeds the 10 MiB limit" })),
    )
        .into_response()
}

fn gateway_closed() -> Response {
    (
        StatusCode::BAD_GATEWAY,
        axum::Json(json!({ "error": "tunnel closed" })),
    )
        .into_response()
}

fn gateway_timeout() -> Response {
    (
        StatusCode::GATEWAY_TIMEOUT,
        axum::Json(json!({ "error": "agent did not respond in time" })),
    )
        .into_response()
}

fn shutting_down() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "Server shutting down").into_response()
}

/// Strips any port suffix from the Host header and lowercases it.
fn extract_host(headers: &HeaderMap) -> String {
    let raw = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    match raw.rsplit_once(':') {
        Some((host, _port)) => host,
        None => raw,
    }
    .to_ascii_lowercase()
}

/// Returns `Some(subdomain)` when `host` is `<subdomain>.<base_domain>`;
/// `None` when the host is the base domain itself, empty, or otherwise
/// unrelated to it (spec §4.3: all three are "no subdomain").
fn resolve_subdomain(host: &str, base_domain: &str) -> Option<String> {
    if host.is_empty() || host == base_domain {
        return None;
    }
    let suffix = format!(".{base_domain}");
    host.strip_suffix(&suffix)
        .filter(|sub| !sub.is_empty())
        .map(str::to_string)
}

/// Flattens a header map into the wire's `string -> string` shape,
/// joining repeated header names with `", "`.
fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let value = match value.to_str() {
            Ok(v) => v,
            Err(_) => continue,
        };
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}
