//! Turns one `RequestFrame` into an outbound call against the local
//! origin and a `ResponseFrame` to send back (spec §4.6).

use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::json;
use tracing::warn;
use tunnel_protocol::{decode_body, encode_body, RequestFrame, ResponseFrame};

/// Executes `request` against `http://<local_host>:<local_port><path>` and
/// builds the matching response frame. Never returns `Err`: an origin
/// failure is translated into a 502 response frame, per spec §4.6.
pub async fn forward_request(
    client: &reqwest::Client,
    local_host: &str,
    local_port: u16,
    request: RequestFrame,
) -> ResponseFrame {
    let id = request.id.clone();
    let url = format!("http://{local_host}:{local_port}{}", request.path);

    let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
        Ok(m) => m,
        Err(_) => return origin_error(id, &format!("unsupported method '{}'", request.method)),
    };

    let body = match decode_body(&request.body) {
        Ok(bytes) => bytes,
        Err(e) => return origin_error(id, &format!("could not decode request body: {e}")),
    };

    let mut builder = client
        .request(method, &url)
        .header(reqwest::header::HOST, format!("{local_host}:{local_port}"))
        .body(body);
    for (name, value) in outbound_headers(&request.headers) {
        builder = builder.header(name, value);
    }

    match builder.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let headers = flatten_headers(response.headers());
            let body = match response.bytes().await {
                Ok(b) => b.to_vec(),
                Err(e) => {
                    warn!(error = %e, "failed reading origin response body");
                    Vec::new()
                }
            };
            ResponseFrame {
                id,
                status,
                headers,
                body: encode_body(&body),
            }
        }
        Err(e) => origin_error(id, &e.to_string()),
    }
}

fn origin_error(id: String, message: &str) -> ResponseFrame {
    let body = json!({ "error": message }).to_string().into_bytes();
    ResponseFrame {
        id,
        status: 502,
        headers: HashMap::from([("content-type".to_string(), "application/json".to_string())]),
        body: encode_body(&body),
    }
}

/// Rebuilds the outbound header set from the frame's flattened map,
/// stripping hop-by-hop `connection`/`upgrade` (spec §4.6); `host` is set
/// separately by the caller so it always reflects the local origin.
fn outbound_headers(headers: &HashMap<String, String>) -> Vec<(HeaderName, HeaderValue)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            lower != "host" && lower != "connection" && lower != "upgrade"
        })
        .filter_map(|(name, value)| {
            match (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
                (Ok(n), Ok(v)) => Some((n, v)),
                _ => None,
            }
        })
        .collect()
}

/// Flattens a `reqwest` response header map into the wire's
/// `string -> string` shape, joining repeated header names with `", "`.
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
