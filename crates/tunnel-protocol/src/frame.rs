//! Control-channel wire format.
//!
//! Every message exchanged over a tunnel's control channel is one
//! self-delimited JSON text frame carrying this tagged union. The `type`
//! field names the discriminant; unknown or malformed frames are the
//! caller's problem to discard (see [`Frame::decode`]).

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// One complete message on the control channel.
///
/// `TunnelAssigned`, `TunnelRequest`, `TunnelError` and `Ping` flow
/// relay→agent; `TunnelResponse` and `Pong` flow agent→relay. A frame
/// observed traveling the wrong way is the receiver's responsibility to
/// ignore, not this type's to prevent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// Sent once, immediately after a successful handshake.
    TunnelAssigned { subdomain: String, url: String },
    /// One externally-received HTTP request, forwarded to the agent.
    TunnelRequest(RequestFrame),
    /// The agent's reply to a previously forwarded `TunnelRequest`.
    TunnelResponse(ResponseFrame),
    /// An out-of-band error unrelated to any single request.
    TunnelError { message: String },
    /// Heartbeat probe, relay→agent.
    Ping,
    /// Heartbeat reply, agent→relay.
    Pong,
}

/// The unit the relay sends for one externally-received HTTP request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// The unit the agent sends back once its local origin has replied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseFrame {
    pub id: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// Frame (de)serialization failure. Callers log and drop the frame; a
/// single bad frame never closes the channel (spec'd behavior).
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("body is not valid base64: {0}")]
    BadBody(#[from] base64::DecodeError),
}

impl Frame {
    /// Parses one textual frame. Returns `Err` on bad JSON; an unknown
    /// discriminant also fails to parse (serde rejects it), which the
    /// caller treats identically: log and discard, channel stays open.
    pub fn decode(text: &str) -> Result<Frame, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Renders this frame as the textual record to put on the wire.
    pub fn encode(&self) -> String {
        // A `Frame` only ever contains serializable field types, so
        // encoding cannot fail.
        serde_json::to_string(self).expect("frame contains only serializable fields")
    }
}

/// Encodes an optional raw body as the wire's base64-or-null representation.
///
/// A zero-length body and an absent body are indistinguishable on the
/// wire: both encode to `None` (JSON `null`), per spec.
pub fn encode_body(raw: &[u8]) -> Option<String> {
    if raw.is_empty() {
        None
    } else {
        Some(BASE64.encode(raw))
    }
}

/// Decodes the wire's base64-or-null body representation back to raw bytes.
/// A `None` body decodes to an empty byte vector.
pub fn decode_body(encoded: &Option<String>) -> Result<Vec<u8>, FrameError> {
    match encoded {
        Some(s) => Ok(BASE64.decode(s)?),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_assigned_round_trips() {
        let frame = Frame::TunnelAssigned {
            subdomain: "abc12345".into(),
            url: "https://abc12345.tunnel.test.local".into(),
        };
        let text = frame.encode();
        assert!(text.contains("\"type\":\"tunnel-assigned\""));
        assert_eq!(Frame::decode(&text).unwrap(), frame);
    }

    #[test]
    fn ping_pong_have_no_payload() {
        assert_eq!(Frame::Ping.encode(), r#"{"type":"ping"}"#);
        assert_eq!(Frame::Pong.encode(), r#"{"type":"pong"}"#);
        assert_eq!(Frame::decode(r#"{"type":"ping"}"#).unwrap(), Frame::Ping);
    }

    #[test]
    fn unknown_discriminant_fails_to_parse() {
        assert!(Frame::decode(r#"{"type":"not-a-real-frame"}"#).is_err());
    }

    #[test]
    fn garbage_fails_to_parse() {
        assert!(Frame::decode("not json at all").is_err());
    }

    #[test]
    fn request_frame_round_trips_with_body() {
        let frame = Frame::TunnelRequest(RequestFrame {
            id: "c0ffee".into(),
            method: "POST".into(),
            path: "/echo".into(),
            headers: HashMap::from([("content-type".into(), "application/json".into())]),
            body: encode_body(br#"{"hello":"world"}"#),
        });
        let text = frame.encode();
        let decoded = Frame::decode(&text).unwrap();
        assert_eq!(decoded, frame);
        if let Frame::TunnelRequest(req) = decoded {
            assert_eq!(decode_body(&req.body).unwrap(), br#"{"hello":"world"}"#);
        } else {
            panic!("expected TunnelRequest");
        }
    }

    #[test]
    fn empty_body_encodes_to_null_not_empty_string() {
        assert_eq!(encode_body(b""), None);
        assert_eq!(decode_body(&None).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn response_frame_round_trips() {
        let frame = Frame::TunnelResponse(ResponseFrame {
            id: "abc".into(),
            status: 200,
            headers: HashMap::new(),
            body: None,
        });
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn tunnel_error_round_trips() {
        let frame = Frame::TunnelError {
            message: "origin unreachable".into(),
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }
}
