//! Agent-wide error type. Mirrors `tunnel_relay::RelayError`: one variant
//! per failure class, `#[from]` conversions for the transport errors the
//! agent can't avoid touching.

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to connect to relay: {0}")]
    ConnectFailed(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("relay rejected the handshake: {0}")]
    AuthRejected(String),

    #[error("relay closed the channel before sending tunnel-assigned")]
    NoAssignment,
}

pub type Result<T> = std::result::Result<T, AgentError>;
