//! Relay-wide error type.
//!
//! Mirrors the pack's SSH tunnel server (`TunnelError`): one variant per
//! failure class, `#[from]` conversions for the I/O the relay can't avoid
//! touching, and a `Display` a human reads directly in logs.

use std::net::AddrParseError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("invalid listen address: {0}")]
    Addr(#[from] AddrParseError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
