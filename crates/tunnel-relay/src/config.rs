//! Relay configuration record (spec §3 `RelayConfig`, §6 env surface).
//!
//! The loader (`from_env`) is a thin convenience for the binary entry
//! point; the rest of this crate only ever consumes the already-built
//! [`RelayConfig`] value, never the environment directly.

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::error::{RelayError, Result};

/// Default cap on simultaneously connected agents (spec §5).
pub const DEFAULT_MAX_TUNNELS: usize = 10;

/// Immutable, validated startup configuration for the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub secrets: HashSet<String>,
    pub base_domain: String,
    pub max_tunnels: usize,
}

impl RelayConfig {
    /// Builds a config from the documented `TUNNEL_*` environment
    /// variables. An empty or missing secret list is a fatal
    /// misconfiguration (spec §6).
    pub fn from_env() -> Result<Self> {
        let port: u16 = std::env::var("TUNNEL_LISTEN_PORT")
            .unwrap_or_else(|_| "7070".to_string())
            .parse()
            .map_err(|_| RelayError::Config("TUNNEL_LISTEN_PORT is not a valid port".into()))?;

        let secrets: HashSet<String> = std::env::var("TUNNEL_SECRETS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if secrets.is_empty() {
            return Err(RelayError::Config(
                "TUNNEL_SECRETS must name at least one accepted shared secret".into(),
            ));
        }

        let base_domain = std::env::var("TUNNEL_BASE_DOMAIN")
            .map_err(|_| RelayError::Config("TUNNEL_BASE_DOMAIN is required".into()))?;

        let max_tunnels = std::env::var("TUNNEL_MAX_TUNNELS")
            .ok()
            .map(|v| {
                v.parse()
                    .map_err(|_| RelayError::Config("TUNNEL_MAX_TUNNELS is not a number".into()))
            })
            .transpose()?
            .unwrap_or(DEFAULT_MAX_TUNNELS);

        Ok(RelayConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            secrets,
            base_domain,
            max_tunnels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RelayConfig {
        RelayConfig {
            listen_addr: "0.0.0.0:7070".parse().unwrap(),
            secrets: HashSet::from(["sk_test_key_123".to_string()]),
            base_domain: "tunnel.test.local".to_string(),
            max_tunnels: 10,
        }
    }

    #[test]
    fn accepts_hand_built_config() {
        let cfg = base();
        assert!(cfg.secrets.contains("sk_test_key_123"));
        assert_eq!(cfg.max_tunnels, 10);
    }
}
