//! Agent configuration record (spec §3 `AgentConfig`, §6 env surface).
//!
//! As with the relay, `from_env` is a convenience for the binary entry
//! point; [`crate::connect::connect`] only ever consumes an already-built
//! [`AgentConfig`].

use crate::error::{AgentError, Result};

/// Immutable, validated startup configuration for the agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub relay_url: String,
    pub secret: String,
    pub preferred_subdomain: Option<String>,
    pub local_host: String,
    pub local_port: u16,
}

impl AgentConfig {
    /// Builds a config from the documented `TUNNEL_*` environment
    /// variables. A missing secret or local port is a fatal
    /// misconfiguration (spec §6).
    pub fn from_env() -> Result<Self> {
        let relay_url = std::env::var("TUNNEL_RELAY_URL")
            .map_err(|_| AgentError::Config("TUNNEL_RELAY_URL is required".into()))?;

        let secret = std::env::var("TUNNEL_SECRET")
            .map_err(|_| AgentError::Config("TUNNEL_SECRET is required".into()))?;
        if secret.is_empty() {
            return Err(AgentError::Config("TUNNEL_SECRET must not be empty".into()));
        }

        let preferred_subdomain = std::env::var("TUNNEL_SUBDOMAIN")
            .ok()
            .filter(|s| !s.is_empty());

        let local_host =
            std::env::var("TUNNEL_LOCAL_HOST").unwrap_or_else(|_| "localhost".to_string());

        let local_port: u16 = std::env::var("TUNNEL_LOCAL_PORT")
            .map_err(|_| AgentError::Config("TUNNEL_LOCAL_PORT is required".into()))?
            .parse()
            .map_err(|_| AgentError::Config("TUNNEL_LOCAL_PORT is not a valid port".into()))?;

        Ok(AgentConfig {
            relay_url,
            secret,
            preferred_subdomain,
            local_host,
            local_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AgentConfig {
        AgentConfig {
            relay_url: "http://tunnel.test.local:7070".to_string(),
            secret: "sk_test_key_123".to_string(),
            preferred_subdomain: None,
            local_host: "localhost".to_string(),
            local_port: 3000,
        }
    }

    #[test]
    fn accepts_hand_built_config() {
        let cfg = base();
        assert_eq!(cfg.local_port, 3000);
        assert!(cfg.preferred_subdomain.is_none());
    }
}
