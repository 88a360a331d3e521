//! # Tunnel Agent
//!
//! The privately-reachable half of a reverse-tunnel pair. Holds the
//! outbound control channel to a relay and proxies each forwarded
//! request into a local HTTP origin.

use tunnel_agent::{AgentConfig, AgentEvent, CloseReason};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_agent=info".into()),
        )
        .init();

    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "fatal configuration error");
            std::process::exit(1);
        }
    };

    let mut agent = match tunnel_agent::Agent::connect(config).await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to relay");
            std::process::exit(1);
        }
    };

    let assignment = agent.assignment();
    tracing::info!(url = %assignment.url, subdomain = %assignment.subdomain, "tunnel established");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("closing on operator request");
                agent.close();
            }
            event = agent.next_event() => {
                match event {
                    Some(AgentEvent::Request { method, path, status }) => {
                        tracing::info!(%method, %path, status, "forwarded");
                    }
                    Some(AgentEvent::Error(message)) => {
                        tracing::warn!(%message, "agent error");
                    }
                    Some(AgentEvent::Close(CloseReason::Requested)) => {
                        tracing::info!("closed");
                        return;
                    }
                    Some(AgentEvent::Close(CloseReason::ReconnectExhausted)) => {
                        tracing::error!("reconnect attempts exhausted, giving up");
                        std::process::exit(1);
                    }
                    None => return,
                }
            }
        }
    }
}
