//! # Tunnel Relay
//!
//! The publicly reachable half of a reverse-tunnel pair. Terminates
//! plain HTTP on one port and serves two traffic classes on it: ordinary
//! proxied HTTP requests, dispatched by Host header to a tunnel's
//! subdomain, and the `/tunnel` upgrade that becomes one agent's
//! duplex control channel.
//!
//! ## Modules
//!
//! - [`config`]   — `RelayConfig` and its environment loader
//! - [`state`]    — shared registries: tunnels, pending requests
//! - [`handlers`] — control-channel handshake, lifecycle, heartbeat
//! - [`ingress`]  — public HTTP surface: health/banner + the proxy
//! - [`error`]    — the relay's error type

mod config;
mod error;
mod handlers;
mod ingress;
mod state;

use axum::{routing::get, Router};
use tracing::info;

use crate::config::RelayConfig;
use crate::state::SharedState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_relay=info".into()),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "fatal startup failure");
        std::process::exit(1);
    }
}

async fn run() -> error::Result<()> {
    let config = RelayConfig::from_env()?;
    let addr = config.listen_addr;
    let max_tunnels = config.max_tunnels;
    let state = SharedState::new(config);

    let app = Router::new()
        .route("/tunnel", get(handlers::tunnel_upgrade))
        .fallback(ingress::ingress)
        .with_state(state.clone());

    info!(%addr, max_tunnels, "relay listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

/// Waits for Ctrl+C, then drains in-flight state per spec §4.5: every
/// heartbeat is cancelled, every control channel is closed, and the
/// pending-request table is woken with a 503 before `axum::serve` stops
/// accepting new connections and returns.
async fn shutdown_signal(state: std::sync::Arc<SharedState>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down: draining tunnels and pending requests");
    state.drain_pending_for_shutdown();
    state.close_all_tunnels();
}
