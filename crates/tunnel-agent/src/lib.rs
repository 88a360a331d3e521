//! Agent-side library: connect/handshake, the receive loop, local-origin
//! forwarding, and reconnection with backoff (spec §4.6, §4.7).
//!
//! The binary in `main.rs` is a thin `AgentConfig::from_env` + event-loop
//! shell around [`Agent::connect`]; everything else lives here so it can
//! be exercised with hand-built configuration in tests.

pub mod config;
pub mod connect;
pub mod error;
pub mod forward;

pub use config::AgentConfig;
pub use connect::{Agent, AgentEvent, Assignment, CloseReason};
pub use error::{AgentError, Result};
