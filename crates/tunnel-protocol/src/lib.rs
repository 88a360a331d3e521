//! Wire types and label rules shared by the relay and the agent.
//!
//! Kept dependency-light and I/O-free so both peers can depend on one
//! definition of "what a frame looks like" without pulling in a network
//! stack.

pub mod frame;
pub mod subdomain;

pub use frame::{decode_body, encode_body, Frame, FrameError, RequestFrame, ResponseFrame};
