//! Huddle relay - payload-agnostic UDP router for game sessions.
//!
//! The relay:
//! 1. Validates headers and enforces per-endpoint rate limits
//! 2. Routes core handshake traffic and forwards game packets blind
//! 3. Never inspects game payloads (type codes >= 0x10)

#![forbid(unsafe_code)]

pub mod export;
pub mod rate_limit;
pub mod server;
pub mod session;

pub use export::RelaySnapshot;
pub use server::{run_relay, RelayServer};
