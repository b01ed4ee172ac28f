//! Serializable session-state snapshot.
//!
//! The relay can describe its live state as plain data for operators
//! (logged on shutdown) and for a future state-transfer surface.

use serde::Serialize;

/// One session as seen by the relay.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: u32,
    pub client_count: usize,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
}

/// Point-in-time relay state.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RelaySnapshot {
    pub sessions: Vec<SessionSummary>,
    pub pending_connections: usize,
    pub rate_limiters: usize,
}

impl RelaySnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}
