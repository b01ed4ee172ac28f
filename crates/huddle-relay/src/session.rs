//! Relay session bookkeeping.
//!
//! A session is one host plus the clients it has accepted. The relay only
//! stores routing facts: which endpoint is the host, which endpoint owns
//! which client id, and when the session last saw a valid packet. Pending
//! endpoints are connect applicants the host has not answered yet.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use nexus_core::HOST_ID;
use thiserror::Error;

/// Routing state for one session.
#[derive(Debug)]
pub struct Session {
    pub session_id: u32,
    pub host_endpoint: SocketAddr,
    /// client id -> endpoint. The host (id 1) is not stored here.
    pub clients: HashMap<u8, SocketAddr>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
}

impl Session {
    pub fn new(session_id: u32, host_endpoint: SocketAddr, now: Instant) -> Self {
        Self {
            session_id,
            host_endpoint,
            clients: HashMap::new(),
            created_at: now,
            last_activity: now,
            packets_forwarded: 0,
            bytes_forwarded: 0,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Endpoint bound to a destination id, if any. Id 1 is the host.
    pub fn endpoint_of(&self, id: u8) -> Option<SocketAddr> {
        if id == HOST_ID {
            Some(self.host_endpoint)
        } else {
            self.clients.get(&id).copied()
        }
    }

    /// Which participant id an endpoint is bound to.
    pub fn id_of(&self, endpoint: SocketAddr) -> Option<u8> {
        if endpoint == self.host_endpoint {
            return Some(HOST_ID);
        }
        self.clients
            .iter()
            .find(|(_, addr)| **addr == endpoint)
            .map(|(id, _)| *id)
    }

    pub fn contains_endpoint(&self, endpoint: SocketAddr) -> bool {
        self.id_of(endpoint).is_some()
    }

    /// Every participant endpoint except `sender` (broadcast targets).
    pub fn participants_except(&self, sender: SocketAddr) -> Vec<SocketAddr> {
        let mut out = Vec::with_capacity(self.clients.len() + 1);
        if self.host_endpoint != sender {
            out.push(self.host_endpoint);
        }
        for addr in self.clients.values() {
            if *addr != sender {
                out.push(*addr);
            }
        }
        out
    }

    pub fn record_forward(&mut self, bytes: usize, now: Instant) {
        self.packets_forwarded += 1;
        self.bytes_forwarded += bytes as u64;
        self.last_activity = now;
    }
}

/// Session management errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session limit reached")]
    SessionLimitReached,
    #[error("session is full")]
    SessionFull,
    #[error("session not found")]
    NotFound,
    #[error("registration from non-host endpoint")]
    HostMismatch,
    #[error("pending connection limit reached")]
    PendingLimitReached,
}

/// What periodic cleanup removed, for logging and client notification.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Sessions dropped for inactivity, with their surviving client
    /// endpoints so the caller can notify them.
    pub expired_sessions: Vec<(u32, Vec<SocketAddr>)>,
    pub expired_pending: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.expired_sessions.is_empty() && self.expired_pending == 0
    }
}

/// All live sessions plus unmatched pending applicants.
#[derive(Debug)]
pub struct SessionPool {
    sessions: HashMap<u32, Session>,
    /// applicant endpoint -> (target session, first seen).
    pending: HashMap<SocketAddr, (u32, Instant)>,
    max_sessions: usize,
    max_clients_per_session: usize,
    max_pending: usize,
}

impl SessionPool {
    pub fn new(max_sessions: usize, max_clients_per_session: usize, max_pending: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            pending: HashMap::new(),
            max_sessions,
            max_clients_per_session,
            max_pending,
        }
    }

    /// Create a session for a registering host. Re-registration from the
    /// same endpoint refreshes activity; from a different endpoint it is
    /// rejected.
    pub fn register_host(
        &mut self,
        session_id: u32,
        host_endpoint: SocketAddr,
        now: Instant,
    ) -> Result<&mut Session, SessionError> {
        if let Some(session) = self.sessions.get(&session_id) {
            if session.host_endpoint != host_endpoint {
                return Err(SessionError::HostMismatch);
            }
            let session = self
                .sessions
                .get_mut(&session_id)
                .ok_or(SessionError::NotFound)?;
            session.touch(now);
            return Ok(session);
        }

        if self.sessions.len() >= self.max_sessions {
            return Err(SessionError::SessionLimitReached);
        }
        Ok(self
            .sessions
            .entry(session_id)
            .or_insert_with(|| Session::new(session_id, host_endpoint, now)))
    }

    pub fn get(&self, session_id: u32) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    pub fn get_mut(&mut self, session_id: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&session_id)
    }

    /// Find the session an endpoint participates in.
    pub fn session_of_endpoint(&self, endpoint: SocketAddr) -> Option<u32> {
        self.sessions
            .values()
            .find(|s| s.contains_endpoint(endpoint))
            .map(|s| s.session_id)
    }

    /// Bind a client id to an endpoint, enforcing the per-session cap.
    pub fn bind_client(
        &mut self,
        session_id: u32,
        client_id: u8,
        endpoint: SocketAddr,
        now: Instant,
    ) -> Result<(), SessionError> {
        let max = self.max_clients_per_session;
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(SessionError::NotFound)?;
        if !session.clients.contains_key(&client_id) && session.clients.len() >= max {
            return Err(SessionError::SessionFull);
        }
        session.clients.insert(client_id, endpoint);
        session.touch(now);
        Ok(())
    }

    /// Remove whichever participant owns `endpoint`. Returns the session id,
    /// the removed participant id, and the endpoints that remain (for
    /// notification). A departing host tears the whole session down.
    pub fn remove_endpoint(
        &mut self,
        endpoint: SocketAddr,
        now: Instant,
    ) -> Option<(u32, u8, Vec<SocketAddr>)> {
        let session_id = self.session_of_endpoint(endpoint)?;
        let session = self.sessions.get_mut(&session_id)?;
        let id = session.id_of(endpoint)?;

        if id == HOST_ID {
            let survivors = session.participants_except(endpoint);
            self.sessions.remove(&session_id);
            return Some((session_id, HOST_ID, survivors));
        }

        session.clients.remove(&id);
        session.touch(now);
        let survivors = session.participants_except(endpoint);
        Some((session_id, id, survivors))
    }

    /// Mark a connect applicant, bounded by `max_pending`. Re-marking an
    /// already-pending endpoint refreshes its target but not its age.
    pub fn mark_pending(
        &mut self,
        endpoint: SocketAddr,
        session_id: u32,
        now: Instant,
    ) -> Result<(), SessionError> {
        if let Some(entry) = self.pending.get_mut(&endpoint) {
            entry.0 = session_id;
            return Ok(());
        }
        if self.pending.len() >= self.max_pending {
            return Err(SessionError::PendingLimitReached);
        }
        self.pending.insert(endpoint, (session_id, now));
        Ok(())
    }

    /// Oldest pending applicant for a session, FIFO. The wire format does
    /// not echo the applicant in CONNECT_ACCEPT/DENY, so the relay answers
    /// handshakes in arrival order.
    pub fn oldest_pending_for(&self, session_id: u32) -> Option<SocketAddr> {
        self.pending
            .iter()
            .filter(|(_, (target, _))| *target == session_id)
            .min_by_key(|(_, (_, since))| *since)
            .map(|(addr, _)| *addr)
    }

    pub fn clear_pending(&mut self, endpoint: SocketAddr) {
        self.pending.remove(&endpoint);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Drop idle sessions and stale pending endpoints.
    pub fn cleanup(
        &mut self,
        now: Instant,
        client_timeout: Duration,
        pending_timeout: Duration,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();

        let expired: Vec<u32> = self
            .sessions
            .values()
            .filter(|s| now.duration_since(s.last_activity) > client_timeout)
            .map(|s| s.session_id)
            .collect();
        for id in expired {
            if let Some(session) = self.sessions.remove(&id) {
                let clients = session.clients.values().copied().collect();
                report.expired_sessions.push((id, clients));
            }
        }

        let before = self.pending.len();
        self.pending
            .retain(|_, (_, since)| now.duration_since(*since) <= pending_timeout);
        report.expired_pending = before - self.pending.len();

        report
    }
}
