//! Connected-client bookkeeping: id allocation and reconnect tokens.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use huddle_common::helpers::constant_time_eq;
use nexus_core::{RECONNECT_TOKEN_LEN, MAX_CLIENT_ID, MIN_CLIENT_ID};

/// What the host remembers about one client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub reconnect_token: [u8; RECONNECT_TOKEN_LEN],
    pub connected_at: Instant,
    pub last_ping: Instant,
    /// Disconnected clients are retained until their token expires so a
    /// reconnect can reclaim the id.
    pub disconnected: bool,
}

/// Registry of client ids 2..=254.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: BTreeMap<u8, ClientInfo>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest unused id in the assignable range.
    pub fn allocate_id(&self) -> Option<u8> {
        (MIN_CLIENT_ID..=MAX_CLIENT_ID).find(|id| !self.clients.contains_key(id))
    }

    pub fn insert(&mut self, id: u8, info: ClientInfo) {
        self.clients.insert(id, info);
    }

    pub fn get(&self, id: u8) -> Option<&ClientInfo> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut ClientInfo> {
        self.clients.get_mut(&id)
    }

    /// Clients currently part of the session (not counting retained
    /// disconnected records).
    pub fn active_count(&self) -> usize {
        self.clients.values().filter(|c| !c.disconnected).count()
    }

    /// Ids of live clients, for broadcast sends.
    pub fn active_ids(&self) -> Vec<u8> {
        self.clients
            .iter()
            .filter(|(_, c)| !c.disconnected)
            .map(|(id, _)| *id)
            .collect()
    }

    /// A live client with this name that has not completed its handshake
    /// yet; used to fold connect retries into the original admission.
    pub fn find_active_by_name(&self, name: &str) -> Option<u8> {
        self.clients
            .iter()
            .find(|(_, c)| !c.disconnected && c.name == name)
            .map(|(id, _)| *id)
    }

    pub fn touch_ping(&mut self, id: u8, now: Instant) -> bool {
        match self.clients.get_mut(&id) {
            Some(info) if !info.disconnected => {
                info.last_ping = now;
                true
            }
            _ => false,
        }
    }

    /// Mark a client gone but keep the record for reconnection. The token
    /// window is re-anchored so its budget runs from departure.
    pub fn mark_disconnected(&mut self, id: u8, now: Instant) -> bool {
        match self.clients.get_mut(&id) {
            Some(info) if !info.disconnected => {
                info.disconnected = true;
                info.connected_at = now;
                true
            }
            _ => false,
        }
    }

    /// Token check for a reconnect attempt: the record must exist, the
    /// token must match (compared in constant time), and the token window
    /// must still be open.
    pub fn validate_token(
        &self,
        id: u8,
        token: &[u8; RECONNECT_TOKEN_LEN],
        now: Instant,
        token_timeout: Duration,
    ) -> bool {
        match self.clients.get(&id) {
            Some(info) => {
                constant_time_eq(&info.reconnect_token, token)
                    && now < info.connected_at + token_timeout
            }
            None => false,
        }
    }

    /// Bring a disconnected record back to life under the same id with a
    /// fresh token window.
    pub fn revive(&mut self, id: u8, now: Instant) -> bool {
        match self.clients.get_mut(&id) {
            Some(info) => {
                info.disconnected = false;
                info.connected_at = now;
                info.last_ping = now;
                true
            }
            None => false,
        }
    }

    /// Forget a record entirely.
    pub fn remove(&mut self, id: u8) -> Option<ClientInfo> {
        self.clients.remove(&id)
    }

    /// Drop disconnected records whose token window has closed. Returns
    /// the expired ids.
    pub fn expire_tokens(&mut self, now: Instant, token_timeout: Duration) -> Vec<u8> {
        let expired: Vec<u8> = self
            .clients
            .iter()
            .filter(|(_, c)| c.disconnected && now >= c.connected_at + token_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.clients.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(now: Instant) -> ClientInfo {
        ClientInfo {
            name: "Alice".into(),
            reconnect_token: [7u8; RECONNECT_TOKEN_LEN],
            connected_at: now,
            last_ping: now,
            disconnected: false,
        }
    }

    #[test]
    fn allocation_starts_at_two_and_fills_gaps() {
        let now = Instant::now();
        let mut registry = ClientRegistry::new();
        assert_eq!(registry.allocate_id(), Some(2));
        registry.insert(2, info(now));
        registry.insert(3, info(now));
        assert_eq!(registry.allocate_id(), Some(4));

        registry.remove(2);
        assert_eq!(registry.allocate_id(), Some(2));
    }

    #[test]
    fn id_space_exhaustion() {
        let now = Instant::now();
        let mut registry = ClientRegistry::new();
        for id in MIN_CLIENT_ID..=MAX_CLIENT_ID {
            registry.insert(id, info(now));
        }
        assert_eq!(registry.allocate_id(), None);
    }

    #[test]
    fn token_validates_until_the_window_closes() {
        let now = Instant::now();
        let mut registry = ClientRegistry::new();
        registry.insert(2, info(now));
        registry.mark_disconnected(2, now);

        let timeout = Duration::from_secs(300);
        let token = [7u8; RECONNECT_TOKEN_LEN];
        assert!(registry.validate_token(2, &token, now + Duration::from_secs(60), timeout));
        assert!(!registry.validate_token(2, &token, now + Duration::from_secs(300), timeout));
        assert!(!registry.validate_token(2, &[8u8; RECONNECT_TOKEN_LEN], now, timeout));
        assert!(!registry.validate_token(9, &token, now, timeout));
    }

    #[test]
    fn expire_drops_only_closed_disconnected_records() {
        let now = Instant::now();
        let mut registry = ClientRegistry::new();
        registry.insert(2, info(now));
        registry.insert(3, info(now));
        registry.mark_disconnected(2, now);

        let timeout = Duration::from_secs(300);
        assert!(registry
            .expire_tokens(now + Duration::from_secs(10), timeout)
            .is_empty());
        let expired = registry.expire_tokens(now + Duration::from_secs(301), timeout);
        assert_eq!(expired, vec![2]);
        assert!(registry.get(3).is_some());
    }

    #[test]
    fn revive_reopens_the_window() {
        let t0 = Instant::now();
        let mut registry = ClientRegistry::new();
        registry.insert(2, info(t0));
        registry.mark_disconnected(2, t0);

        let t1 = t0 + Duration::from_secs(200);
        assert!(registry.revive(2, t1));
        let timeout = Duration::from_secs(300);
        let token = [7u8; RECONNECT_TOKEN_LEN];
        // Window now runs from t1, not t0.
        assert!(registry.validate_token(2, &token, t0 + Duration::from_secs(400), timeout));
        assert_eq!(registry.active_count(), 1);
    }
}
