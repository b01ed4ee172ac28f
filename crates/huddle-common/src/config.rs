//! Central configuration for all Huddle components.
//!
//! Every tunable named by the protocol lives here with its normative
//! default. Durations are stored as milliseconds so a JSON config file can
//! set them directly; accessor methods hand out [`Duration`] values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration shared by relay, host, and client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Receive buffer size in bytes. Sized to a full UDP datagram so a
    /// maximum-size packet cannot be silently truncated.
    pub buffer_size: usize,

    pub relay: RelayConfig,
    pub rate_limit: RateLimitConfig,
    pub host: HostConfig,
    pub client: ClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: 65_535,
            relay: RelayConfig::default(),
            rate_limit: RateLimitConfig::default(),
            host: HostConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

/// Relay-side tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// UDP port the relay listens on.
    pub port: u16,
    /// Cap on live sessions.
    pub max_total_connections: usize,
    /// Cap on clients routed per session (host excluded).
    pub max_clients_per_session: usize,
    /// Cap on unmatched pending endpoints.
    pub max_pending_connections: usize,
    /// Inactivity horizon for sessions and rate-limiter entries.
    pub client_timeout_ms: u64,
    /// How long an unmatched CONNECT_REQUEST source stays pending.
    pub pending_connection_timeout_ms: u64,
    /// Period of the cleanup tick.
    pub cleanup_interval_ms: u64,
    /// Upper bound on one loop iteration's receive wait.
    pub main_loop_sleep_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 7777,
            max_total_connections: 256,
            max_clients_per_session: 8,
            max_pending_connections: 64,
            client_timeout_ms: 30_000,
            pending_connection_timeout_ms: 10_000,
            cleanup_interval_ms: 5_000,
            main_loop_sleep_ms: 1,
        }
    }
}

impl RelayConfig {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn pending_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_connection_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn main_loop_sleep(&self) -> Duration {
        Duration::from_millis(self.main_loop_sleep_ms)
    }
}

/// Per-endpoint token-bucket tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity and per-interval refill amount.
    pub max_packets_per_second: u32,
    /// Refill interval.
    pub token_refill_interval_ms: u64,
    /// Denials within the flood window before throttling kicks in.
    pub flood_threshold: u32,
    /// Sliding window over which denials are counted.
    pub flood_window_ms: u64,
    /// Capacity divisor applied while throttled.
    pub throttle_penalty_divisor: u32,
    /// Cap on tracked endpoints.
    pub max_rate_limiters: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_packets_per_second: 100,
            token_refill_interval_ms: 1_000,
            flood_threshold: 10,
            flood_window_ms: 5_000,
            throttle_penalty_divisor: 4,
            max_rate_limiters: 1_024,
        }
    }
}

impl RateLimitConfig {
    pub fn token_refill_interval(&self) -> Duration {
        Duration::from_millis(self.token_refill_interval_ms)
    }

    pub fn flood_window(&self) -> Duration {
        Duration::from_millis(self.flood_window_ms)
    }
}

/// Host-side tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// How long to wait for an ACK before resending a reliable packet.
    pub ack_timeout_ms: u64,
    /// Resend attempts before a reliable delivery is reported failed.
    pub max_ack_retries: u32,
    /// Pause between CONNECT_ACCEPT and the reliable SESSION_CONFIG.
    pub reliability_delay_ms: u64,
    /// Lifetime of a reconnect token from the moment of connection.
    pub session_token_timeout_ms: u64,
    /// How long a stopping host drains pending reliable sends.
    pub graceful_shutdown_timeout_ms: u64,
    /// Upper bound on one loop iteration's receive wait.
    pub loop_sleep_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 2_000,
            max_ack_retries: 5,
            reliability_delay_ms: 50,
            session_token_timeout_ms: 300_000,
            graceful_shutdown_timeout_ms: 5_000,
            loop_sleep_ms: 10,
        }
    }
}

impl HostConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn reliability_delay(&self) -> Duration {
        Duration::from_millis(self.reliability_delay_ms)
    }

    pub fn session_token_timeout(&self) -> Duration {
        Duration::from_millis(self.session_token_timeout_ms)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }

    pub fn loop_sleep(&self) -> Duration {
        Duration::from_millis(self.loop_sleep_ms)
    }
}

/// Client-side tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Keepalive probe period.
    pub ping_interval_ms: u64,
    /// Silence horizon before the connection is declared dead. Also bounds
    /// the initial connect handshake.
    pub connection_timeout_ms: u64,
    /// CONNECT_REQUEST resend period while connecting.
    pub connect_retry_interval_ms: u64,
    /// First reconnect backoff delay.
    pub initial_reconnect_delay_ms: u64,
    /// Backoff ceiling.
    pub max_reconnect_delay_ms: u64,
    /// Successive failures before giving up.
    pub max_reconnect_attempts: u32,
    /// Flush wait after DISCONNECT_NOTICE on graceful close.
    pub disconnect_notice_delay_ms: u64,
    /// Upper bound on one loop iteration's receive wait.
    pub loop_sleep_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 5_000,
            connection_timeout_ms: 10_000,
            connect_retry_interval_ms: 1_000,
            initial_reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            disconnect_notice_delay_ms: 100,
            loop_sleep_ms: 10,
        }
    }
}

impl ClientConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }

    pub fn initial_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.initial_reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn disconnect_notice_delay(&self) -> Duration {
        Duration::from_millis(self.disconnect_notice_delay_ms)
    }

    pub fn loop_sleep(&self) -> Duration {
        Duration::from_millis(self.loop_sleep_ms)
    }
}

impl Config {
    /// Load a JSON config file. Missing keys fall back to defaults; the
    /// result is validated before being returned.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("{}: {e}", path.as_ref().display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values, naming the offending key.
    pub fn validate(&self) -> Result<()> {
        fn require(ok: bool, key: &str, rule: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(Error::config(format!("{key} must be {rule}")))
            }
        }

        require(
            (1_024..=65_535).contains(&self.buffer_size),
            "buffer_size",
            "between 1024 and 65535",
        )?;

        let r = &self.relay;
        require(r.port > 0, "relay.port", "non-zero")?;
        require(
            r.max_total_connections >= 1,
            "relay.max_total_connections",
            "at least 1",
        )?;
        require(
            (1..=253).contains(&r.max_clients_per_session),
            "relay.max_clients_per_session",
            "between 1 and 253",
        )?;
        require(
            r.max_pending_connections >= 1,
            "relay.max_pending_connections",
            "at least 1",
        )?;
        require(r.client_timeout_ms > 0, "relay.client_timeout_ms", "positive")?;
        require(
            r.pending_connection_timeout_ms > 0,
            "relay.pending_connection_timeout_ms",
            "positive",
        )?;
        require(
            r.cleanup_interval_ms > 0,
            "relay.cleanup_interval_ms",
            "positive",
        )?;
        require(
            r.main_loop_sleep_ms > 0,
            "relay.main_loop_sleep_ms",
            "positive",
        )?;

        let rl = &self.rate_limit;
        require(
            rl.max_packets_per_second >= 1,
            "rate_limit.max_packets_per_second",
            "at least 1",
        )?;
        require(
            rl.token_refill_interval_ms > 0,
            "rate_limit.token_refill_interval_ms",
            "positive",
        )?;
        require(
            rl.flood_threshold >= 1,
            "rate_limit.flood_threshold",
            "at least 1",
        )?;
        require(rl.flood_window_ms > 0, "rate_limit.flood_window_ms", "positive")?;
        require(
            rl.throttle_penalty_divisor >= 2,
            "rate_limit.throttle_penalty_divisor",
            "at least 2",
        )?;
        require(
            rl.max_rate_limiters >= 1,
            "rate_limit.max_rate_limiters",
            "at least 1",
        )?;

        let h = &self.host;
        require(h.ack_timeout_ms > 0, "host.ack_timeout_ms", "positive")?;
        require(
            h.session_token_timeout_ms > 0,
            "host.session_token_timeout_ms",
            "positive",
        )?;
        require(
            h.graceful_shutdown_timeout_ms > 0,
            "host.graceful_shutdown_timeout_ms",
            "positive",
        )?;
        require(h.loop_sleep_ms > 0, "host.loop_sleep_ms", "positive")?;

        let c = &self.client;
        require(c.ping_interval_ms > 0, "client.ping_interval_ms", "positive")?;
        require(
            c.connection_timeout_ms > 0,
            "client.connection_timeout_ms",
            "positive",
        )?;
        require(
            c.connect_retry_interval_ms > 0,
            "client.connect_retry_interval_ms",
            "positive",
        )?;
        require(
            c.initial_reconnect_delay_ms > 0,
            "client.initial_reconnect_delay_ms",
            "positive",
        )?;
        require(
            c.max_reconnect_delay_ms >= c.initial_reconnect_delay_ms,
            "client.max_reconnect_delay_ms",
            "at least the initial delay",
        )?;
        require(
            c.max_reconnect_attempts >= 1,
            "client.max_reconnect_attempts",
            "at least 1",
        )?;
        require(c.loop_sleep_ms > 0, "client.loop_sleep_ms", "positive")?;

        Ok(())
    }
}
