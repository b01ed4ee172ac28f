//! Per-endpoint token-bucket rate limiting with flood detection.
//!
//! Each remote endpoint gets a bucket whose capacity and refill rate equal
//! `max_packets_per_second`. Refill happens in whole intervals so a quiet
//! endpoint cannot bank more than one capacity's worth of tokens. Repeated
//! denials inside the sliding flood window throttle the offender by
//! dividing its effective capacity for the remainder of the window.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use huddle_common::config::RateLimitConfig;
use tracing::debug;

/// Dynamic state for one remote endpoint.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: u32,
    last_refill: Instant,
    last_seen: Instant,
    violations: u32,
    window_start: Option<Instant>,
    throttled_until: Option<Instant>,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: config.max_packets_per_second,
            last_refill: now,
            last_seen: now,
            violations: 0,
            window_start: None,
            throttled_until: None,
        }
    }

    /// Capacity currently in force, accounting for an active throttle.
    fn effective_capacity(&self, config: &RateLimitConfig, now: Instant) -> u32 {
        match self.throttled_until {
            Some(until) if now < until => {
                (config.max_packets_per_second / config.throttle_penalty_divisor).max(1)
            }
            _ => config.max_packets_per_second,
        }
    }

    /// Consume one token if available. A denial counts toward the flood
    /// window and may arm the throttle.
    pub fn allow(&mut self, config: &RateLimitConfig, now: Instant) -> bool {
        self.last_seen = now;

        let capacity = self.effective_capacity(config, now);
        let interval = config.token_refill_interval();
        let elapsed = now.duration_since(self.last_refill);
        if interval > Duration::ZERO && elapsed >= interval {
            let intervals = (elapsed.as_nanos() / interval.as_nanos()) as u32;
            let refill = intervals.saturating_mul(config.max_packets_per_second);
            self.tokens = self.tokens.saturating_add(refill).min(capacity);
            self.last_refill += interval * intervals;
        }
        // A freshly armed throttle also claws back banked tokens.
        self.tokens = self.tokens.min(capacity);

        if self.tokens > 0 {
            self.tokens -= 1;
            return true;
        }

        self.record_violation(config, now);
        false
    }

    fn record_violation(&mut self, config: &RateLimitConfig, now: Instant) {
        if matches!(self.throttled_until, Some(until) if now >= until) {
            self.throttled_until = None;
            self.violations = 0;
            self.window_start = None;
        }

        let window = config.flood_window();
        match self.window_start {
            Some(start) if now.duration_since(start) <= window => {
                self.violations += 1;
            }
            _ => {
                // New sliding window.
                self.window_start = Some(now);
                self.violations = 1;
            }
        }

        if self.violations >= config.flood_threshold && self.throttled_until.is_none() {
            let until = self
                .window_start
                .map(|start| start + window)
                .unwrap_or(now + window);
            self.throttled_until = Some(until);
            debug!(violations = self.violations, "flood threshold crossed, throttling");
        }
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn is_throttled(&self, now: Instant) -> bool {
        matches!(self.throttled_until, Some(until) if now < until)
    }
}

/// Bounded registry of per-endpoint buckets.
#[derive(Debug)]
pub struct RateLimiterMap {
    buckets: HashMap<SocketAddr, TokenBucket>,
    config: RateLimitConfig,
}

impl RateLimiterMap {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: HashMap::new(),
            config,
        }
    }

    /// Check one packet from `addr`. Creates the bucket on first sight,
    /// evicting the longest-idle entry if the registry is full.
    pub fn check(&mut self, addr: SocketAddr, now: Instant) -> bool {
        if !self.buckets.contains_key(&addr) {
            if self.buckets.len() >= self.config.max_rate_limiters {
                self.evict_oldest();
            }
            self.buckets
                .insert(addr, TokenBucket::new(&self.config, now));
        }

        match self.buckets.get_mut(&addr) {
            Some(bucket) => bucket.allow(&self.config, now),
            None => false,
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .buckets
            .iter()
            .min_by_key(|(_, bucket)| bucket.last_seen())
            .map(|(addr, _)| *addr);
        if let Some(addr) = oldest {
            self.buckets.remove(&addr);
        }
    }

    /// Reclaim entries that have been silent past `idle_timeout`.
    pub fn cleanup(&mut self, now: Instant, idle_timeout: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_seen()) <= idle_timeout);
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
