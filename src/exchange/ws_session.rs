//! Venue-agnostic WebSocket session discipline: connection state machine,
//! exponential backoff with jitter, and the subscription-confirmation
//! watchdog every adapter's reader task drives its reconnect loop with.
//!
//! Generalized from the backend's Binance-specific session manager
//! (`scrapers::binance_session`) — the state names and backoff math are
//! kept, the Binance-only endpoint rotation and 24h hard-reconnect are
//! dropped since no other supported venue has that constraint.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub subscribe_confirm_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 5_000,
            backoff_max_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,
            ping_interval_ms: 20_000,
            pong_timeout_ms: 10_000,
            subscribe_confirm_timeout_ms: 10_000,
        }
    }
}

/// Connection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connecting,
    Subscribing,
    Streaming,
    Reconnecting,
    Shutdown,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Connecting => "CONNECTING",
            Self::Subscribing => "SUBSCRIBING",
            Self::Streaming => "STREAMING",
            Self::Reconnecting => "RECONNECTING",
            Self::Shutdown => "SHUTDOWN",
        };
        write!(f, "{s}")
    }
}

/// Exponential backoff with jitter, used to space reconnect attempts so a
/// mass disconnect doesn't thundering-herd the venue.
#[derive(Debug)]
pub struct BackoffCalculator {
    config: SessionConfig,
    attempt: u32,
    rng_state: u64,
}

impl BackoffCalculator {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64 | 1)
                .unwrap_or(12345),
        }
    }

    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub fn next_backoff(&mut self) -> Duration {
        let base = (self.config.backoff_base_ms as f64)
            * self.config.backoff_multiplier.powi(self.attempt as i32);
        let capped = base.min(self.config.backoff_max_ms as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = (self.next_random() * 2.0 - 1.0) * jitter_range;
        let final_ms = (capped + jitter).max(self.config.backoff_base_ms as f64);

        self.attempt += 1;
        Duration::from_millis(final_ms as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Drives the state machine and exposes the decisions the reader task acts
/// on: when to reconnect, when the subscribe watchdog has expired.
pub struct WsSession {
    exchange: &'static str,
    config: SessionConfig,
    state: SessionState,
    backoff: BackoffCalculator,
    subscribing_since: Option<Instant>,
    last_pong: Option<Instant>,
}

impl WsSession {
    pub fn new(exchange: &'static str, config: SessionConfig) -> Self {
        Self {
            exchange,
            backoff: BackoffCalculator::new(config.clone()),
            config,
            state: SessionState::Init,
            subscribing_since: None,
            last_pong: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn on_connecting(&mut self) {
        self.state = SessionState::Connecting;
    }

    pub fn on_connected(&mut self) {
        self.state = SessionState::Subscribing;
        self.subscribing_since = Some(Instant::now());
    }

    /// Call once the venue confirms every current subscription.
    pub fn on_subscribed(&mut self) {
        self.state = SessionState::Streaming;
        self.subscribing_since = None;
        self.backoff.reset();
        self.last_pong = Some(Instant::now());
        debug!(exchange = self.exchange, "ws session streaming");
    }

    pub fn on_pong(&mut self) {
        self.last_pong = Some(Instant::now());
    }

    /// Subscription-confirmation watchdog: forces a reconnect if the venue
    /// hasn't ack'd subscriptions within `subscribe_confirm_timeout_ms`.
    pub fn subscribe_watchdog_expired(&self) -> bool {
        matches!(self.state, SessionState::Subscribing)
            && self
                .subscribing_since
                .map(|since| {
                    since.elapsed() >= Duration::from_millis(self.config.subscribe_confirm_timeout_ms)
                })
                .unwrap_or(false)
    }

    pub fn pong_timeout_expired(&self) -> bool {
        matches!(self.state, SessionState::Streaming)
            && self
                .last_pong
                .map(|last| last.elapsed() >= Duration::from_millis(self.config.pong_timeout_ms))
                .unwrap_or(false)
    }

    /// Transition to reconnecting and return the backoff duration to sleep
    /// before the next connect attempt.
    pub fn begin_reconnect(&mut self, reason: &str) -> Duration {
        warn!(exchange = self.exchange, reason, "ws session reconnecting");
        self.state = SessionState::Reconnecting;
        self.subscribing_since = None;
        self.backoff.next_backoff()
    }

    pub fn shutdown(&mut self) {
        self.state = SessionState::Shutdown;
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.config.ping_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = SessionConfig {
            backoff_base_ms: 1_000,
            backoff_max_ms: 8_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            ..SessionConfig::default()
        };
        let mut backoff = BackoffCalculator::new(config);
        let d1 = backoff.next_backoff().as_millis();
        let d2 = backoff.next_backoff().as_millis();
        let d3 = backoff.next_backoff().as_millis();
        let d4 = backoff.next_backoff().as_millis();
        assert_eq!(d1, 1000);
        assert_eq!(d2, 2000);
        assert_eq!(d3, 4000);
        assert_eq!(d4, 8000); // capped
    }

    #[test]
    fn reset_restarts_backoff_from_base() {
        let config = SessionConfig {
            jitter_factor: 0.0,
            ..SessionConfig::default()
        };
        let mut backoff = BackoffCalculator::new(config.clone());
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_backoff().as_millis(), config.backoff_base_ms as u128);
    }

    #[test]
    fn watchdog_expires_only_while_subscribing_and_after_timeout() {
        let config = SessionConfig {
            subscribe_confirm_timeout_ms: 0,
            ..SessionConfig::default()
        };
        let mut session = WsSession::new("test", config);
        assert!(!session.subscribe_watchdog_expired());
        session.on_connecting();
        session.on_connected();
        assert!(session.subscribe_watchdog_expired());
        session.on_subscribed();
        assert!(!session.subscribe_watchdog_expired());
    }

    #[test]
    fn reconnect_resets_to_reconnecting_state() {
        let mut session = WsSession::new("test", SessionConfig::default());
        session.on_connecting();
        session.on_connected();
        session.on_subscribed();
        assert_eq!(session.state(), SessionState::Streaming);
        session.begin_reconnect("pong timeout");
        assert_eq!(session.state(), SessionState::Reconnecting);
    }
}
