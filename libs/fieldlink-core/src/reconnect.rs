//! Transport reopen backoff
//!
//! A messenger that lost its transport reopens it lazily on the next exchange.
//! Each failed open pushes the next allowed attempt further out. Exchanges
//! inside that window fail at once with `NotConnected` instead of touching the
//! network or the serial driver.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Transport state as seen by the messenger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Closed; the next exchange may reopen at once
    Closed,
    /// Closed after failed opens; waiting out the delay
    Backoff,
    /// `max_attempts` failed opens in a row; attempts continue at `max_delay`
    Down,
}

/// Reopen schedule for one link
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Consecutive failures before the link is reported down (0 = never)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Spread each delay by up to 25% either way
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Delay after the `failures`-th consecutive failed open, before jitter
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    fn spread(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        delay.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
    }
}

/// Tracks failed opens of one transport and gates the next attempt
#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    state: ConnectionState,
    /// Failed opens since the last successful one
    failures: u32,
    retry_at: Option<Instant>,
    attempts: u64,
    opens: u64,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Closed,
            failures: 0,
            retry_at: None,
            attempts: 0,
            opens: 0,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Open attempts so far
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Successful opens so far
    pub fn opens(&self) -> u64 {
        self.opens
    }

    /// Time left before the next open may be attempted
    pub fn remaining_backoff(&self) -> Option<Duration> {
        self.retry_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }

    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn mark_connected(&mut self) {
        if self.failures > 0 {
            debug!("Transport reopened after {} failed attempts", self.failures);
        }
        self.state = ConnectionState::Open;
        self.failures = 0;
        self.retry_at = None;
        self.opens += 1;
    }

    /// Transport closed after an I/O failure; no backoff for the first reopen
    pub fn mark_disconnected(&mut self) {
        if self.state == ConnectionState::Open {
            self.state = ConnectionState::Closed;
        }
    }

    /// Record a failed open and schedule the next one
    pub fn mark_failed(&mut self, reason: &str) {
        self.failures = self.failures.saturating_add(1);
        let down = self.policy.max_attempts > 0 && self.failures >= self.policy.max_attempts;

        let delay = if down {
            self.policy.max_delay
        } else {
            self.policy.spread(self.policy.delay_for(self.failures))
        };
        self.retry_at = Some(Instant::now() + delay);

        match (down, self.state) {
            (true, ConnectionState::Down) => {},
            (true, _) => error!("Link down after {} open attempts: {}", self.failures, reason),
            (false, _) => warn!(
                "Open attempt {} failed: {}, next in {:?}",
                self.failures, reason, delay
            ),
        }
        self.state = if down {
            ConnectionState::Down
        } else {
            ConnectionState::Backoff
        };
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn steady(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let p = steady(0);
        let delays: Vec<_> = (1..=6).map(|n| p.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_opens_gate_next_attempt() {
        let mut helper = ReconnectHelper::new(steady(0));
        assert_eq!(helper.remaining_backoff(), None);

        helper.mark_failed("refused");
        helper.mark_failed("refused");
        assert_eq!(helper.remaining_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(helper.connection_state(), ConnectionState::Backoff);

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(helper.remaining_backoff(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_down_after_max_attempts() {
        let mut helper = ReconnectHelper::new(steady(2));
        helper.mark_failed("refused");
        assert_eq!(helper.connection_state(), ConnectionState::Backoff);
        helper.mark_failed("refused");
        assert_eq!(helper.connection_state(), ConnectionState::Down);
        assert_eq!(helper.remaining_backoff(), Some(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_clears_failures() {
        let mut helper = ReconnectHelper::new(steady(0));
        helper.begin_attempt();
        helper.mark_failed("refused");
        helper.begin_attempt();
        helper.mark_connected();

        assert_eq!(helper.connection_state(), ConnectionState::Open);
        assert_eq!(helper.failures(), 0);
        assert_eq!(helper.remaining_backoff(), None);
        assert_eq!((helper.attempts(), helper.opens()), (2, 1));

        // A dropped transport reopens without waiting
        helper.mark_disconnected();
        assert_eq!(helper.connection_state(), ConnectionState::Closed);
        assert_eq!(helper.remaining_backoff(), None);
    }

    #[test]
    fn test_jitter_within_quarter() {
        let p = ReconnectPolicy {
            jitter: true,
            ..steady(0)
        };
        for _ in 0..50 {
            let d = p.spread(p.delay_for(1));
            assert!(d >= Duration::from_millis(75) && d <= Duration::from_millis(125));
        }
    }
}
