use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifecycle of the feed subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Init,
    Subscribing,
    Subscribed,
    Reconnecting { attempt: u32 },
    Failed,
}

impl ChannelState {
    pub fn is_live(&self) -> bool {
        matches!(self, ChannelState::Subscribed)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Init => write!(f, "init"),
            ChannelState::Subscribing => write!(f, "subscribing"),
            ChannelState::Subscribed => write!(f, "subscribed"),
            ChannelState::Reconnecting { attempt } => write!(f, "reconnecting({})", attempt),
            ChannelState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            max_attempts: 5,
        }
    }
}

/// Attempt bookkeeping for the transport backoff.
///
/// The counter only grows; [`reset`](ReconnectState::reset) is reserved for a
/// manual reconnect.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    config: ReconnectConfig,
    attempt: u32,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        tracing::debug!(
            "Initializing reconnect state: initial_delay={}ms, max_delay={}ms, max_attempts={}",
            config.initial_delay_ms,
            config.max_delay_ms,
            config.max_attempts
        );

        if config.initial_delay_ms > config.max_delay_ms {
            tracing::warn!(
                "initial_delay_ms ({}) > max_delay_ms ({})",
                config.initial_delay_ms,
                config.max_delay_ms
            );
        }

        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// `min(initial * 2^(attempt-1), max)` for attempt >= 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let ms = self
            .config
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn should_give_up(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    /// Records a failure. Returns the delay before the next attempt, or
    /// `None` once the retry budget is spent.
    pub fn advance_attempt(&mut self) -> Option<Duration> {
        if self.should_give_up() {
            tracing::error!(
                "Max reconnect attempts ({}) exceeded, giving up",
                self.config.max_attempts
            );
            return None;
        }
        self.attempt += 1;
        let delay = self.delay_for_attempt(self.attempt);
        tracing::debug!(
            "Advanced to reconnect attempt {} (delay {}ms)",
            self.attempt,
            delay.as_millis()
        );
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}
