//! Reconnection logic with exponential backoff

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first retry after a failure
    pub initial_backoff: Duration,
    /// Upper bound for the doubling delay
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Reconnection manager with exponential backoff.
///
/// After `k` consecutive failures the wait before the next attempt is
/// `min(initial * 2^(k-1), max)`. A clean session end calls [`reset`].
///
/// [`reset`]: ReconnectManager::reset
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Take the delay for the next retry and advance the backoff
    pub fn next_backoff(&mut self) -> Duration {
        self.attempt += 1;
        let delay = self.current_backoff;
        self.current_backoff = self
            .current_backoff
            .saturating_mul(2)
            .min(self.config.max_backoff);
        delay
    }

    /// Wait before the next reconnection attempt, returning early on cancellation
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<Duration, ReconnectError> {
        let delay = self.next_backoff();

        debug!(
            "Waiting {:?} before reconnection attempt {}",
            delay,
            self.attempt + 1
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(ReconnectError::Cancelled),
            _ = sleep(delay) => Ok(delay),
        }
    }

    /// Reset backoff (call after a connection ended cleanly)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Number of consecutive failed attempts
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Delay that the next wait will use
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
