//! Reconnection backoff with jitter

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,
}

/// Exponential backoff with jitter so a coordinator restart does not get
/// every agent back at the same instant.
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

    /// Wait before the next reconnection attempt.
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        // 0.5x to 1.5x of the nominal backoff
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(self.current_backoff.as_secs_f64() * jitter);

        debug!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.attempt,
            "Waiting before reconnection attempt"
        );

        sleep(delay).await;

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        Ok(())
    }

    /// Reset backoff (call after a successful registration).
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Nominal (pre-jitter) backoff for the next wait.
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
