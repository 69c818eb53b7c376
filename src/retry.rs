//! Retry configuration and the retry decision policy.

use crate::error::ConsumerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a retryable failure is sent back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Reject without requeue and let the queue's dead-letter exchange
    /// re-enqueue the message after its fixed TTL.
    #[default]
    DeadLetterChain,
    /// Republish a copy to the delay route with a per-message expiration
    /// computed by the backoff formula, then acknowledge the original.
    DelayedRepublish,
}

/// Process-wide retry budget and backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier_base: u32,
    pub strategy: RetryStrategy,
}

impl RetryPolicyConfig {
    /// Creates a new retry configuration using the default strategy.
    ///
    /// # Arguments
    /// * `max_retries` - Failed deliveries with at least this many prior attempts are dead-lettered.
    /// * `base_delay` - Delay before the first delayed retry.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff_multiplier_base: 2,
            strategy: RetryStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_backoff_multiplier_base(mut self, base: u32) -> Self {
        self.backoff_multiplier_base = base;
        self
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.backoff_multiplier_base == 0 {
            return Err(ConsumerError::configuration("backoff_multiplier_base must be at least 1"));
        }
        Ok(())
    }
}

impl Default for RetryPolicyConfig {
    /// 3 retries, 30 second base delay, doubling backoff, dead-letter chaining.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

/// Result of running the business handler once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// What to do with a delivery after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Accept,
    RetryImmediate,
    RetryDelayed { delay: Duration },
    DeadLetter,
}

/// Pure mapping from (outcome, attempt count) to a [`RetryDecision`].
///
/// Holds no mutable state and can be shared freely between dispatchers.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryPolicyConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Result<Self, ConsumerError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RetryPolicyConfig {
        &self.config
    }

    pub fn decide(&self, outcome: Outcome, attempt_count: u32) -> RetryDecision {
        decide(outcome, attempt_count, &self.config)
    }

    pub fn backoff_delay(&self, attempt_count: u32) -> Duration {
        backoff_delay(attempt_count, &self.config)
    }
}

/// Decides the fate of a delivery.
///
/// Success is always accepted. A failure is retried with the configured
/// strategy while `attempt_count < max_retries`, and dead-lettered otherwise.
pub fn decide(outcome: Outcome, attempt_count: u32, config: &RetryPolicyConfig) -> RetryDecision {
    match outcome {
        Outcome::Success => RetryDecision::Accept,
        Outcome::Failure if attempt_count >= config.max_retries => RetryDecision::DeadLetter,
        Outcome::Failure => match config.strategy {
            RetryStrategy::DeadLetterChain => RetryDecision::RetryImmediate,
            RetryStrategy::DelayedRepublish => RetryDecision::RetryDelayed {
                delay: backoff_delay(attempt_count, config),
            },
        },
    }
}

/// `base_delay * backoff_multiplier_base ^ attempt_count`, saturating at `Duration::MAX`.
pub fn backoff_delay(attempt_count: u32, config: &RetryPolicyConfig) -> Duration {
    config
        .backoff_multiplier_base
        .checked_pow(attempt_count)
        .and_then(|factor| config.base_delay.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}
