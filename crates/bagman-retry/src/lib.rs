//! Retry/backoff strategies shared by every Bagman pipeline worker.
//!
//! Each worker stage (fetch, store, record, replicate, fixity, ...) retries
//! transient failures with backoff and gives up after a per-topic attempt
//! budget, handing the envelope to a trouble topic instead. This crate
//! supplies the backoff math and the error-class-to-policy mapping; it does
//! not know about bags, buckets, or brokers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a worker should classify a failure for retry purposes.
///
/// `Retryable` covers transient I/O faults (network errors, 5xx responses,
/// insufficient disk space). `Permanent` covers input/state faults that will
/// never succeed on retry (invalid bag, missing object). `PartialSuccess`
/// covers the case where some but not all of a multi-file operation
/// completed — never retried automatically, always routed to a trouble
/// topic for operator review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Permanent,
    PartialSuccess,
}

impl ErrorClass {
    /// Whether a worker should requeue the broker message for this class.
    pub fn should_retry(self) -> bool {
        matches!(self, ErrorClass::Retryable)
    }
}

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries - retry immediately.
    Immediate,
    /// Exponential backoff: delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Linear backoff: delay increases linearly each attempt.
    Linear,
    /// Constant delay: same delay every attempt.
    Constant,
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    pub strategy: RetryStrategyType,
    /// Maximum number of retry attempts before the envelope is considered
    /// permanently failed and routed to a trouble topic.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor (0.0 = no jitter, 1.0 = full jitter).
    pub jitter: f64,
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
            jitter: 0.3,
        }
    }
}

/// Predefined retry policies matching the backoff-by-stage convention in
/// spec §7 ("broker `requeue(1-10 min)` with backoff by stage").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Fetch/store: short, frequent retries — transient network faults.
    #[default]
    Default,
    /// Record/replicate/fixity against the registry: longer backoff, since
    /// 5xx errors there are more likely to need real recovery time.
    Conservative,
    /// Resource exhaustion (disk space): fixed 10-minute requeue per spec
    /// §7's "Resource exhaustion" row.
    VolumeExhaustion,
    /// Use the explicit `strategy`/`max_attempts`/`base_delay`/`max_delay`/
    /// `jitter` fields configured alongside this policy instead of a preset.
    Custom,
}

impl RetryPolicy {
    pub fn to_config(self) -> RetryStrategyConfig {
        match self {
            RetryPolicy::Default => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 5,
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(600),
                jitter: 0.3,
            },
            RetryPolicy::Conservative => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 8,
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(3600),
                jitter: 0.2,
            },
            RetryPolicy::VolumeExhaustion => RetryStrategyConfig {
                strategy: RetryStrategyType::Constant,
                max_attempts: 12,
                base_delay: Duration::from_secs(600),
                max_delay: Duration::from_secs(600),
                jitter: 0.0,
            },
            // Callers configuring `Custom` are expected to build a
            // `RetryStrategyConfig` from their own explicit fields rather
            // than calling `to_config`; this is the same fallback the
            // `Default` policy uses.
            RetryPolicy::Custom => RetryStrategyConfig::default(),
        }
    }
}

/// Calculate the delay for the next retry attempt based on the strategy
/// configuration. `attempt` is 1-indexed (first retry = 1).
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt.max(1)),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Apply jitter to a delay value. Jitter factor of 0.5 means delay * (0.5 to 1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter_range = 2.0 * jitter;
    let random_factor = 1.0 - jitter + (rand::random::<f64>() * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).max(0.0).round() as u64;
    Duration::from_millis(millis)
}

/// Whether a worker should give up and route to a trouble topic, given the
/// attempt number it is about to make and the configured budget.
pub fn attempts_exhausted(config: &RetryStrategyConfig, attempt: u32) -> bool {
    attempt > config.max_attempts
}
