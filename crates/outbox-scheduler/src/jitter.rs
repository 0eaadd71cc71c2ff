//! Start-time jitter for polling jobs.
//!
//! Dispatchers started together on the same interval would all hit the
//! outbox at the same instant and fight over the same claim. A random delay
//! before each tick spreads them out.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for job execution jitter.
///
/// # Example
///
/// ```
/// use outbox_scheduler::JitterConfig;
///
/// // Up to 250ms of delay before each run
/// let config = JitterConfig::new(250);
///
/// let delay = config.generate_jitter();
/// assert!(delay < std::time::Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct JitterConfig {
    /// Maximum jitter in milliseconds (0 = no jitter).
    pub max_jitter_ms: u64,
}

impl JitterConfig {
    pub fn new(max_jitter_ms: u64) -> Self {
        Self { max_jitter_ms }
    }

    /// No delay.
    pub fn none() -> Self {
        Self { max_jitter_ms: 0 }
    }

    /// Random duration in `[0, max_jitter_ms)`; zero when disabled.
    pub fn generate_jitter(&self) -> Duration {
        if self.max_jitter_ms == 0 {
            return Duration::ZERO;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..self.max_jitter_ms);
        Duration::from_millis(jitter_ms)
    }

    pub fn is_enabled(&self) -> bool {
        self.max_jitter_ms > 0
    }
}

/// Run a future after a random delay of up to `max_jitter_ms`.
pub async fn with_jitter<F, T>(max_jitter_ms: u64, job_fn: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let jitter = JitterConfig::new(max_jitter_ms).generate_jitter();
    if !jitter.is_zero() {
        tracing::debug!(jitter_ms = jitter.as_millis(), "Applying jitter delay");
        tokio::time::sleep(jitter).await;
    }
    job_fn.await
}
