//! Retry and backoff for events whose batch the sink rejected.
//!
//! `delay = min(max, base * 2^retry_count) ± jitter_ratio * delay`. An event
//! whose retry count reaches the ceiling becomes `FAILED` and stays in the
//! outbox for an operator instead of being retried forever.

use rand::Rng;

use outbox_storage::RetryUpdate;
use outbox_types::{DispatchSettings, OutboxEvent};

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Failures after which an event is parked as `FAILED`
    pub ceiling: u32,
    pub base_ms: u64,
    pub max_ms: u64,
    /// Fraction of the delay added or removed at random, in `[0, 1]`
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&DispatchSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &DispatchSettings) -> Self {
        Self {
            ceiling: settings.retry_ceiling,
            base_ms: settings.backoff_base_ms,
            max_ms: settings.backoff_max_ms,
            jitter_ratio: settings.backoff_jitter,
        }
    }

    /// Capped exponential delay before jitter.
    pub fn base_delay_ms(&self, retry_count: u32) -> u64 {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.max_ms)
    }

    /// Delay with jitter applied.
    pub fn delay_ms<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> u64 {
        let delay = self.base_delay_ms(retry_count);
        let spread = (delay as f64 * self.jitter_ratio.clamp(0.0, 1.0)) as i64;
        if spread == 0 {
            return delay;
        }
        let offset = rng.random_range(-spread..=spread);
        (delay as i64).saturating_add(offset).max(0) as u64
    }
}

/// Outcome of one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back off, then make the event claimable again
    Retry { retry_count: u32, next_eligible_ms: i64 },
    /// Ceiling reached; park the event
    Fail { retry_count: u32 },
}

impl RetryDecision {
    pub fn is_failed(&self) -> bool {
        matches!(self, RetryDecision::Fail { .. })
    }
}

/// Applies a [`RetryPolicy`] to failed events.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide what happens to an event after its batch failed at `now_ms`.
    pub fn on_failure(&self, event: &OutboxEvent, now_ms: i64) -> RetryDecision {
        let retry_count = event.retry_count.saturating_add(1);
        if retry_count >= self.policy.ceiling {
            return RetryDecision::Fail { retry_count };
        }
        let delay = self.policy.delay_ms(event.retry_count, &mut rand::rng());
        RetryDecision::Retry {
            retry_count,
            next_eligible_ms: now_ms.saturating_add(delay as i64),
        }
    }

    /// Storage update for every event of a failed batch.
    pub fn updates_for(&self, events: &[OutboxEvent], now_ms: i64, error: &str) -> Vec<RetryUpdate> {
        events
            .iter()
            .map(|event| {
                let decision = self.on_failure(event, now_ms);
                match decision {
                    RetryDecision::Retry {
                        retry_count,
                        next_eligible_ms,
                    } => RetryUpdate {
                        id: event.id,
                        retry_count,
                        failed: false,
                        next_eligible_ms,
                        last_error: Some(error.to_string()),
                    },
                    RetryDecision::Fail { retry_count } => RetryUpdate {
                        id: event.id,
                        retry_count,
                        failed: true,
                        next_eligible_ms: event.next_eligible_ms,
                        last_error: Some(error.to_string()),
                    },
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_types::{DocumentRoutes, EventId, MutationType, NewOutboxEvent};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy(ceiling: u32, base: u64, max: u64, jitter: f64) -> RetryPolicy {
        RetryPolicy {
            ceiling,
            base_ms: base,
            max_ms: max,
            jitter_ratio: jitter,
        }
    }

    fn event_with_retries(retry_count: u32) -> OutboxEvent {
        let mut event = OutboxEvent::from_new(
            EventId(1),
            NewOutboxEvent::new("IndexedEntity", "1", MutationType::Add, DocumentRoutes::unrouted()),
            0,
        );
        event.retry_count = retry_count;
        event
    }

    #[test]
    fn test_exponential_growth_capped() {
        let p = policy(10, 100, 1_000, 0.0);
        assert_eq!(p.base_delay_ms(0), 100);
        assert_eq!(p.base_delay_ms(1), 200);
        assert_eq!(p.base_delay_ms(3), 800);
        assert_eq!(p.base_delay_ms(4), 1_000);
        assert_eq!(p.base_delay_ms(200), 1_000);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let p = policy(10, 1_000, 60_000, 0.2);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let d = p.delay_ms(2, &mut rng);
            assert!((3_200..=4_800).contains(&d), "delay {} out of bounds", d);
        }
    }

    #[test]
    fn test_ceiling_reached_fails() {
        let controller = RetryController::new(policy(3, 0, 0, 0.0));
        assert_eq!(
            controller.on_failure(&event_with_retries(0), 10),
            RetryDecision::Retry {
                retry_count: 1,
                next_eligible_ms: 10
            }
        );
        assert!(!controller.on_failure(&event_with_retries(1), 10).is_failed());
        assert_eq!(
            controller.on_failure(&event_with_retries(2), 10),
            RetryDecision::Fail { retry_count: 3 }
        );
    }

    #[test]
    fn test_updates_for_records_error() {
        let controller = RetryController::new(policy(3, 50, 1_000, 0.0));
        let updates = controller.updates_for(&[event_with_retries(0)], 100, "sink down");
        assert_eq!(
            updates,
            vec![RetryUpdate {
                id: EventId(1),
                retry_count: 1,
                failed: false,
                next_eligible_ms: 150,
                last_error: Some("sink down".to_string()),
            }]
        );
    }
}
