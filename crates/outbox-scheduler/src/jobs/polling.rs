//! Outbox polling job.
//!
//! Each tick runs dispatch cycles until the outbox has nothing claimable
//! or the per-tick cycle budget is spent. Several dispatchers can share
//! one outbox; claims keep their batches disjoint and the stagger keeps
//! their ticks from lining up.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use outbox_indexing::{CycleOutcome, Dispatcher};
use outbox_types::DispatchSettings;

use crate::{JitterConfig, JobOutput, OverlapPolicy, SchedulerError, SchedulerService, TimeoutConfig};

/// Configuration for one dispatcher's polling job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollingJobConfig {
    /// Time between ticks in milliseconds (default: 100)
    pub interval_ms: u64,

    /// Max random delay before each tick in milliseconds (default: 0)
    pub stagger_ms: u64,

    /// Dispatch cycles per tick at most (default: 10)
    pub max_cycles_per_tick: usize,

    /// Timeout in seconds for one tick (default: 60, 0 = none)
    ///
    /// A tick cut short leaves its claimed rows leased; they become
    /// claimable again once the lease expires.
    pub timeout_secs: u64,

    /// 6-field cron expression; replaces `interval_ms` when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    /// IANA timezone for `cron` (default: the scheduler's)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl Default for PollingJobConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            stagger_ms: 0,
            max_cycles_per_tick: 10,
            timeout_secs: 60,
            cron: None,
            timezone: None,
        }
    }
}

impl PollingJobConfig {
    /// Take cadence, stagger and cycle budget from dispatch settings.
    pub fn from_settings(settings: &DispatchSettings) -> Self {
        Self {
            interval_ms: settings.polling_interval_ms,
            stagger_ms: settings.worker_stagger_ms,
            max_cycles_per_tick: settings.max_cycles_per_tick,
            ..Self::default()
        }
    }

    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    pub fn with_stagger_ms(mut self, stagger_ms: u64) -> Self {
        self.stagger_ms = stagger_ms;
        self
    }

    pub fn with_max_cycles(mut self, max_cycles: usize) -> Self {
        self.max_cycles_per_tick = max_cycles;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Tick on a cron schedule instead of a fixed interval.
    pub fn with_cron(mut self, expr: impl Into<String>, timezone: Option<&str>) -> Self {
        self.cron = Some(expr.into());
        self.timezone = timezone.map(str::to_string);
        self
    }
}

/// Totals across the cycles of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub cycles: usize,
    pub events_committed: usize,
    pub operations_submitted: usize,
    pub events_retried: usize,
    pub events_failed: usize,
    /// Set when the last cycle stopped on a transient error
    pub transient_error: Option<String>,
}

impl TickSummary {
    fn from_outcomes(outcomes: &[CycleOutcome]) -> Self {
        let mut summary = TickSummary {
            cycles: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                CycleOutcome::Committed { events, operations } => {
                    summary.events_committed += events;
                    summary.operations_submitted += operations;
                }
                CycleOutcome::Retried { retried, failed } => {
                    summary.events_retried += retried;
                    summary.events_failed += failed;
                }
                CycleOutcome::TransientFailure(reason) => {
                    summary.transient_error = Some(reason.clone());
                }
                CycleOutcome::Idle | CycleOutcome::ClaimConflict | CycleOutcome::Aborted => {}
            }
        }
        summary
    }

    fn into_output(self) -> JobOutput {
        JobOutput::new()
            .with_cycles(self.cycles)
            .with_events_committed(self.events_committed)
            .with_metadata("operations_submitted", self.operations_submitted.to_string())
            .with_metadata("events_retried", self.events_retried.to_string())
            .with_metadata("events_failed", self.events_failed.to_string())
    }
}

/// Run one polling tick: cycles until idle, cancelled, or out of budget.
pub async fn run_polling_tick(
    dispatcher: &Dispatcher,
    cancel: &CancellationToken,
    max_cycles: usize,
) -> TickSummary {
    let outcomes = dispatcher.run_until_idle(cancel, max_cycles).await;
    let summary = TickSummary::from_outcomes(&outcomes);

    if summary.events_committed > 0 || summary.events_retried > 0 {
        info!(
            worker = %dispatcher.worker(),
            cycles = summary.cycles,
            committed = summary.events_committed,
            retried = summary.events_retried,
            failed = summary.events_failed,
            "Polling tick processed events"
        );
    } else {
        debug!(worker = %dispatcher.worker(), "Polling tick: outbox idle");
    }
    summary
}

/// Register a polling job for `dispatcher`, named after its worker.
///
/// Ticks every `interval_ms`, or on the `cron` schedule when one is set.
///
/// # Errors
///
/// Returns error if the interval is zero, the cron expression or timezone
/// is invalid, or registration fails.
///
/// # Example
///
/// ```ignore
/// let dispatcher = Arc::new(Dispatcher::new(worker, storage, sink, settings.clone()));
/// dispatcher.load_checkpoint()?;
///
/// create_polling_job(&scheduler, dispatcher, PollingJobConfig::from_settings(&settings)).await?;
/// scheduler.start().await?;
/// ```
pub async fn create_polling_job(
    scheduler: &SchedulerService,
    dispatcher: Arc<Dispatcher>,
    config: PollingJobConfig,
) -> Result<uuid::Uuid, SchedulerError> {
    let name = format!("outbox-dispatch-{}", dispatcher.worker());
    let max_cycles = config.max_cycles_per_tick.max(1);

    let job_fn = move |cancel: CancellationToken| {
        let dispatcher = dispatcher.clone();
        async move {
            let summary = run_polling_tick(&dispatcher, &cancel, max_cycles).await;
            match summary.transient_error.clone() {
                Some(reason) => Err(reason),
                None => Ok(summary.into_output()),
            }
        }
    };
    let jitter = JitterConfig::new(config.stagger_ms);
    let timeout = TimeoutConfig::new(config.timeout_secs);

    let uuid = match &config.cron {
        Some(cron) => {
            let uuid = scheduler
                .register_job(
                    &name,
                    cron,
                    config.timezone.as_deref(),
                    OverlapPolicy::Skip,
                    jitter,
                    timeout,
                    job_fn,
                )
                .await?;
            info!(job = %name, cron = %cron, "Registered outbox polling job");
            uuid
        }
        None => {
            let uuid = scheduler
                .register_interval_job(
                    &name,
                    Duration::from_millis(config.interval_ms),
                    OverlapPolicy::Skip,
                    jitter,
                    timeout,
                    job_fn,
                )
                .await?;
            info!(job = %name, interval_ms = config.interval_ms, "Registered outbox polling job");
            uuid
        }
    };
    Ok(uuid)
}
