//! Background scheduling for outbox dispatchers.
//!
//! Wraps `tokio-cron-scheduler` with the pieces a polling dispatcher needs:
//!
//! - Interval and cron jobs, timezone-aware via chrono-tz
//! - Graceful shutdown via CancellationToken
//! - Pause and resume per job
//! - Job status via [`JobRegistry`]
//! - Overlap policy so a slow tick is not stacked on
//! - Start jitter so dispatchers on one outbox do not tick in lockstep
//! - Per-run timeouts
//!
//! # Example
//!
//! ```ignore
//! use outbox_scheduler::{SchedulerService, SchedulerConfig, PollingJobConfig, create_polling_job};
//!
//! let scheduler = SchedulerService::new(SchedulerConfig::default()).await?;
//!
//! create_polling_job(&scheduler, dispatcher, PollingJobConfig::from_settings(&settings)).await?;
//!
//! let status = scheduler.registry().get_all_status();
//!
//! scheduler.start().await?;
//! ```

mod config;
mod error;
mod jitter;
mod overlap;
mod registry;
mod scheduler;

pub mod jobs;

pub use config::{SchedulerConfig, TimeoutConfig};
pub use error::SchedulerError;
pub use jitter::{with_jitter, JitterConfig};
pub use overlap::{OverlapGuard, OverlapPolicy, RunGuard};
pub use registry::{JobOutput, JobRegistry, JobResult, JobStatus};
pub use scheduler::{validate_cron_expression, SchedulerService};

#[cfg(feature = "jobs")]
pub use jobs::{create_polling_job, run_polling_tick, PollingJobConfig, TickSummary};
