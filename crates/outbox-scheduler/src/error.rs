//! Scheduler failures.

use thiserror::Error;
use tokio_cron_scheduler::JobSchedulerError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Raised by tokio-cron-scheduler itself.
    #[error("job scheduler: {0}")]
    Scheduler(String),

    #[error("cron expression rejected: {0}")]
    InvalidCron(String),

    /// Polling intervals must be non-zero.
    #[error("interval rejected: {0}")]
    InvalidInterval(String),

    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),

    /// Pause or resume named a job that was never registered.
    #[error("no job named '{0}'")]
    JobNotFound(String),

    #[error("scheduler already started")]
    AlreadyRunning,

    #[error("scheduler not started")]
    NotRunning,
}

impl From<JobSchedulerError> for SchedulerError {
    fn from(err: JobSchedulerError) -> Self {
        SchedulerError::Scheduler(err.to_string())
    }
}
