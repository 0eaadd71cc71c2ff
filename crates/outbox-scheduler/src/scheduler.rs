//! Scheduler service wrapper around tokio-cron-scheduler.
//!
//! Provides lifecycle management for background jobs with
//! graceful shutdown support.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono_tz::Tz;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    JitterConfig, JobOutput, JobRegistry, JobResult, OverlapGuard, OverlapPolicy, SchedulerConfig,
    SchedulerError, TimeoutConfig,
};

/// Validate a cron expression.
///
/// The expression uses the 6-field format:
/// second minute hour day-of-month month day-of-week.
///
/// # Example
///
/// ```
/// use outbox_scheduler::validate_cron_expression;
///
/// assert!(validate_cron_expression("0 0 * * * *").is_ok());  // Every hour
/// assert!(validate_cron_expression("*/5 * * * * *").is_ok()); // Every 5 seconds
///
/// assert!(validate_cron_expression("invalid").is_err());
/// assert!(validate_cron_expression("").is_err());
/// ```
pub fn validate_cron_expression(expr: &str) -> Result<(), SchedulerError> {
    match Job::new_async(expr, |_uuid, _lock| Box::pin(async {})) {
        Ok(_) => Ok(()),
        Err(e) => Err(SchedulerError::InvalidCron(format!("'{}': {}", expr, e))),
    }
}

/// Everything a single run needs besides the job function.
#[derive(Clone)]
struct JobContext {
    name: String,
    registry: Arc<JobRegistry>,
    guard: Arc<OverlapGuard>,
    jitter: JitterConfig,
    timeout: TimeoutConfig,
    token: CancellationToken,
}

/// One scheduled firing: pause and overlap checks, jitter, then the job
/// under its timeout, with the result recorded in the registry.
async fn execute_job<F, Fut>(ctx: JobContext, job_fn: F)
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<JobOutput, String>>,
{
    if ctx.token.is_cancelled() {
        debug!(job = %ctx.name, "Shutdown in progress, not starting job");
        return;
    }
    if ctx.registry.is_paused(&ctx.name) {
        debug!(job = %ctx.name, "Job paused, skipping");
        return;
    }

    let Some(_run) = ctx.guard.try_acquire() else {
        debug!(job = %ctx.name, "Previous run still active, skipping");
        ctx.registry.record_complete(
            &ctx.name,
            JobResult::Skipped("previous run still active".to_string()),
            0,
        );
        return;
    };

    let jitter = ctx.jitter.generate_jitter();
    if !jitter.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = ctx.token.cancelled() => return,
        }
    }

    ctx.registry.record_start(&ctx.name);
    let start = Instant::now();

    let run = job_fn(ctx.token.clone());
    let result = match ctx.timeout.duration() {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => Err(format!("timed out after {}s", limit.as_secs())),
        },
        None => run.await,
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(output) => {
            debug!(job = %ctx.name, duration_ms, "Job completed");
            ctx.registry.record_complete_with_metadata(
                &ctx.name,
                JobResult::Success,
                duration_ms,
                output.metadata,
            );
        }
        Err(e) => {
            warn!(job = %ctx.name, duration_ms, error = %e, "Job failed");
            ctx.registry
                .record_complete(&ctx.name, JobResult::Failed(e), duration_ms);
        }
    }
}

/// Service wrapper around JobScheduler for lifecycle management.
///
/// Provides start/stop functionality with graceful shutdown support
/// via CancellationToken propagation to jobs.
pub struct SchedulerService {
    scheduler: JobScheduler,
    config: SchedulerConfig,
    registry: Arc<JobRegistry>,
    shutdown_token: CancellationToken,
    is_running: AtomicBool,
}

impl SchedulerService {
    /// Create a new scheduler service with the given configuration.
    ///
    /// The scheduler is created but not started. Call `start()` to begin
    /// executing scheduled jobs.
    pub async fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let _ = config.parse_timezone()?;

        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler,
            config,
            registry: Arc::new(JobRegistry::new()),
            shutdown_token: CancellationToken::new(),
            is_running: AtomicBool::new(false),
        })
    }

    /// Start the scheduler.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AlreadyRunning` if the scheduler is already started.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        self.scheduler.start().await?;
        info!(jobs = self.registry.job_count(), "Scheduler started");

        Ok(())
    }

    /// Shutdown the scheduler gracefully.
    ///
    /// Cancels the shutdown token, then waits for running jobs to finish
    /// their current cycle, up to the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NotRunning` if the scheduler is not started.
    pub async fn shutdown(&mut self) -> Result<(), SchedulerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        info!("Initiating scheduler shutdown");
        self.shutdown_token.cancel();

        let deadline = Instant::now() + self.config.shutdown_timeout();
        while self.registry.running_count() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    running = self.registry.running_count(),
                    "Shutdown timeout reached with jobs still running"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Error during scheduler shutdown: {}", e);
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Scheduler shutdown complete");

        Ok(())
    }

    /// Token cancelled at shutdown. Jobs receive a clone on every run.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Pause a registered job. Firings are ignored until resumed.
    pub fn pause_job(&self, name: &str) -> Result<(), SchedulerError> {
        if !self.registry.is_registered(name) {
            return Err(SchedulerError::JobNotFound(name.to_string()));
        }
        self.registry.set_paused(name, true);
        info!(job = %name, "Job paused");
        Ok(())
    }

    pub fn resume_job(&self, name: &str) -> Result<(), SchedulerError> {
        if !self.registry.is_registered(name) {
            return Err(SchedulerError::JobNotFound(name.to_string()));
        }
        self.registry.set_paused(name, false);
        info!(job = %name, "Job resumed");
        Ok(())
    }

    fn context(
        &self,
        name: &str,
        overlap: OverlapPolicy,
        jitter: JitterConfig,
        timeout: TimeoutConfig,
    ) -> JobContext {
        JobContext {
            name: name.to_string(),
            registry: self.registry.clone(),
            guard: Arc::new(OverlapGuard::new(overlap)),
            jitter,
            timeout,
            token: self.shutdown_token.clone(),
        }
    }

    /// Register a cron job with overlap, jitter and timeout handling.
    ///
    /// `timezone` falls back to the configured default when `None`.
    ///
    /// # Errors
    ///
    /// Returns error if the cron expression or timezone is invalid.
    #[allow(clippy::too_many_arguments)]
    pub async fn register_job<F, Fut>(
        &self,
        name: &str,
        cron_expr: &str,
        timezone: Option<&str>,
        overlap: OverlapPolicy,
        jitter: JitterConfig,
        timeout: TimeoutConfig,
        job_fn: F,
    ) -> Result<uuid::Uuid, SchedulerError>
    where
        F: Fn(CancellationToken) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<JobOutput, String>> + Send + 'static,
    {
        let tz: Tz = match timezone {
            Some(tz_str) => Self::parse_timezone(tz_str)?,
            None => self.config.parse_timezone()?,
        };
        validate_cron_expression(cron_expr)?;

        let ctx = self.context(name, overlap, jitter, timeout);
        let job = Job::new_async_tz(cron_expr, tz, move |_uuid, _lock| {
            let ctx = ctx.clone();
            let job_fn = job_fn.clone();
            Box::pin(async move { execute_job(ctx, job_fn).await })
        })
        .map_err(|e| SchedulerError::InvalidCron(e.to_string()))?;

        self.registry.register(name, cron_expr);
        let uuid = self.scheduler.add(job).await?;
        info!(job = %name, uuid = %uuid, cron = %cron_expr, timezone = %tz.name(), "Job registered");

        Ok(uuid)
    }

    /// Register a job that fires every `interval`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidInterval` for a zero interval.
    pub async fn register_interval_job<F, Fut>(
        &self,
        name: &str,
        interval: Duration,
        overlap: OverlapPolicy,
        jitter: JitterConfig,
        timeout: TimeoutConfig,
        job_fn: F,
    ) -> Result<uuid::Uuid, SchedulerError>
    where
        F: Fn(CancellationToken) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<JobOutput, String>> + Send + 'static,
    {
        if interval.is_zero() {
            return Err(SchedulerError::InvalidInterval(format!(
                "job '{}' needs a non-zero interval",
                name
            )));
        }

        let ctx = self.context(name, overlap, jitter, timeout);
        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let ctx = ctx.clone();
            let job_fn = job_fn.clone();
            Box::pin(async move { execute_job(ctx, job_fn).await })
        })?;

        let schedule = format!("every {}ms", interval.as_millis());
        self.registry.register(name, &schedule);
        let uuid = self.scheduler.add(job).await?;
        info!(job = %name, uuid = %uuid, schedule = %schedule, "Job registered");

        Ok(uuid)
    }

    /// Parse a timezone string into a chrono_tz::Tz.
    pub fn parse_timezone(tz_str: &str) -> Result<Tz, SchedulerError> {
        tz_str
            .parse()
            .map_err(|_| SchedulerError::InvalidTimezone(tz_str.to_string()))
    }
}
