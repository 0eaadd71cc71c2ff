//! Job registry for tracking job metadata and execution status.
//!
//! The `JobRegistry` records, per job, when it last ran, how long it took,
//! what it reported, and whether it is running or paused. Operators read it
//! to see whether dispatch is keeping up.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of a job execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed successfully
    Success,
    /// Job failed with an error message
    Failed(String),
    /// Job was skipped (e.g., due to overlap policy)
    Skipped(String),
}

/// Key-value stats a job reports back to the registry.
#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    pub metadata: HashMap<String, String>,
}

impl JobOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Number of outbox events the run committed.
    pub fn with_events_committed(self, count: usize) -> Self {
        self.with_metadata("events_committed", count.to_string())
    }

    /// Number of dispatch cycles the run executed.
    pub fn with_cycles(self, count: usize) -> Self {
        self.with_metadata("cycles", count.to_string())
    }
}

/// Status of a registered job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_name: String,
    /// Cron expression, or `every <n>ms` for interval jobs
    pub schedule: String,
    /// When the job last finished (if ever)
    pub last_run: Option<DateTime<Utc>>,
    /// Duration of the last run in milliseconds
    pub last_duration_ms: Option<u64>,
    pub last_result: Option<JobResult>,
    pub next_run: Option<DateTime<Utc>>,
    /// Total number of times the job has run
    pub run_count: u64,
    /// Total number of times the job has failed
    pub error_count: u64,
    pub is_running: bool,
    pub is_paused: bool,
    #[serde(default)]
    pub last_run_metadata: HashMap<String, String>,
}

impl JobStatus {
    pub fn new(job_name: String, schedule: String) -> Self {
        Self {
            job_name,
            schedule,
            last_run: None,
            last_duration_ms: None,
            last_result: None,
            next_run: None,
            run_count: 0,
            error_count: 0,
            is_running: false,
            is_paused: false,
            last_run_metadata: HashMap::new(),
        }
    }
}

/// Thread-safe registry of job status.
///
/// # Example
///
/// ```
/// use outbox_scheduler::{JobRegistry, JobResult};
///
/// let registry = JobRegistry::new();
/// registry.register("outbox-dispatch", "every 500ms");
///
/// registry.record_start("outbox-dispatch");
/// assert!(registry.is_running("outbox-dispatch"));
///
/// registry.record_complete("outbox-dispatch", JobResult::Success, 12);
/// assert!(!registry.is_running("outbox-dispatch"));
/// ```
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobStatus>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, JobStatus>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, JobStatus>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a job. An existing entry with the same name is replaced.
    pub fn register(&self, job_name: &str, schedule: &str) {
        self.write().insert(
            job_name.to_string(),
            JobStatus::new(job_name.to_string(), schedule.to_string()),
        );
    }

    pub fn record_start(&self, job_name: &str) {
        if let Some(status) = self.write().get_mut(job_name) {
            status.is_running = true;
        }
    }

    pub fn record_complete(&self, job_name: &str, result: JobResult, duration_ms: u64) {
        self.record_complete_with_metadata(job_name, result, duration_ms, HashMap::new());
    }

    /// Record a finished run along with the stats it reported.
    pub fn record_complete_with_metadata(
        &self,
        job_name: &str,
        result: JobResult,
        duration_ms: u64,
        metadata: HashMap<String, String>,
    ) {
        if let Some(status) = self.write().get_mut(job_name) {
            status.is_running = false;
            status.last_run = Some(Utc::now());
            status.last_duration_ms = Some(duration_ms);
            status.run_count += 1;
            if matches!(result, JobResult::Failed(_)) {
                status.error_count += 1;
            }
            status.last_result = Some(result);
            status.last_run_metadata = metadata;
        }
    }

    pub fn set_next_run(&self, job_name: &str, next: DateTime<Utc>) {
        if let Some(status) = self.write().get_mut(job_name) {
            status.next_run = Some(next);
        }
    }

    pub fn set_paused(&self, job_name: &str, paused: bool) {
        if let Some(status) = self.write().get_mut(job_name) {
            status.is_paused = paused;
        }
    }

    pub fn get_status(&self, job_name: &str) -> Option<JobStatus> {
        self.read().get(job_name).cloned()
    }

    /// All jobs, sorted by name.
    pub fn get_all_status(&self) -> Vec<JobStatus> {
        let mut all: Vec<JobStatus> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        all
    }

    /// Returns `false` if the job is not registered.
    pub fn is_running(&self, job_name: &str) -> bool {
        self.read()
            .get(job_name)
            .map(|s| s.is_running)
            .unwrap_or(false)
    }

    /// Number of jobs with a run in flight.
    pub fn running_count(&self) -> usize {
        self.read().values().filter(|s| s.is_running).count()
    }

    pub fn is_registered(&self, job_name: &str) -> bool {
        self.read().contains_key(job_name)
    }

    /// Returns `false` if the job is not registered.
    pub fn is_paused(&self, job_name: &str) -> bool {
        self.read()
            .get(job_name)
            .map(|s| s.is_paused)
            .unwrap_or(false)
    }

    pub fn job_count(&self) -> usize {
        self.read().len()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
