//! Predefined jobs.
//!
//! - **polling**: drives a dispatcher on a fixed interval

#[cfg(feature = "jobs")]
pub mod polling;

#[cfg(feature = "jobs")]
pub use polling::{create_polling_job, run_polling_tick, PollingJobConfig, TickSummary};
