//! Configuration loading for the outbox indexing pipeline.
//!
//! Layered config: defaults -> config file -> env vars -> caller overrides.
//! The default config file lives at `~/.config/search-outbox/config.toml`.

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::OutboxError;

/// Dispatcher and retry tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchSettings {
    /// Maximum events claimed per dispatch cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Polling cadence in milliseconds
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Upper bound of the random per-tick stagger, in milliseconds (0 = off)
    #[serde(default)]
    pub worker_stagger_ms: u64,

    /// Dispatch cycles run per polling tick at most
    #[serde(default = "default_max_cycles_per_tick")]
    pub max_cycles_per_tick: usize,

    /// Failed attempts after which an event becomes FAILED
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    /// Backoff base delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Jitter as a fraction of the computed delay (0.0-1.0)
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    /// How long a claim stays valid without being committed or released
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    /// When false, events accumulate in the outbox and nothing is dispatched
    #[serde(default = "default_processing_enabled")]
    pub processing_enabled: bool,
}

fn default_batch_size() -> usize {
    50
}

fn default_polling_interval_ms() -> u64 {
    100
}

fn default_max_cycles_per_tick() -> usize {
    10
}

fn default_retry_ceiling() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_lease_duration_ms() -> u64 {
    60_000
}

fn default_processing_enabled() -> bool {
    true
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            polling_interval_ms: default_polling_interval_ms(),
            worker_stagger_ms: 0,
            max_cycles_per_tick: default_max_cycles_per_tick(),
            retry_ceiling: default_retry_ceiling(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: default_backoff_jitter(),
            lease_duration_ms: default_lease_duration_ms(),
            processing_enabled: default_processing_enabled(),
        }
    }
}

impl DispatchSettings {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.batch_size == 0 {
            return Err(OutboxError::Config("batch_size must be > 0".into()));
        }
        if self.polling_interval_ms == 0 {
            return Err(OutboxError::Config("polling_interval_ms must be > 0".into()));
        }
        if self.max_cycles_per_tick == 0 {
            return Err(OutboxError::Config("max_cycles_per_tick must be > 0".into()));
        }
        if self.retry_ceiling == 0 {
            return Err(OutboxError::Config("retry_ceiling must be > 0".into()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(OutboxError::Config(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(OutboxError::Config(format!(
                "backoff_jitter must be 0.0-1.0, got {}",
                self.backoff_jitter
            )));
        }
        if self.lease_duration_ms == 0 {
            return Err(OutboxError::Config("lease_duration_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Polling interval as a Duration.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Lease duration as a Duration.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the retry ceiling.
    pub fn with_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    /// Set backoff base, cap and jitter.
    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64, jitter: f64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_max_ms = max_ms;
        self.backoff_jitter = jitter;
        self
    }

    /// Set the lease duration.
    pub fn with_lease_duration_ms(mut self, lease_ms: u64) -> Self {
        self.lease_duration_ms = lease_ms;
        self
    }

    /// Enable or disable processing.
    pub fn with_processing_enabled(mut self, enabled: bool) -> Self {
        self.processing_enabled = enabled;
        self
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to RocksDB storage directory
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Dispatcher configuration
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", "search-outbox")
        .map(|p| p.data_local_dir().join("db"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            dispatch: DispatchSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/search-outbox/config.toml)
    /// 3. Caller-specified config file (optional)
    /// 4. Environment variables (OUTBOX_DB_PATH, OUTBOX_DISPATCH__BATCH_SIZE, ...)
    pub fn load(config_path: Option<&str>) -> Result<Self, OutboxError> {
        let config_dir = ProjectDirs::from("", "", "search-outbox")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");
        let defaults = DispatchSettings::default();

        let mut builder = Config::builder()
            .set_default("db_path", default_db_path())
            .map_err(|e| OutboxError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| OutboxError::Config(e.to_string()))?
            .set_default("dispatch.batch_size", defaults.batch_size as i64)
            .map_err(|e| OutboxError::Config(e.to_string()))?
            .set_default("dispatch.polling_interval_ms", defaults.polling_interval_ms as i64)
            .map_err(|e| OutboxError::Config(e.to_string()))?
            .set_default("dispatch.retry_ceiling", defaults.retry_ceiling as i64)
            .map_err(|e| OutboxError::Config(e.to_string()))?
            .set_default("dispatch.lease_duration_ms", defaults.lease_duration_ms as i64)
            .map_err(|e| OutboxError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("OUTBOX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| OutboxError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| OutboxError::Config(e.to_string()))?;
        settings.dispatch.validate()?;
        Ok(settings)
    }

    /// Storage path as a PathBuf.
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.dispatch.batch_size, 50);
        assert_eq!(settings.dispatch.retry_ceiling, 3);
        assert!(settings.dispatch.processing_enabled);
        assert!(settings.dispatch.validate().is_ok());
    }

    #[test]
    fn test_load_with_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.dispatch.polling_interval_ms, 100);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile_in_temp_dir();
        writeln!(
            file.1,
            "log_level = \"debug\"\n[dispatch]\nbatch_size = 7\nretry_ceiling = 5\nprocessing_enabled = false"
        )
        .unwrap();

        let settings = Settings::load(Some(file.0.to_str().unwrap())).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.dispatch.batch_size, 7);
        assert_eq!(settings.dispatch.retry_ceiling, 5);
        assert!(!settings.dispatch.processing_enabled);
        // Untouched keys keep their defaults
        assert_eq!(settings.dispatch.backoff_max_ms, 60_000);
    }

    fn tempfile_in_temp_dir() -> (PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("outbox-config-{}.toml", ulid::Ulid::new()));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }

    #[test]
    fn test_validation() {
        let mut config = DispatchSettings::default();
        assert!(config.validate().is_ok());

        config.batch_size = 0;
        assert!(config.validate().is_err());

        let config = DispatchSettings::default().with_backoff(10_000, 1_000, 0.1);
        assert!(config.validate().is_err());

        let config = DispatchSettings::default().with_backoff(0, 0, 1.5);
        assert!(config.validate().is_err());

        let config = DispatchSettings::default().with_lease_duration_ms(0);
        assert!(config.validate().is_err());

        let config = DispatchSettings::default().with_backoff(0, 0, 0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dispatch_settings_serialization() {
        let config = DispatchSettings::default().with_batch_size(10);
        let json = serde_json::to_string(&config).unwrap();
        let decoded: DispatchSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let decoded: DispatchSettings = serde_json::from_str(r#"{"batch_size": 3}"#).unwrap();
        assert_eq!(decoded.batch_size, 3);
        assert_eq!(decoded.lease_duration_ms, 60_000);
        assert!(decoded.processing_enabled);
    }
}
