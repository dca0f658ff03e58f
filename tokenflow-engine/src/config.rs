//! Engine configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TOKENFLOW_CONFIG)
//! 3. Environment variables

use crate::backoff::RetryBackoff;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokenflow_core::{UnhandledErrorPolicy, DEFAULT_RETRIES};

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Job executor configuration.
    pub job_executor: JobExecutorConfig,
    /// Runtime behavior of the process engine.
    pub engine: EngineConfig,
    /// Automatic snapshots and WAL compaction.
    pub checkpoint: CheckpointConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("TOKENFLOW_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.storage.apply_env_overrides();
        self.job_executor.apply_env_overrides();
        self.engine.apply_env_overrides();
        self.checkpoint.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.job_executor.validate()?;
        if self.storage.wal_segment_size_mb == 0 {
            return Err(ConfigError::ValidationError(
                "storage.wal_segment_size_mb must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory.
    pub data_dir: PathBuf,
    /// WAL segment size in megabytes.
    pub wal_segment_size_mb: u64,
    /// Fsync policy.
    pub fsync_policy: FsyncPolicy,
    /// Keep everything in memory; nothing survives a restart.
    pub in_memory: bool,
}

/// Fsync policy for WAL writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Fsync after every write (safest, slowest).
    EveryWrite,
    /// Fsync after N writes.
    EveryN(u32),
    /// Fsync after N milliseconds.
    EveryMs(u32),
    /// Never fsync, rely on OS (fastest, least safe).
    Never,
}

impl From<FsyncPolicy> for tokenflow_wal::FsyncPolicy {
    fn from(policy: FsyncPolicy) -> Self {
        match policy {
            FsyncPolicy::EveryWrite => tokenflow_wal::FsyncPolicy::EveryWrite,
            FsyncPolicy::EveryN(n) => tokenflow_wal::FsyncPolicy::EveryN(n),
            FsyncPolicy::EveryMs(ms) => tokenflow_wal::FsyncPolicy::EveryMs(ms),
            FsyncPolicy::Never => tokenflow_wal::FsyncPolicy::Never,
        }
    }
}

impl FsyncPolicy {
    /// Parses the env var form: `every_write`, `never`, `every_n:N`, `every_ms:N`.
    pub fn parse(s: &str) -> FsyncPolicy {
        match s.to_lowercase().as_str() {
            "every_write" | "everywrite" => FsyncPolicy::EveryWrite,
            "never" => FsyncPolicy::Never,
            s if s.starts_with("every_n:") => FsyncPolicy::EveryN(s[8..].parse().unwrap_or(100)),
            s if s.starts_with("every_ms:") => FsyncPolicy::EveryMs(s[9..].parse().unwrap_or(100)),
            _ => FsyncPolicy::EveryWrite,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_segment_size_mb: 64,
            fsync_policy: FsyncPolicy::EveryWrite,
            in_memory: false,
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("TOKENFLOW_DATA") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(size) = std::env::var("TOKENFLOW_WAL_SEGMENT_SIZE_MB") {
            if let Ok(mb) = size.parse() {
                self.wal_segment_size_mb = mb;
            }
        }

        if let Ok(policy) = std::env::var("TOKENFLOW_FSYNC_POLICY") {
            self.fsync_policy = FsyncPolicy::parse(&policy);
        }

        if let Ok(value) = std::env::var("TOKENFLOW_IN_MEMORY") {
            self.in_memory = parse_bool(&value);
        }
    }

    /// Returns the WAL segment size in bytes.
    pub fn wal_segment_size(&self) -> u64 {
        self.wal_segment_size_mb * 1024 * 1024
    }

    /// Store configuration for the data directory.
    pub fn store_config(&self) -> tokenflow_storage::StoreConfig {
        tokenflow_storage::StoreConfig::new(&self.data_dir)
            .with_segment_size(self.wal_segment_size())
            .with_fsync_policy(self.fsync_policy.into())
    }
}

/// Job executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobExecutorConfig {
    /// Run the acquisition loop.
    pub enabled: bool,
    /// Jobs locked per acquisition cycle.
    pub max_jobs_per_acquisition: usize,
    /// Longest idle wait between acquisition cycles.
    pub wait_time_ms: u64,
    /// How long an acquired job stays locked.
    pub lock_time_ms: u64,
    /// Worker pool size.
    pub max_workers: usize,
    /// Lock owner name; a random one is generated when unset.
    pub lock_owner: Option<String>,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_jobs_per_acquisition: 3,
            wait_time_ms: 5_000,
            lock_time_ms: 300_000,
            max_workers: 4,
            lock_owner: None,
        }
    }
}

impl JobExecutorConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("TOKENFLOW_JOB_EXECUTOR_ENABLED") {
            self.enabled = parse_bool(&enabled);
        }

        if let Ok(max) = std::env::var("TOKENFLOW_MAX_JOBS_PER_ACQUISITION") {
            if let Ok(n) = max.parse() {
                self.max_jobs_per_acquisition = n;
            }
        }

        if let Ok(wait) = std::env::var("TOKENFLOW_WAIT_TIME_MS") {
            if let Ok(ms) = wait.parse() {
                self.wait_time_ms = ms;
            }
        }

        if let Ok(lock) = std::env::var("TOKENFLOW_LOCK_TIME_MS") {
            if let Ok(ms) = lock.parse() {
                self.lock_time_ms = ms;
            }
        }

        if let Ok(workers) = std::env::var("TOKENFLOW_MAX_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.max_workers = n;
            }
        }

        if let Ok(owner) = std::env::var("TOKENFLOW_LOCK_OWNER") {
            if !owner.is_empty() {
                self.lock_owner = Some(owner);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationError(
                "job_executor.max_workers must be positive".to_string(),
            ));
        }
        if self.max_jobs_per_acquisition == 0 {
            return Err(ConfigError::ValidationError(
                "job_executor.max_jobs_per_acquisition must be positive".to_string(),
            ));
        }
        if self.lock_time_ms == 0 {
            return Err(ConfigError::ValidationError(
                "job_executor.lock_time_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the idle wait as Duration.
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    pub fn lock_time(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lock_time_ms.min(i64::MAX as u64) as i64)
    }
}

/// Automatic checkpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// Checkpoint after this many commits (0 = disabled).
    pub commits_threshold: u64,
    /// Checkpoint when the WAL exceeds this size in megabytes (0 = disabled).
    pub size_threshold_mb: u64,
    /// Minimum interval between automatic checkpoints in seconds.
    pub min_interval_secs: u64,
    /// How often the thresholds are checked.
    pub check_interval_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            commits_threshold: 10_000,
            size_threshold_mb: 256,
            min_interval_secs: 60,
            check_interval_ms: 10_000,
        }
    }
}

impl CheckpointConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("TOKENFLOW_CHECKPOINT_ENABLED") {
            self.enabled = parse_bool(&enabled);
        }

        if let Ok(commits) = std::env::var("TOKENFLOW_CHECKPOINT_COMMITS") {
            if let Ok(n) = commits.parse() {
                self.commits_threshold = n;
            }
        }

        if let Ok(size) = std::env::var("TOKENFLOW_CHECKPOINT_SIZE_MB") {
            if let Ok(mb) = size.parse() {
                self.size_threshold_mb = mb;
            }
        }

        if let Ok(interval) = std::env::var("TOKENFLOW_CHECKPOINT_INTERVAL") {
            if let Ok(secs) = interval.parse() {
                self.min_interval_secs = secs;
            }
        }
    }

    pub fn size_threshold(&self) -> u64 {
        self.size_threshold_mb * 1024 * 1024
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    /// Disabled outright or with no threshold that could ever trigger.
    pub fn is_disabled(&self) -> bool {
        !self.enabled || (self.commits_threshold == 0 && self.size_threshold_mb == 0)
    }
}

/// Process engine runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retries given to jobs whose activity does not set any.
    pub default_retries: u32,
    /// Delay before a failed job becomes due again.
    pub retry_backoff: RetryBackoff,
    /// Handling of BPMN errors that no boundary event catches.
    pub unhandled_bpmn_error: UnhandledErrorPolicy,
    /// Re-runs of a command that lost an optimistic-lock race.
    pub optimistic_lock_retries: u32,
    /// Directory whose `*.json` process files are deployed at startup.
    pub processes_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retries: DEFAULT_RETRIES,
            retry_backoff: RetryBackoff::default(),
            unhandled_bpmn_error: UnhandledErrorPolicy::default(),
            optimistic_lock_retries: 3,
            processes_dir: None,
        }
    }
}

impl EngineConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(retries) = std::env::var("TOKENFLOW_DEFAULT_RETRIES") {
            if let Ok(n) = retries.parse() {
                self.default_retries = n;
            }
        }

        if let Ok(policy) = std::env::var("TOKENFLOW_UNHANDLED_BPMN_ERROR") {
            match policy.to_lowercase().as_str() {
                "propagate" => self.unhandled_bpmn_error = UnhandledErrorPolicy::Propagate,
                "log" => self.unhandled_bpmn_error = UnhandledErrorPolicy::Log,
                other => tracing::warn!(value = other, "ignoring unknown TOKENFLOW_UNHANDLED_BPMN_ERROR"),
            }
        }

        if let Ok(retries) = std::env::var("TOKENFLOW_OPTIMISTIC_LOCK_RETRIES") {
            if let Ok(n) = retries.parse() {
                self.optimistic_lock_retries = n;
            }
        }

        if let Ok(dir) = std::env::var("TOKENFLOW_PROCESSES_DIR") {
            self.processes_dir = Some(PathBuf::from(dir));
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.wal_segment_size(), 64 * 1024 * 1024);
        assert_eq!(config.job_executor.max_jobs_per_acquisition, 3);
        assert_eq!(config.job_executor.wait_time(), Duration::from_secs(5));
        assert_eq!(config.job_executor.lock_time(), chrono::Duration::minutes(5));
        assert_eq!(config.engine.default_retries, DEFAULT_RETRIES);
        assert_eq!(config.engine.unhandled_bpmn_error, UnhandledErrorPolicy::Log);
        assert_eq!(config.checkpoint.size_threshold(), 256 * 1024 * 1024);
        assert!(!config.checkpoint.is_disabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "
job_executor:
  max_workers: 8
engine:
  unhandled_bpmn_error: propagate
  retry_backoff:
    type: fixed
    delay_ms: 100
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.job_executor.max_workers, 8);
        assert_eq!(config.job_executor.lock_time_ms, 300_000);
        assert_eq!(config.engine.unhandled_bpmn_error, UnhandledErrorPolicy::Propagate);
        assert_eq!(config.engine.retry_backoff, RetryBackoff::Fixed { delay_ms: 100 });
        assert_eq!(config.storage.fsync_policy, FsyncPolicy::EveryWrite);
        assert_eq!(config.checkpoint.commits_threshold, 10_000);
    }

    #[test]
    fn test_checkpoint_without_thresholds_is_disabled() {
        let yaml = "
checkpoint:
  commits_threshold: 0
  size_threshold_mb: 0
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.checkpoint.enabled);
        assert!(config.checkpoint.is_disabled());
        assert_eq!(config.checkpoint.min_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokenflow.yaml");
        let mut config = Config::default();
        config.storage.fsync_policy = FsyncPolicy::EveryN(10);
        config.engine.processes_dir = Some(PathBuf::from("/srv/processes"));
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.storage.fsync_policy, FsyncPolicy::EveryN(10));
        assert_eq!(loaded.engine.processes_dir, config.engine.processes_dir);

        let err = Config::from_file(dir.path().join("missing.yaml")).unwrap_err();
        assert!(err.to_string().starts_with("failed to read config file"));
    }

    #[test]
    fn test_fsync_policy_parse() {
        assert_eq!(FsyncPolicy::parse("never"), FsyncPolicy::Never);
        assert_eq!(FsyncPolicy::parse("every_n:25"), FsyncPolicy::EveryN(25));
        assert_eq!(FsyncPolicy::parse("EVERY_MS:5"), FsyncPolicy::EveryMs(5));
        assert_eq!(FsyncPolicy::parse("bogus"), FsyncPolicy::EveryWrite);
        assert_eq!(
            tokenflow_wal::FsyncPolicy::from(FsyncPolicy::EveryN(3)),
            tokenflow_wal::FsyncPolicy::EveryN(3)
        );
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.job_executor.max_workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
