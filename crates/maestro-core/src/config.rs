//! Configuration types for the state store, agent pool, transactions, and checkpoints.

use crate::error::{OrchestrationError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete orchestration configuration.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// State store configuration
    pub state_store: StateStoreConfig,
    /// Agent pool configuration
    pub pool: PoolConfig,
    /// Transaction log configuration
    pub transactions: TransactionConfig,
    /// Checkpoint configuration
    pub checkpoint: CheckpointConfig,
}

/// State store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateStoreConfig {
    /// How many times a strong read may be re-queued behind pending writes
    /// before it degrades to an eventual read
    pub max_strong_retries: u32,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            max_strong_retries: 10,
        }
    }
}

/// Agent pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum live instances per agent type
    pub max_per_type: usize,
    /// How long `acquire` waits for a free instance
    pub acquire_timeout_ms: u64,
    /// Idle time after which an available instance is evicted
    pub idle_timeout_ms: u64,
    /// Interval of the idle eviction sweep
    pub eviction_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_type: 3,
            acquire_timeout_ms: 30_000,
            idle_timeout_ms: 300_000,
            eviction_interval_ms: 60_000,
        }
    }
}

impl PoolConfig {
    /// Acquire timeout as a `Duration`.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Idle threshold as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Eviction sweep interval as a `Duration`, never shorter than 1ms.
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms.max(1))
    }
}

/// Transaction log configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// How long finished transactions stay observable
    pub gc_grace_ms: u64,
    /// Upper bound on finished transactions retained during the grace period
    pub max_retained: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            gc_grace_ms: 60_000,
            max_retained: 256,
        }
    }
}

impl TransactionConfig {
    /// Grace period as a `Duration`.
    pub fn gc_grace(&self) -> Duration {
        Duration::from_millis(self.gc_grace_ms)
    }
}

/// Checkpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Control directory, relative to the workspace root
    pub control_dir: PathBuf,
    /// Live checkpoint file name inside the control directory
    pub file_name: String,
    /// History directory name inside the control directory
    pub history_dir: String,
    /// Number of archived checkpoints to keep
    pub max_history: usize,
    /// Autosave interval in seconds (0 disables autosave)
    pub autosave_interval_seconds: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            control_dir: PathBuf::from(".maestro"),
            file_name: "checkpoint.json".to_owned(),
            history_dir: "checkpoints".to_owned(),
            max_history: 50,
            autosave_interval_seconds: 300,
        }
    }
}

impl CheckpointConfig {
    /// Live checkpoint path for a workspace.
    pub fn live_path(&self, workspace_root: &Path) -> PathBuf {
        workspace_root.join(&self.control_dir).join(&self.file_name)
    }

    /// History directory for a workspace.
    pub fn history_path(&self, workspace_root: &Path) -> PathBuf {
        workspace_root.join(&self.control_dir).join(&self.history_dir)
    }
}

impl OrchestrationConfig {
    /// Get the default config directory path (`~/.maestro`)
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| {
            OrchestrationError::Config("Could not determine home directory".to_owned())
        })?;
        Ok(home.join(".maestro"))
    }

    /// Get the default config file path (`~/.maestro/config.toml`)
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from the default location, creating it with defaults if missing
    ///
    /// # Errors
    /// Returns an error if the config cannot be read, parsed, or created
    pub fn load_or_create() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load config from a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or fails validation
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|error| {
            OrchestrationError::Config(format!("Failed to read config: {error}"))
        })?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        tracing::debug!(
            "Loaded config from {:?}: max_per_type={}, max_strong_retries={}",
            path,
            config.pool.max_per_type,
            config.state_store.max_strong_retries
        );

        Ok(config)
    }

    /// Save config to a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be written
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                OrchestrationError::Config(format!("Failed to create config directory: {error}"))
            })?;
        }

        let contents = toml::to_string_pretty(self).map_err(|error| {
            OrchestrationError::Config(format!("Failed to serialize config: {error}"))
        })?;

        let header = "# Maestro Configuration File\n\
                      # This file is automatically generated on first run\n\
                      # Edit this file to customize your settings\n\n";

        fs::write(path, format!("{header}{contents}")).map_err(|error| {
            OrchestrationError::Config(format!("Failed to write config: {error}"))
        })?;

        Ok(())
    }

    /// Reject settings the engine cannot run with.
    ///
    /// # Errors
    /// Returns a configuration error naming the offending field
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_per_type == 0 {
            return Err(OrchestrationError::Config(
                "pool.max_per_type must be at least 1".to_owned(),
            ));
        }
        if self.pool.acquire_timeout_ms == 0 {
            return Err(OrchestrationError::Config(
                "pool.acquire_timeout_ms must be positive".to_owned(),
            ));
        }
        if self.pool.eviction_interval_ms == 0 {
            return Err(OrchestrationError::Config(
                "pool.eviction_interval_ms must be positive".to_owned(),
            ));
        }
        if self.transactions.max_retained == 0 {
            return Err(OrchestrationError::Config(
                "transactions.max_retained must be at least 1".to_owned(),
            ));
        }
        if self.checkpoint.max_history == 0 {
            return Err(OrchestrationError::Config(
                "checkpoint.max_history must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::assertions_on_result_states,
    reason = "Test code has different conventions"
)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = OrchestrationConfig::default();
        assert_eq!(config.state_store.max_strong_retries, 10);
        assert_eq!(config.pool.acquire_timeout_ms, 30_000);
        assert_eq!(config.checkpoint.file_name, "checkpoint.json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let mut file = match NamedTempFile::new() {
            Ok(file) => file,
            Err(error) => panic!("create temp file: {error}"),
        };
        let toml_content = r#"
[pool]
max_per_type = 2
acquire_timeout_ms = 500
"#;
        if let Err(error) = file.write_all(toml_content.as_bytes()) {
            panic!("write temp file: {error}");
        }

        let config = match OrchestrationConfig::load_from_file(file.path()) {
            Ok(config) => config,
            Err(error) => panic!("load failed: {error}"),
        };
        assert_eq!(config.pool.max_per_type, 2);
        assert_eq!(config.pool.acquire_timeout_ms, 500);
        assert_eq!(config.pool.idle_timeout_ms, 300_000);
        assert_eq!(config.transactions, TransactionConfig::default());
    }

    #[test]
    fn test_invalid_pool_capacity_rejected() {
        let mut file = match NamedTempFile::new() {
            Ok(file) => file,
            Err(error) => panic!("create temp file: {error}"),
        };
        if let Err(error) = file.write_all(b"[pool]\nmax_per_type = 0\n") {
            panic!("write temp file: {error}");
        }

        let result = OrchestrationConfig::load_from_file(file.path());
        assert!(matches!(result, Err(OrchestrationError::Config(_))));
    }

    #[test]
    fn test_zero_checkpoint_history_rejected() {
        let mut config = OrchestrationConfig::default();
        config.checkpoint.max_history = 0;
        assert!(matches!(config.validate(), Err(OrchestrationError::Config(_))));

        config.checkpoint.max_history = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_eviction_interval_never_zero() {
        let pool = PoolConfig {
            eviction_interval_ms: 0,
            ..PoolConfig::default()
        };
        assert_eq!(pool.eviction_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("create temp dir: {error}"),
        };
        let path = dir.path().join("nested").join("config.toml");

        let mut config = OrchestrationConfig::default();
        config.checkpoint.max_history = 7;
        if let Err(error) = config.save_to_file(&path) {
            panic!("save failed: {error}");
        }

        let reloaded = match OrchestrationConfig::load_from_file(&path) {
            Ok(config) => config,
            Err(error) => panic!("reload failed: {error}"),
        };
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_checkpoint_paths() {
        let config = CheckpointConfig::default();
        let root = Path::new("/work");
        assert_eq!(
            config.live_path(root),
            PathBuf::from("/work/.maestro/checkpoint.json")
        );
        assert_eq!(
            config.history_path(root),
            PathBuf::from("/work/.maestro/checkpoints")
        );
    }
}
