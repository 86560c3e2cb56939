use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppError, Result};

const APP_DIR: &str = "research-store";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// How long SQLite itself waits on a locked database before reporting busy.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default = "default_research_timeout")]
    pub research_timeout_secs: u64,
}

/// Backoff applied when a whole operation fails with lock contention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("research.db")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_research_timeout() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    2_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            retry: RetryConfig::default(),
            research_timeout_secs: default_research_timeout(),
        }
    }
}

impl Config {
    /// Defaults, but with the database at `db_path`.
    pub fn for_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn research_timeout(&self) -> Duration {
        Duration::from_secs(self.research_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(AppError::Config("db_path must not be empty".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "db_path = \"/tmp/x/research.db\"\n[retry]\nmax_attempts = 2\n")
            .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/x/research.db"));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 50);
        assert_eq!(config.busy_timeout_ms, 5_000);
        assert_eq!(config.research_timeout_secs, 300);
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[retry]\nmax_attempts = 0\n").unwrap();

        assert!(matches!(Config::load_from(&path), Err(AppError::Config(_))));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 500,
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(400));
        assert_eq!(retry.delay_for(4), Duration::from_millis(500));
        assert_eq!(retry.delay_for(40), Duration::from_millis(500));
    }
}
