use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use crate::core::Result;

pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Remote service location
#[derive(Deserialize, Debug, Clone)]
pub struct RemoteConfig {
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

/// Engine tuning
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Uploads transferring at the same time
    pub max_concurrent: usize,
    /// Chunk size requested from the server
    pub chunk_size: u64,
    /// Chunks between two checkpoints
    pub checkpoint_interval: u64,
    pub progress_interval_ms: u64,
    /// Fallback poll while the scheduler waits for a free slot
    pub slot_poll_interval_ms: u64,
    pub watchdog_interval_secs: u64,
    /// A pass idle for longer than this with work queued is restarted
    pub watchdog_stall_secs: u64,
    pub retention_days: i64,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            chunk_size: DEFAULT_CHUNK_SIZE,
            checkpoint_interval: 20,
            progress_interval_ms: 100,
            slot_poll_interval_ms: 500,
            watchdog_interval_secs: 30,
            watchdog_stall_secs: 60,
            retention_days: 7,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn slot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.slot_poll_interval_ms.max(1))
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs.max(1))
    }

    pub fn watchdog_stall(&self) -> Duration {
        Duration::from_secs(self.watchdog_stall_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

/// Demo binary configuration, read from `config.toml`
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub remote: RemoteConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub store_dir: PathBuf,
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Config> {
        Ok(toml::from_str(content)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_engine_fields() {
        let config = Config::from_toml(
            r#"
            store_dir = "/tmp/uploads"
            files = ["a.bin"]

            [remote]
            endpoint = "http://localhost:8080/api"

            [engine]
            max_concurrent = 5
            "#,
        )
        .unwrap();

        assert!(config.remote.endpoint.starts_with("http"));
        assert_eq!(config.remote.timeout_secs, 300);
        assert_eq!(config.engine.max_concurrent, 5);
        assert_eq!(config.engine.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.engine.checkpoint_interval, 20);
        assert_eq!(config.engine.retention(), chrono::Duration::days(7));
    }

    #[test]
    fn test_missing_remote_is_an_error() {
        assert!(Config::from_toml("store_dir = \"x\"").is_err());
    }
}
