use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub server: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Dashboard refresh interval in milliseconds.
    pub interval_ms: u64,
    /// Window during which a repeated fetch for the same resource is served
    /// from cache instead of hitting the network.
    pub cache_window_ms: u64,
    /// How often to re-check whether a pause/resume/kill took effect.
    pub confirm_interval_ms: u64,
    /// Maximum confirmation checks before giving up (informational only).
    pub confirm_attempts: u32,
    /// How long an announced-but-never-listed download is kept as a
    /// placeholder before being dropped.
    pub placeholder_ttl_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            cache_window_ms: 5_000,
            confirm_interval_ms: 1_000,
            confirm_attempts: 5,
            placeholder_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiConfig {
    /// Last-used theme name, restored on the next launch.
    pub theme: Option<String>,
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "downlink", "downlink")
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

        let config_dir = proj_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;

        Ok(config_dir.join("config.toml"))
    }

    /// Directory for durable client-side state (session credentials,
    /// paused-progress snapshots).
    pub fn data_dir() -> Option<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "downlink", "downlink")?;
        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir).ok()?;
        Some(data_dir)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll.interval_ms)
    }

    pub fn cache_window(&self) -> Duration {
        Duration::from_millis(self.poll.cache_window_ms)
    }

    pub fn confirm_interval(&self) -> Duration {
        Duration::from_millis(self.poll.confirm_interval_ms)
    }

    pub fn placeholder_ttl(&self) -> Duration {
        Duration::from_secs(self.poll.placeholder_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.poll.interval_ms, 10_000);
        assert_eq!(config.poll.cache_window_ms, 5_000);
        assert_eq!(config.poll.confirm_attempts, 5);
        assert!(config.remote.server.is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [remote]
            server = "https://relay.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.remote.server.as_deref(),
            Some("https://relay.example.com")
        );
        assert_eq!(config.poll.placeholder_ttl_secs, 600);
    }
}
