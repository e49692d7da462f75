//! TOML configuration for the server and for harvester agents.
//!
//! The server reads `config/harvest.toml` (`--config`):
//!
//! ```toml
//! [db]
//! path = "./data/harvest.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:8730"
//! max_upload_bytes = 2000000
//! sleep_time = 10
//! default_stable_time = 60
//! ```
//!
//! A harvester keeps its registration in a separate settings file
//! (`--settings`, default `harvester.toml`) written by `harvest setup` and
//! re-read at the start of every cycle.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Smallest accepted `max_upload_bytes`; anything lower cannot hold a chunk envelope.
pub const MIN_UPLOAD_BYTES: usize = 1024;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Seconds a harvester sleeps between cycles.
    #[serde(default = "default_sleep_time")]
    pub sleep_time: u64,
    /// Stability window given to new monitored paths unless overridden.
    #[serde(default = "default_stable_time")]
    pub default_stable_time: u64,
}

fn default_bind() -> String {
    "127.0.0.1:8730".to_string()
}
fn default_max_upload_bytes() -> usize {
    2_000_000
}
fn default_sleep_time() -> u64 {
    10
}
fn default_stable_time() -> u64 {
    60
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.server.max_upload_bytes < MIN_UPLOAD_BYTES {
        anyhow::bail!("server.max_upload_bytes must be >= {}", MIN_UPLOAD_BYTES);
    }
    if config.server.sleep_time == 0 {
        anyhow::bail!("server.sleep_time must be >= 1");
    }

    Ok(config)
}

/// Registration and transport settings of one harvester agent.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HarvesterSettings {
    pub server_url: String,
    pub harvester_id: i64,
    pub name: String,
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_registration_retries")]
    pub registration_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_registration_retries() -> u32 {
    5
}
fn default_retry_delay_secs() -> u64 {
    2
}

impl HarvesterSettings {
    /// Unregistered settings for `server_url` with default transport options.
    pub fn unregistered(server_url: &str, name: &str) -> Self {
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            harvester_id: 0,
            name: name.to_string(),
            api_key: String::new(),
            timeout_secs: default_timeout_secs(),
            registration_retries: default_registration_retries(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read harvester settings {} (run `harvest setup` first)",
                path.display()
            )
        })?;
        let settings: HarvesterSettings =
            toml::from_str(&content).with_context(|| "Failed to parse harvester settings")?;
        if settings.server_url.trim().is_empty() {
            anyhow::bail!("server_url must not be empty");
        }
        if settings.api_key.is_empty() {
            anyhow::bail!("api_key must not be empty");
        }
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write harvester settings {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_server_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("harvest.toml");
        std::fs::write(&path, "[db]\npath = \"h.sqlite\"\n\n[server]\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.server.max_upload_bytes, 2_000_000);
        assert_eq!(config.server.sleep_time, 10);
        assert_eq!(config.server.default_stable_time, 60);
    }

    #[test]
    fn test_tiny_upload_limit_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("harvest.toml");
        std::fs::write(
            &path,
            "[db]\npath = \"h.sqlite\"\n\n[server]\nmax_upload_bytes = 10\n",
        )
        .unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("max_upload_bytes"));
    }

    #[test]
    fn test_settings_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("harvester.toml");
        let settings = HarvesterSettings {
            server_url: "http://localhost:8730".into(),
            harvester_id: 4,
            name: "rig-4".into(),
            api_key: "abc".into(),
            timeout_secs: 5,
            registration_retries: 1,
            retry_delay_secs: 0,
        };
        settings.save(&path).unwrap();
        assert_eq!(HarvesterSettings::load(&path).unwrap(), settings);
    }
}
