//! Configuration for media-allocator

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable holding the link signing secret
pub const LINK_SECRET_ENV: &str = "MEDIA_ALLOCATOR_LINK_SECRET";

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("media-allocator")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Days an exclusion stays active after an allocation expires
    #[serde(default = "default_cooldown_days")]
    pub cooldown_days: u32,

    /// Pickup deadline applied when minting (hours from mint time)
    #[serde(default = "default_notify_ttl_hours")]
    pub notify_ttl_hours: u64,

    /// Lifetime of a signed link, independent of the pickup deadline
    #[serde(default = "default_link_ttl_secs")]
    pub link_ttl_secs: u64,

    /// Base URL that minted links are built on
    #[serde(default = "default_link_base_url")]
    pub link_base_url: String,

    /// HMAC secret for link signatures (usually supplied via env)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_signing_secret: Option<String>,

    /// Allocations fetched per page by the expiry sweep
    #[serde(default = "default_expiry_page_size")]
    pub expiry_page_size: usize,

    /// SQLite busy timeout
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Interval between expiry sweeps in watch mode
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_cooldown_days() -> u32 {
    14
}

fn default_notify_ttl_hours() -> u64 {
    7 * 24
}

fn default_link_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_link_base_url() -> String {
    "http://localhost:8090/pickup/".to_string()
}

fn default_expiry_page_size() -> usize {
    500
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_sweep_interval() -> u64 {
    3600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            cooldown_days: default_cooldown_days(),
            notify_ttl_hours: default_notify_ttl_hours(),
            link_ttl_secs: default_link_ttl_secs(),
            link_base_url: default_link_base_url(),
            link_signing_secret: None,
            expiry_page_size: default_expiry_page_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get database path
    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join("allocator.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.cooldown_days))
    }

    pub fn notify_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.notify_ttl_hours as i64)
    }

    pub fn link_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.link_ttl_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("cooldown_days = 3\n").unwrap();
        assert_eq!(config.cooldown_days, 3);
        assert_eq!(config.expiry_page_size, 500);
        assert_eq!(config.cooldown(), chrono::Duration::days(3));
        assert!(config.link_signing_secret.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage_dir = temp_dir.path().to_path_buf();
        config.link_ttl_secs = 60;

        config.save(config.config_path()).unwrap();
        let loaded = Config::load(config.config_path()).unwrap();

        assert_eq!(loaded.link_ttl_secs, 60);
        assert_eq!(loaded.db_path(), temp_dir.path().join("allocator.db"));
    }
}
