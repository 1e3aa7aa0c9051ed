use crate::broadcast::DEFAULT_DELIVERY_TIMEOUT;
use crate::core::cache::DEFAULT_STALENESS_WINDOW;
use crate::scheduler::DEFAULT_REFRESH_INTERVAL;
use anyhow::{Context, Result, ensure};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path::PathBuf};
use tracing::debug;

pub const API_KEY_ENV: &str = "COINMARKETCAP_API_KEY";

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            base_url: "https://pro-api.coinmarketcap.com".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// Keep the last rate on disk; when false the cache lives in memory only.
    pub persist: bool,
    pub staleness_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            persist: true,
            staleness_secs: DEFAULT_STALENESS_WINDOW.as_secs(),
        }
    }
}

impl CacheConfig {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            interval_secs: DEFAULT_REFRESH_INTERVAL.as_secs(),
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BroadcastConfig {
    /// How long one update may wait on a subscriber before moving on.
    pub delivery_timeout_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastConfig {
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT.as_millis() as u64,
        }
    }
}

impl BroadcastConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub cache: CacheConfig,
    pub schedule: ScheduleConfig,
    pub broadcast: BroadcastConfig,
    pub data_path: Option<String>,
    pub log_file: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("io", "btcrate", "btcrate")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn default_data_path(&self) -> Result<PathBuf> {
        if let Some(custom_path) = &self.data_path {
            return Ok(PathBuf::from(custom_path));
        }
        let proj_dirs = ProjectDirs::from("io", "btcrate", "btcrate")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.data_dir().to_path_buf())
    }

    pub fn cache_file_path(&self) -> Result<PathBuf> {
        Ok(self.default_data_path()?.join("cache").join("btc_rate.json"))
    }

    pub fn log_file_path(&self) -> Result<PathBuf> {
        if let Some(custom_path) = &self.log_file {
            return Ok(PathBuf::from(custom_path));
        }
        Ok(self.default_data_path()?.join("btc_rate.log"))
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::from_yaml(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))
    }

    pub fn from_yaml(config_str: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(config_str)?;
        if config.source.api_key.is_none() {
            config.source.api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        }
        config.validate()?;
        debug!("Successfully loaded config");
        Ok(config)
    }

    /// Rejects zero durations; none of the timers accept them.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.source.timeout_secs > 0,
            "source.timeout_secs must be greater than zero"
        );
        ensure!(
            self.schedule.interval_secs > 0,
            "schedule.interval_secs must be greater than zero"
        );
        ensure!(
            self.broadcast.delivery_timeout_ms > 0,
            "broadcast.delivery_timeout_ms must be greater than zero"
        );
        Ok(())
    }
}
