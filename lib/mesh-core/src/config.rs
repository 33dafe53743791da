//! Discovery configuration loaded from YAML and environment variables

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable pointing at a YAML configuration file
pub const CONFIG_PATH_ENV: &str = "MESH_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a cached service stays fresh. 0 disables TTL caching.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Router id stamped on every route; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    /// Static default gateway address
    #[serde(default)]
    pub gateway: Option<String>,
    /// Keep a routing table in sync with the registry
    #[serde(default = "default_cache")]
    pub cache: bool,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_min_refresh_interval")]
    pub min_refresh_interval_secs: u64,
    #[serde(default = "default_watch_retry_delay")]
    pub watch_retry_delay_ms: u64,
}

fn default_ttl() -> u64 {
    60
}

fn default_cache() -> bool {
    true
}

fn default_refresh_interval() -> u64 {
    120
}

fn default_min_refresh_interval() -> u64 {
    60
}

fn default_watch_retry_delay() -> u64 {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            id: None,
            gateway: None,
            cache: default_cache(),
            refresh_interval_secs: default_refresh_interval(),
            min_refresh_interval_secs: default_min_refresh_interval(),
            watch_retry_delay_ms: default_watch_retry_delay(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl RouterConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn min_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.min_refresh_interval_secs)
    }

    pub fn watch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.watch_retry_delay_ms)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CoreError::InvalidConfiguration(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml(&contents).map_err(|e| match e {
            CoreError::InvalidConfiguration(msg) => {
                CoreError::InvalidConfiguration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| CoreError::InvalidConfiguration(format!("failed to parse config: {}", e)))
    }

    /// Build configuration from the environment.
    ///
    /// Starts from the file named by `MESH_CONFIG` (or defaults) and applies
    /// `MESH_*` overrides on top.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                debug!("Loading configuration from {}", path);
                Self::load(path)?
            }
            Err(_) => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `MESH_*` overrides using `lookup` to resolve variables
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ttl) = lookup("MESH_CACHE_TTL_SECS") {
            self.cache.ttl_secs = parse_secs("MESH_CACHE_TTL_SECS", &ttl)?;
        }
        if let Some(id) = lookup("MESH_ROUTER_ID") {
            self.router.id = Some(id);
        }
        if let Some(gateway) = lookup("MESH_ROUTER_GATEWAY") {
            self.router.gateway = if gateway.is_empty() { None } else { Some(gateway) };
        }
        if let Some(interval) = lookup("MESH_ROUTER_REFRESH_INTERVAL_SECS") {
            self.router.refresh_interval_secs =
                parse_secs("MESH_ROUTER_REFRESH_INTERVAL_SECS", &interval)?;
        }
        if let Some(interval) = lookup("MESH_ROUTER_MIN_REFRESH_INTERVAL_SECS") {
            self.router.min_refresh_interval_secs =
                parse_secs("MESH_ROUTER_MIN_REFRESH_INTERVAL_SECS", &interval)?;
        }
        Ok(())
    }

    /// Reject settings the router cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.router.refresh_interval_secs == 0 {
            return Err(CoreError::InvalidConfiguration(
                "router.refresh_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.router.min_refresh_interval_secs > self.router.refresh_interval_secs {
            return Err(CoreError::InvalidConfiguration(format!(
                "router.min_refresh_interval_secs ({}) exceeds router.refresh_interval_secs ({})",
                self.router.min_refresh_interval_secs, self.router.refresh_interval_secs
            )));
        }
        if self.cache.ttl_secs == 0 {
            warn!("cache.ttl_secs is 0, service cache will not watch or hold fresh entries");
        }
        Ok(())
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| {
        CoreError::InvalidConfiguration(format!("{} must be a number of seconds, got {:?}", key, value))
    })
}
