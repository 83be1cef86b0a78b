//! cellwatch.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::Scope;

/// Refresh interval used when neither the watcher nor `[defaults]` sets one.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Fetch concurrency used when neither the watcher nor `[defaults]` sets one.
pub const DEFAULT_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellwatchConfig {
    pub topology: TopologyConfig,
    pub defaults: Option<DefaultsConfig>,
    #[serde(default)]
    pub watchers: Vec<WatcherEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Path of the redb topology store.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    pub refresh_interval: Option<String>,
    pub concurrency: Option<usize>,
}

/// One `[[watchers]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherEntry {
    pub cell: String,
    pub keyspace: Option<String>,
    pub shard: Option<String>,
    pub refresh_interval: Option<String>,
    pub concurrency: Option<usize>,
}

/// Fully resolved, validated settings for one watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherSettings {
    pub scope: Scope,
    pub refresh_interval: Duration,
    pub concurrency: usize,
}

impl CellwatchConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: CellwatchConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Resolve every watcher entry against `[defaults]`.
    pub fn watcher_settings(&self) -> ConfigResult<Vec<WatcherSettings>> {
        let defaults = self.defaults.clone().unwrap_or_default();
        self.watchers
            .iter()
            .map(|entry| entry.resolve(&defaults))
            .collect()
    }

    /// Scaffold a config watching a single cell.
    pub fn scaffold(topology_path: &Path, cell: &str) -> Self {
        CellwatchConfig {
            topology: TopologyConfig {
                path: topology_path.to_path_buf(),
            },
            defaults: Some(DefaultsConfig {
                refresh_interval: Some("30s".to_string()),
                concurrency: Some(DEFAULT_CONCURRENCY),
            }),
            watchers: vec![WatcherEntry {
                cell: cell.to_string(),
                keyspace: None,
                shard: None,
                refresh_interval: None,
                concurrency: None,
            }],
        }
    }
}

impl WatcherEntry {
    /// Validate this entry and fill unset fields from `defaults`.
    pub fn resolve(&self, defaults: &DefaultsConfig) -> ConfigResult<WatcherSettings> {
        if self.cell.trim().is_empty() {
            return Err(ConfigError::EmptyCell);
        }

        let scope = match (&self.keyspace, &self.shard) {
            (None, None) => Scope::Cell {
                cell: self.cell.clone(),
            },
            (Some(keyspace), Some(shard)) => Scope::ShardReplication {
                cell: self.cell.clone(),
                keyspace: keyspace.clone(),
                shard: shard.clone(),
            },
            _ => return Err(ConfigError::PartialShard(self.cell.clone())),
        };

        let refresh_interval = match self
            .refresh_interval
            .as_deref()
            .or(defaults.refresh_interval.as_deref())
        {
            Some(s) => parse_duration(s)?,
            None => DEFAULT_REFRESH_INTERVAL,
        };
        if refresh_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }

        let concurrency = self
            .concurrency
            .or(defaults.concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }

        Ok(WatcherSettings {
            scope,
            refresh_interval,
            concurrency,
        })
    }
}

/// Parse a duration string such as `"500ms"`, `"30s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());

    // Unit scale in milliseconds.
    let (digits, scale) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        return Err(invalid());
    };

    let value = digits.trim().parse::<u64>().map_err(|_| invalid())?;
    value
        .checked_mul(scale)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}
