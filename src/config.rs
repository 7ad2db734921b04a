//! Queue configuration.
//!
//! Controls the per-topic maintenance worker: how often metadata is exported
//! and how often (and for how long) in-flight messages are scanned for
//! recycling.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_secs(20);
const DEFAULT_CLEAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the queue engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Interval between metadata exports of a topic and its lines.
    /// Default: 10 s
    #[serde(rename = "backup_interval_ms", with = "millis")]
    pub backup_interval: Duration,

    /// Interval between recycle scans.
    /// Default: 20 s
    #[serde(rename = "clean_interval_ms", with = "millis")]
    pub clean_interval: Duration,

    /// Time budget of one recycle scan. Lines left over when the budget is
    /// spent are scanned on the next tick.
    /// Default: 5 s
    #[serde(rename = "clean_timeout_ms", with = "millis")]
    pub clean_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backup_interval: DEFAULT_BACKUP_INTERVAL,
            clean_interval: DEFAULT_CLEAN_INTERVAL,
            clean_timeout: DEFAULT_CLEAN_TIMEOUT,
        }
    }
}

impl QueueConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: QueueConfig = serde_json::from_slice(&data)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Zero intervals would spin the maintenance worker.
    pub fn validate(&self) -> crate::Result<()> {
        if self.backup_interval.is_zero() {
            return Err(crate::Error::InvalidConfig("backup_interval_ms must be positive"));
        }
        if self.clean_interval.is_zero() {
            return Err(crate::Error::InvalidConfig("clean_interval_ms must be positive"));
        }
        Ok(())
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
