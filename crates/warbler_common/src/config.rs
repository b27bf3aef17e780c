use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WarblerError, WarblerResult};

/// Top-level configuration (`warbler.toml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarblerConfig {
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub journal: JournalConfig,
}

/// Write-batching section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum staleness of a pending write in milliseconds (default: 1000).
    /// 0 disables batching: every submit commits before returning.
    pub batch_window_ms: u64,
    /// Resolution of the fallback timer in milliseconds (default: 1).
    /// The timer delay is the batch window rounded up to a multiple of this.
    pub timer_granularity_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: 1000,
            timer_granularity_ms: 1,
        }
    }
}

impl BatchConfig {
    /// Window-zero mode: no queue, no timer.
    pub fn synchronous() -> Self {
        Self {
            batch_window_ms: 0,
            ..Self::default()
        }
    }

    pub fn with_window_ms(batch_window_ms: u64) -> Self {
        Self {
            batch_window_ms,
            ..Self::default()
        }
    }

    pub fn is_synchronous(&self) -> bool {
        self.batch_window_ms == 0
    }

    /// Delay before the fallback timer fires: the batch window rounded up to
    /// the timer granularity.
    pub fn fallback_delay(&self) -> Duration {
        let granularity = self.timer_granularity_ms.max(1);
        let ticks = self.batch_window_ms.div_ceil(granularity);
        Duration::from_millis(ticks.saturating_mul(granularity))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.timer_granularity_ms == 0 {
            return Err("timer_granularity_ms must be >= 1".into());
        }
        Ok(())
    }
}

/// How hard the journal pushes each commit to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalSyncMode {
    /// Flush userspace buffers only.
    None,
    /// `fsync` after every commit.
    FSync,
    /// `fdatasync` after every commit.
    #[default]
    FDataSync,
}

/// Durable change journal section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Journal committed changes to disk (default: false, in-memory only).
    pub enabled: bool,
    /// Root directory; each namespace gets its own subdirectory.
    pub dir: String,
    pub sync_mode: JournalSyncMode,
    /// Rotate to a new segment once the current one exceeds this size.
    pub max_segment_bytes: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: "./warbler-data".to_string(),
            sync_mode: JournalSyncMode::default(),
            max_segment_bytes: 64 * 1024 * 1024,
        }
    }
}

impl JournalConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if self.dir.trim().is_empty() {
            return Err("journal.dir must be set when the journal is enabled".into());
        }
        // Segment header is 8 bytes; anything smaller rotates on every record.
        if self.max_segment_bytes < 1024 {
            return Err("journal.max_segment_bytes must be >= 1024".into());
        }
        Ok(())
    }
}

impl WarblerConfig {
    pub fn from_toml_str(content: &str) -> WarblerResult<Self> {
        let config: WarblerConfig =
            toml::from_str(content).map_err(|e| WarblerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> WarblerResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WarblerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> WarblerResult<()> {
        self.batch.validate().map_err(WarblerError::Config)?;
        self.journal.validate().map_err(WarblerError::Config)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> WarblerResult<String> {
        toml::to_string_pretty(self).map_err(|e| WarblerError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WarblerConfig::default();
        assert_eq!(config.batch.batch_window_ms, 1000);
        assert_eq!(config.batch.timer_granularity_ms, 1);
        assert!(!config.journal.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fallback_delay_rounds_up_to_granularity() {
        let cfg = BatchConfig {
            batch_window_ms: 250,
            timer_granularity_ms: 1000,
        };
        assert_eq!(cfg.fallback_delay(), Duration::from_secs(1));

        let cfg = BatchConfig {
            batch_window_ms: 250,
            timer_granularity_ms: 1,
        };
        assert_eq!(cfg.fallback_delay(), Duration::from_millis(250));

        let cfg = BatchConfig {
            batch_window_ms: 1001,
            timer_granularity_ms: 500,
        };
        assert_eq!(cfg.fallback_delay(), Duration::from_millis(1500));
    }

    #[test]
    fn test_window_zero_is_synchronous() {
        assert!(BatchConfig::synchronous().is_synchronous());
        assert!(!BatchConfig::with_window_ms(5).is_synchronous());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = WarblerConfig::from_toml_str(
            r#"
            [batch]
            batch_window_ms = 0

            [journal]
            enabled = true
            dir = "/var/lib/warbler"
            sync_mode = "fsync"
            "#,
        )
        .unwrap();
        assert!(config.batch.is_synchronous());
        assert_eq!(config.batch.timer_granularity_ms, 1);
        assert!(config.journal.enabled);
        assert_eq!(config.journal.sync_mode, JournalSyncMode::FSync);
        assert_eq!(config.journal.max_segment_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_zero_granularity_rejected() {
        let err = WarblerConfig::from_toml_str("[batch]\ntimer_granularity_ms = 0\n").unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("timer_granularity_ms"));
    }

    #[test]
    fn test_enabled_journal_needs_dir() {
        let mut config = WarblerConfig::default();
        config.journal.enabled = true;
        config.journal.dir = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_via_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warbler.toml");
        let mut config = WarblerConfig::default();
        config.batch.batch_window_ms = 42;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();
        assert_eq!(WarblerConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = WarblerConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, WarblerError::Config(_)));
    }
}
