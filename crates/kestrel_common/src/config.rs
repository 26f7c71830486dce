use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, KestrelResult};

/// Top-level tablet server configuration (`kestrel.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KestrelConfig {
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub pools: PoolsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Maintenance manager configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Worker threads for background operations.
    pub num_threads: usize,
    /// Monitor wakeup period in milliseconds.
    pub polling_interval_ms: u64,
    /// Memory budget in bytes. Negative means "detect total system
    /// memory at init".
    pub memory_limit: i64,
    /// Age override threshold: an op anchoring a transaction older than
    /// this many seconds is scheduled regardless of perf improvement.
    pub max_ts_anchored_secs: u64,
    /// Capacity of the completed-operations history ring.
    pub history_size: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            num_threads: 4,
            polling_interval_ms: 250,
            memory_limit: -1,
            max_ts_anchored_secs: 120,
            history_size: 32,
        }
    }
}

/// Execution pool sizing for the operation driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolsConfig {
    /// Threads in the prepare pool.
    pub prepare_threads: usize,
    /// Threads in the apply pool.
    pub apply_threads: usize,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            prepare_threads: cpus.min(8),
            apply_threads: cpus.min(8),
        }
    }
}

/// Log segment directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory holding the segment files.
    pub log_dir: String,
    /// Max bytes per segment before the writer seals it.
    pub max_segment_size: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: "kestrel-wal".to_string(),
            max_segment_size: 64 * 1024 * 1024,
        }
    }
}

impl KestrelConfig {
    /// Load configuration from a TOML file. Missing sections take their
    /// defaults; an unparsable file is an error.
    pub fn load_from_file(path: &Path) -> KestrelResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KestrelError::Config(format!("read {}: {e}", path.display())))?;
        let config: KestrelConfig = toml::from_str(&content)
            .map_err(|e| KestrelError::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KestrelResult<()> {
        if self.maintenance.num_threads == 0 {
            return Err(KestrelError::Config(
                "maintenance.num_threads must be > 0".into(),
            ));
        }
        if self.maintenance.history_size == 0 {
            return Err(KestrelError::Config(
                "maintenance.history_size must be > 0".into(),
            ));
        }
        if self.pools.prepare_threads == 0 || self.pools.apply_threads == 0 {
            return Err(KestrelError::Config("pool sizes must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = KestrelConfig::default();
        config.validate().unwrap();
        assert!(config.maintenance.memory_limit < 0);
        assert_eq!(config.maintenance.polling_interval_ms, 250);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
            [maintenance]
            num_threads = 2
            polling_interval_ms = 10
            memory_limit = 1000
            max_ts_anchored_secs = 60
            history_size = 4
        "#;
        let config: KestrelConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.maintenance.num_threads, 2);
        assert_eq!(config.maintenance.memory_limit, 1000);
        // Unspecified sections fall back to defaults.
        assert!(config.pools.prepare_threads > 0);
        assert_eq!(config.log.max_segment_size, 64 * 1024 * 1024);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let toml_str = r#"
            [maintenance]
            num_threads = 0
            polling_interval_ms = 10
            memory_limit = -1
            max_ts_anchored_secs = 60
            history_size = 4
        "#;
        let config: KestrelConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kestrel.toml");
        std::fs::write(
            &path,
            "[log]\nlog_dir = \"/data/wal\"\nmax_segment_size = 1048576\n",
        )
        .unwrap();
        let config = KestrelConfig::load_from_file(&path).unwrap();
        assert_eq!(config.log.log_dir, "/data/wal");
        assert_eq!(config.log.max_segment_size, 1048576);
    }
}
