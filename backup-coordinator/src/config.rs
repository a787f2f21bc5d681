//! Run configuration for the coordinator.
//!
//! Loaded from a TOML file; every field has a default so a minimal file (or
//! none at all) still yields a usable local configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Cluster layout: one entry per segment, used to locate segment-side
    /// artifacts (data files, TOCs, error sentinels) in single-file mode.
    #[serde(default)]
    pub segments: Vec<SegmentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub content: i32,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connection string for the coordinator node.
    #[serde(default = "default_conninfo")]
    pub conninfo: String,

    /// Number of parallel COPY workers; each owns one connection.
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory for coordinator-side artifacts (TOC, metadata, oid list).
    #[serde(default = "default_backup_dir")]
    pub directory: PathBuf,

    /// Multiplex all table data through per-oid pipes into one file per
    /// segment, instead of one file per table.
    #[serde(default)]
    pub single_data_file: bool,

    /// Gzip level for data files; 0 disables compression.
    #[serde(default)]
    pub compression_level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_conninfo() -> String {
    "host=localhost user=gpadmin dbname=postgres".to_string()
}

fn default_jobs() -> usize {
    1
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/tmp/backups")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            conninfo: default_conninfo(),
            jobs: default_jobs(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            directory: default_backup_dir(),
            single_data_file: false,
            compression_level: 0,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Shell command for segment-side compression in multi-file mode.
    pub fn compression_program(&self) -> Option<String> {
        if self.backup.compression_level > 0 && !self.backup.single_data_file {
            Some(format!("gzip -c -{}", self.backup.compression_level))
        } else {
            None
        }
    }
}
