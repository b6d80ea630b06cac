//! Config loading and persistence.
//!
//! Every threshold the compaction policy consults lives here and is threaded
//! through construction; nothing reads process-wide state.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manager::log::StorageLevel;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {path}: {reason}")]
    Write { path: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub snapshot: SnapshotOptions,
    pub storage: StorageOptions,
    pub load: LoadOptions,
    pub session: SessionOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotOptions {
    /// How often the snapshot routine runs.
    pub interval_ms: u64,
    /// Delay between checks that all sessions caught up to a pending
    /// snapshot.
    pub completion_delay_ms: u64,
    /// Base delay before compacting under high load; the actual delay is
    /// randomized around it.
    pub compact_delay_ms: u64,
    /// Completion checks before a pending snapshot is abandoned and left
    /// for the next cycle.
    pub max_completion_rounds: u32,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            completion_delay_ms: 10_000,
            compact_delay_ms: 10_000,
            max_completion_rounds: 30,
        }
    }
}

impl SnapshotOptions {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn completion_delay(&self) -> Duration {
        Duration::from_millis(self.completion_delay_ms)
    }

    pub fn compact_delay(&self) -> Duration {
        Duration::from_millis(self.compact_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    pub level: StorageLevel,
    /// Segment size of the underlying log; disk pressure leaves headroom
    /// for a few of these.
    pub max_segment_size: u64,
    /// Minimum usable/total disk ratio before compaction is forced.
    pub free_disk_buffer: f64,
    /// Minimum free/total memory ratio before compaction is forced
    /// (memory-backed storage only).
    pub free_memory_buffer: f64,
    /// When false, every snapshot cycle compacts regardless of load.
    pub dynamic_compaction: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            level: StorageLevel::Disk,
            max_segment_size: 32 * 1024 * 1024,
            free_disk_buffer: 0.2,
            free_memory_buffer: 0.2,
            dynamic_compaction: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Sliding window the load monitor counts events over.
    pub window_ms: u64,
    /// Events within the window beyond which the server counts as under
    /// high load.
    pub high_load_threshold: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            window_ms: 5_000,
            high_load_threshold: 500,
        }
    }
}

impl LoadOptions {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Applied when an OpenSession entry carries no timeout.
    pub default_timeout_ms: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

pub fn write(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    }
    let contents = toml::to_string_pretty(config)?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let write_err = |reason: String| ConfigError::Write {
        path: path.display().to_string(),
        reason,
    };
    let dir = path
        .parent()
        .ok_or_else(|| write_err("config path missing parent directory".to_string()))?;
    let temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| write_err(format!("failed to create temp file: {e}")))?;
    fs::write(temp.path(), data).map_err(|e| write_err(format!("temp write failed: {e}")))?;
    temp.persist(path)
        .map_err(|e| write_err(format!("persist failed: {e}")))?;
    Ok(())
}
