use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::transfer::QuarantineMode;
use crate::transfer::retry::RetryPolicy;

pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;
pub const DEFAULT_MMAP_THRESHOLD: u64 = 64 * 1024 * 1024;
pub const DEFAULT_MMAP_WINDOW: u64 = 128 * 1024 * 1024;
pub const QUARANTINE_DIR_NAME: &str = "quarantine";

/// Tunables for a replication run. Every field has a default so a partial
/// `config.json` is accepted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Chunk size for streamed copies
    pub buffer_size: usize,
    /// Files at or above this size are copied through memory maps
    pub mmap_threshold: u64,
    pub mmap_window: u64,
    /// msync every mapped window before moving on
    pub safe_mmap: bool,
    pub retry: RetryPolicy,
    /// `None` resolves to a `quarantine` directory next to the source directory
    pub quarantine_dir: Option<PathBuf>,
    pub quarantine_mode: QuarantineMode,
    pub recursive: bool,
    /// `None` picks a worker count from the hardware and the batch shape
    pub workers: Option<usize>,
    pub deadline_secs: Option<u64>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
            mmap_window: DEFAULT_MMAP_WINDOW,
            safe_mmap: true,
            retry: RetryPolicy::default(),
            quarantine_dir: None,
            quarantine_mode: QuarantineMode::Immediate,
            recursive: false,
            workers: None,
            deadline_secs: None,
        }
    }
}

impl ReplicationConfig {
    /// Load configuration: explicit path first, then `~/.verifile/config.json`,
    /// falling back to defaults when neither exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::read_from(p);
        }
        if let Some(home) = dirs::home_dir() {
            let candidate = app_dir_path(&home).join("config.json");
            if candidate.exists() {
                return Self::read_from(&candidate);
            }
        }
        Ok(Self::default())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config JSON in {}", path.display()))?;
        Ok(cfg)
    }
}

fn app_dir_path(home: &Path) -> PathBuf {
    home.join(".".to_owned() + env!("CARGO_PKG_NAME"))
}

/// Ensure `~/.verifile` exists and return it.
pub fn ensure_app_dir(home_dir: &Path) -> Result<PathBuf> {
    let dir = app_dir_path(home_dir);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(dir)
}

/// `~/.verifile/logs`, created on demand. `None` when there is no home directory
/// or it cannot be written.
pub fn logs_dir() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let dir = ensure_app_dir(&home).ok()?.join("logs");
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}
