use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use memmap2::MmapOptions;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ReplicationError};
use crate::transfer::helpers::display_path;

/// Mapped windows are kept a multiple of this so every offset stays page aligned.
pub const MMAP_ALIGN: u64 = 64 * 1024;
const MMAP_WINDOW_MAX: u64 = 1024 * 1024 * 1024;

/// Progress callback: `(processed, total)` bytes, called after every chunk.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Sync);

/// How bytes are moved for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyStrategy {
    Streamed { buffer_size: usize },
    MemoryMapped { window: u64, safe: bool },
    /// Whole-file `std::io::copy`; the platform may use copy_file_range/sendfile.
    Kernel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    Streamed,
    Mmap,
    Kernel,
}

/// Inputs for picking a strategy per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyPlan {
    pub buffer_size: usize,
    pub mmap_threshold: u64,
    pub mmap_window: u64,
    pub safe_mmap: bool,
    /// Skip size-based selection and always use this strategy
    pub forced: Option<StrategyKind>,
}

impl Default for StrategyPlan {
    fn default() -> Self {
        Self {
            buffer_size: crate::config::DEFAULT_BUFFER_SIZE,
            mmap_threshold: crate::config::DEFAULT_MMAP_THRESHOLD,
            mmap_window: crate::config::DEFAULT_MMAP_WINDOW,
            safe_mmap: true,
            forced: None,
        }
    }
}

impl StrategyPlan {
    pub fn from_config(cfg: &crate::config::ReplicationConfig) -> Self {
        Self {
            buffer_size: cfg.buffer_size,
            mmap_threshold: cfg.mmap_threshold,
            mmap_window: cfg.mmap_window,
            safe_mmap: cfg.safe_mmap,
            forced: None,
        }
    }
}

impl CopyStrategy {
    pub fn select(size: u64, plan: &StrategyPlan) -> Self {
        let streamed = CopyStrategy::Streamed { buffer_size: plan.buffer_size.max(1) };
        let mapped =
            CopyStrategy::MemoryMapped { window: align_window(plan.mmap_window), safe: plan.safe_mmap };
        match plan.forced {
            Some(StrategyKind::Streamed) => streamed,
            Some(StrategyKind::Mmap) => mapped,
            Some(StrategyKind::Kernel) => CopyStrategy::Kernel,
            None if size >= plan.mmap_threshold => mapped,
            None => streamed,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CopyStrategy::Streamed { .. } => "streamed",
            CopyStrategy::MemoryMapped { .. } => "mmap",
            CopyStrategy::Kernel => "kernel",
        }
    }
}

/// Round a window up to a multiple of `MMAP_ALIGN`, within `[MMAP_ALIGN, 1 GiB]`.
pub fn align_window(window: u64) -> u64 {
    let clamped = window.clamp(MMAP_ALIGN, MMAP_WINDOW_MAX);
    clamped.div_ceil(MMAP_ALIGN) * MMAP_ALIGN
}

/// Percentage of `total` done; an empty file counts as complete.
pub fn percent(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    ((processed as f64 / total as f64) * 100.0).min(100.0)
}

/// I/O seam of the retry loop. `LocalTransfer` is the real thing; tests swap in
/// copies that fail or corrupt on purpose.
pub trait ByteTransfer: Send + Sync {
    fn copy(
        &self,
        source: &Path,
        target: &Path,
        strategy: CopyStrategy,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<u64, ReplicationError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransfer;

impl ByteTransfer for LocalTransfer {
    fn copy(
        &self,
        source: &Path,
        target: &Path,
        strategy: CopyStrategy,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<u64, ReplicationError> {
        copy(source, target, strategy, progress)
    }
}

/// Copy `source` over `target` with the given strategy. Returns bytes written.
pub fn copy(
    source: &Path,
    target: &Path,
    strategy: CopyStrategy,
    progress: Option<ProgressFn<'_>>,
) -> Result<u64, ReplicationError> {
    tracing::debug!(
        "[copy] {} -> {} ({})",
        display_path(source),
        display_path(target),
        strategy.label()
    );
    // opening the target truncates it, which would wipe the source
    if is_same_file(source, target) {
        return Err(ReplicationError::new(
            ErrorKind::Copy,
            format!(
                "refusing to copy {} onto itself ({})",
                display_path(source),
                display_path(target)
            ),
        )
        .fatal());
    }
    match strategy {
        CopyStrategy::Streamed { buffer_size } => {
            copy_streamed(source, target, buffer_size, progress)
        }
        CopyStrategy::MemoryMapped { window, safe } => {
            copy_mapped(source, target, window, safe, progress)
        }
        CopyStrategy::Kernel => copy_kernel(source, target, progress),
    }
}

/// Whether `target` exists and refers to the same file as `source`,
/// including hard links and symlinks.
pub fn is_same_file(source: &Path, target: &Path) -> bool {
    let (Ok(a), Ok(b)) = (std::fs::metadata(source), std::fs::metadata(target)) else {
        return false;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        a.dev() == b.dev() && a.ino() == b.ino()
    }
    #[cfg(not(unix))]
    {
        let _ = (a, b);
        match (std::fs::canonicalize(source), std::fs::canonicalize(target)) {
            (Ok(x), Ok(y)) => x == y,
            _ => false,
        }
    }
}

fn open_source(source: &Path) -> Result<File, ReplicationError> {
    File::open(source).map_err(|e| {
        ReplicationError::io(
            ErrorKind::Open,
            format!("failed to open source {}", display_path(source)),
            e,
        )
    })
}

fn open_target(target: &Path, read: bool) -> Result<File, ReplicationError> {
    OpenOptions::new().read(read).write(true).create(true).truncate(true).open(target).map_err(
        |e| {
            ReplicationError::io(
                ErrorKind::Open,
                format!("failed to open target {}", display_path(target)),
                e,
            )
        },
    )
}

fn source_len(src: &File, source: &Path) -> Result<u64, ReplicationError> {
    src.metadata().map(|m| m.len()).map_err(|e| {
        ReplicationError::io(
            ErrorKind::Read,
            format!("failed to stat source {}", display_path(source)),
            e,
        )
    })
}

pub fn copy_streamed(
    source: &Path,
    target: &Path,
    buffer_size: usize,
    progress: Option<ProgressFn<'_>>,
) -> Result<u64, ReplicationError> {
    let mut src = open_source(source)?;
    let total = source_len(&src, source)?;
    let mut dst = open_target(target, false)?;
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut written = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(ReplicationError::io(
                    ErrorKind::Read,
                    format!("failed to read {}", display_path(source)),
                    e,
                ));
            }
        };
        dst.write_all(&buf[..n]).map_err(|e| {
            ReplicationError::io(
                ErrorKind::Write,
                format!("failed to write {}", display_path(target)),
                e,
            )
        })?;
        written += n as u64;
        if let Some(cb) = progress {
            cb(written, total.max(written));
        }
    }
    dst.flush().map_err(|e| {
        ReplicationError::io(ErrorKind::Write, format!("failed to flush {}", display_path(target)), e)
    })?;
    if written == 0
        && let Some(cb) = progress
    {
        cb(0, 0);
    }
    Ok(written)
}

pub fn copy_mapped(
    source: &Path,
    target: &Path,
    window: u64,
    safe: bool,
    progress: Option<ProgressFn<'_>>,
) -> Result<u64, ReplicationError> {
    let src = open_source(source)?;
    let len = source_len(&src, source)?;
    // read access is required for a shared writable mapping
    let dst = open_target(target, true)?;
    dst.set_len(len).map_err(|e| {
        ReplicationError::io(
            ErrorKind::Write,
            format!("failed to size target {} to {} bytes", display_path(target), len),
            e,
        )
    })?;
    if len == 0 {
        if let Some(cb) = progress {
            cb(0, 0);
        }
        return Ok(0);
    }

    let window = align_window(window);
    let map_err = |what: &str, offset: u64, e: std::io::Error| {
        ReplicationError::io(
            ErrorKind::Copy,
            format!("{} {} at offset {}", what, display_path(source), offset),
            e,
        )
    };
    let mut offset = 0u64;
    while offset < len {
        // window is capped at 1 GiB, so this fits usize everywhere
        let chunk = (len - offset).min(window) as usize;
        // SAFETY: the maps live only for this iteration and the target is owned by
        // this task; a source truncated concurrently is outside what we guard against.
        let src_map = unsafe { MmapOptions::new().offset(offset).len(chunk).map(&src) }
            .map_err(|e| map_err("failed to map source", offset, e))?;
        let mut dst_map = unsafe { MmapOptions::new().offset(offset).len(chunk).map_mut(&dst) }
            .map_err(|e| map_err("failed to map target for", offset, e))?;
        dst_map.copy_from_slice(&src_map);
        if safe {
            dst_map.flush().map_err(|e| map_err("failed to flush mapped copy of", offset, e))?;
        }
        offset += chunk as u64;
        if let Some(cb) = progress {
            cb(offset, len);
        }
    }
    if safe {
        dst.sync_all().map_err(|e| {
            ReplicationError::io(ErrorKind::Write, format!("failed to sync {}", display_path(target)), e)
        })?;
    }
    Ok(len)
}

pub fn copy_kernel(
    source: &Path,
    target: &Path,
    progress: Option<ProgressFn<'_>>,
) -> Result<u64, ReplicationError> {
    let mut src = open_source(source)?;
    let mut dst = open_target(target, false)?;
    let n = std::io::copy(&mut src, &mut dst).map_err(|e| {
        ReplicationError::io(
            ErrorKind::Copy,
            format!("failed to copy {} to {}", display_path(source), display_path(target)),
            e,
        )
    })?;
    if let Some(cb) = progress {
        cb(n, n);
    }
    Ok(n)
}
