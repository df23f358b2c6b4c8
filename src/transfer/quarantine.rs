use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::aggregator::{ErrorAggregator, key_for};
use crate::config::QUARANTINE_DIR_NAME;
use crate::error::{ErrorKind, ReplicationError};
use crate::transfer::helpers::display_path;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuarantineMode {
    /// Move as soon as a file exhausts its retries
    #[default]
    Immediate,
    /// Queue, then move everything once all workers have finished
    Deferred,
}

/// `quarantine` next to `source_dir`.
pub fn default_quarantine_dir(source_dir: &Path) -> PathBuf {
    match source_dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(QUARANTINE_DIR_NAME),
        _ => source_dir.join("..").join(QUARANTINE_DIR_NAME),
    }
}

#[derive(Debug, Default)]
struct QuarantineState {
    accepted: HashSet<PathBuf>,
    pending: Vec<PathBuf>,
}

/// Batch-scoped quarantine. Share it between workers behind an `Arc`.
#[derive(Debug)]
pub struct Quarantine {
    dir: PathBuf,
    mode: QuarantineMode,
    state: Mutex<QuarantineState>,
}

impl Quarantine {
    pub fn new(dir: impl Into<PathBuf>, mode: QuarantineMode) -> Self {
        Self { dir: dir.into(), mode, state: Mutex::new(QuarantineState::default()) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn mode(&self) -> QuarantineMode {
        self.mode
    }

    fn lock(&self) -> MutexGuard<'_, QuarantineState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Hand over an exhausted file. Returns `false` when `path` was already
    /// accepted earlier; such calls neither move nor report anything.
    pub fn submit(&self, path: &Path, aggregator: &ErrorAggregator) -> bool {
        let mut state = self.lock();
        if !state.accepted.insert(path.to_path_buf()) {
            tracing::debug!("[quarantine] {} already accepted", display_path(path));
            return false;
        }
        match self.mode {
            QuarantineMode::Immediate => {
                // relocate under the lock so concurrent workers never race for a slot
                self.relocate_reporting(path, aggregator);
            }
            QuarantineMode::Deferred => state.pending.push(path.to_path_buf()),
        }
        true
    }

    /// Paths waiting for a deferred flush.
    pub fn pending(&self) -> Vec<PathBuf> {
        self.lock().pending.clone()
    }

    /// Move every queued path. Returns how many were moved.
    pub fn flush(&self, aggregator: &ErrorAggregator) -> usize {
        let mut state = self.lock();
        let pending = std::mem::take(&mut state.pending);
        let moved =
            pending.iter().filter(|p| self.relocate_reporting(p, aggregator).is_some()).count();
        drop(state);
        moved
    }

    fn relocate_reporting(&self, path: &Path, aggregator: &ErrorAggregator) -> Option<PathBuf> {
        match self.relocate(path) {
            Ok(dest) => {
                tracing::warn!(
                    "[quarantine] {} moved to {}",
                    display_path(path),
                    display_path(&dest)
                );
                Some(dest)
            }
            Err(e) => {
                tracing::warn!("[quarantine] {}", e);
                aggregator.record(key_for(path), &e);
                None
            }
        }
    }

    fn relocate(&self, path: &Path) -> Result<PathBuf, ReplicationError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            ReplicationError::io(
                ErrorKind::Create,
                format!("failed to create quarantine dir {}", display_path(&self.dir)),
                e,
            )
        })?;
        let dest = free_slot(&self.dir, path)?;
        move_file(path, &dest).map_err(|e| {
            ReplicationError::io(
                ErrorKind::Move,
                format!(
                    "failed to move {} to {}",
                    display_path(path),
                    display_path(&dest)
                ),
                e,
            )
        })?;
        Ok(dest)
    }
}

/// First unused name among `<name>`, `<name>.1`, `<name>.2`, ...
fn free_slot(dir: &Path, path: &Path) -> Result<PathBuf, ReplicationError> {
    let Some(name) = path.file_name() else {
        return Err(ReplicationError::new(
            ErrorKind::Move,
            format!("{} has no file name", display_path(path)),
        )
        .fatal());
    };
    let first = dir.join(name);
    if std::fs::symlink_metadata(&first).is_err() {
        return Ok(first);
    }
    let mut n = 1u64;
    loop {
        let mut candidate = name.to_os_string();
        candidate.push(format!(".{}", n));
        let p = dir.join(candidate);
        if std::fs::symlink_metadata(&p).is_err() {
            return Ok(p);
        }
        n += 1;
    }
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_moves_once_with_counter_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let q_dir = dir.path().join("quarantine");
        std::fs::create_dir_all(&q_dir).unwrap();
        std::fs::write(q_dir.join("bad.dat"), b"older").unwrap();
        std::fs::write(q_dir.join("bad.dat.1"), b"older still").unwrap();
        let src = dir.path().join("bad.dat");
        std::fs::write(&src, b"payload").unwrap();

        let agg = ErrorAggregator::new();
        let q = Quarantine::new(&q_dir, QuarantineMode::Immediate);
        assert!(q.submit(&src, &agg));
        assert!(!q.submit(&src, &agg));
        assert!(!src.exists());
        assert_eq!(std::fs::read(q_dir.join("bad.dat.2")).unwrap(), b"payload");
        assert_eq!(std::fs::read(q_dir.join("bad.dat")).unwrap(), b"older");
        assert!(agg.is_empty());
        assert!(!q_dir.join("bad.dat.3").exists());
    }

    #[test]
    fn deferred_waits_for_flush() {
        let dir = tempfile::tempdir().unwrap();
        let q_dir = dir.path().join("q");
        let src = dir.path().join("late.bin");
        std::fs::write(&src, b"x").unwrap();
        let agg = ErrorAggregator::new();
        let q = Quarantine::new(&q_dir, QuarantineMode::Deferred);
        assert!(q.submit(&src, &agg));
        assert!(!q.submit(&src, &agg));
        assert!(src.exists());
        assert_eq!(q.pending(), vec![src.clone()]);
        assert_eq!(q.flush(&agg), 1);
        assert!(q_dir.join("late.bin").exists());
        assert!(q.pending().is_empty());
        assert_eq!(q.flush(&agg), 0);
    }

    #[test]
    fn unusable_dir_reports_create_and_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let src = dir.path().join("keep.txt");
        std::fs::write(&src, b"data").unwrap();
        let agg = ErrorAggregator::new();
        let q = Quarantine::new(blocker.join("sub"), QuarantineMode::Immediate);
        assert!(q.submit(&src, &agg));
        assert!(src.exists());
        let recs = agg.records_for(&key_for(&src));
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, ErrorKind::Create);
    }

    #[test]
    fn concurrent_same_names_get_distinct_slots() {
        let dir = tempfile::tempdir().unwrap();
        let q_dir = dir.path().join("q");
        let q = std::sync::Arc::new(Quarantine::new(&q_dir, QuarantineMode::Immediate));
        let agg = ErrorAggregator::new();
        let mut handles = Vec::new();
        for i in 0..6 {
            let sub = dir.path().join(format!("src{}", i));
            std::fs::create_dir_all(&sub).unwrap();
            let f = sub.join("same.txt");
            std::fs::write(&f, format!("{}", i)).unwrap();
            let q = q.clone();
            let agg = agg.clone();
            handles.push(std::thread::spawn(move || q.submit(&f, &agg)));
        }
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert!(agg.is_empty());
        assert_eq!(std::fs::read_dir(&q_dir).unwrap().count(), 6);
    }
}
