use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ReplicationError};

/// Aggregator key for a file: its path as given to the batch.
pub fn key_for(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// One reported failure. Records are append-only for the duration of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub key: String,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "- type={}\n- timestamp={}\n- message='{}'",
            self.kind,
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.message
        )?;
        if let Some(cause) = &self.cause {
            write!(f, "\n- cause={}", cause)?;
        }
        Ok(())
    }
}

/// Shared sink for every failure of a batch, keyed by source path.
///
/// Clones share the same state, so a clone can be handed to each worker thread.
/// A key's list is created on first report and only ever appended to.
#[derive(Debug, Clone, Default)]
pub struct ErrorAggregator {
    inner: Arc<Mutex<BTreeMap<String, Vec<ErrorRecord>>>>,
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<ErrorRecord>>> {
        // a panicking reporter cannot leave a half-pushed Vec behind, keep going
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a record under `key`.
    pub fn report(
        &self,
        key: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        cause: Option<String>,
    ) {
        let key = key.into();
        let message = message.into();
        tracing::debug!("[report] {} {}: {}", kind, key, message);
        let record = ErrorRecord { key: key.clone(), kind, message, timestamp: Utc::now(), cause };
        self.lock().entry(key).or_default().push(record);
    }

    /// Append a step failure under `key`, keeping its I/O cause as text.
    pub fn record(&self, key: impl Into<String>, err: &ReplicationError) {
        let cause = err.source.as_ref().map(|e| e.to_string());
        self.report(key, err.kind, err.message.clone(), cause);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of keys with at least one record.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn total_records(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn records_for(&self, key: &str) -> Vec<ErrorRecord> {
        self.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn count_kind(&self, kind: ErrorKind) -> usize {
        self.lock().values().flatten().filter(|r| r.kind == kind).count()
    }

    /// Point-in-time copy of the whole map, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<ErrorRecord>> {
        self.lock().clone()
    }

    /// All records flattened in key order.
    pub fn records(&self) -> Vec<ErrorRecord> {
        self.lock().values().flatten().cloned().collect()
    }
}

/// Human-readable listing: a single success line, or every record grouped by file.
pub fn render_report(aggregator: &ErrorAggregator) -> String {
    let snapshot = aggregator.snapshot();
    if snapshot.is_empty() {
        return "All files were replicated successfully!".to_string();
    }
    let mut out = String::new();
    for (key, records) in snapshot {
        out.push_str(&key);
        out.push_str(":\n");
        for r in records {
            out.push_str(&r.to_string());
            out.push('\n');
        }
    }
    out
}
