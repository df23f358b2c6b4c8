use serde::{Deserialize, Serialize};

/// Classification of every failure the replication engine can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Source or target handle could not be opened
    Open,
    Read,
    Write,
    /// Mapped or kernel-assisted copy failed (no read/write split available)
    Copy,
    /// File to fingerprint does not exist
    Exist,
    /// Fingerprint could not be computed from an open file
    Hash,
    /// Verification still failing after the last retry
    CopyIntegrity,
    /// Backoff wait interrupted
    RetryWaiting,
    /// Directory (target or quarantine) could not be created
    Create,
    /// Relocation into quarantine failed
    Move,
    /// Task never started because the batch was cancelled
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Open => "OPEN",
            ErrorKind::Read => "READ",
            ErrorKind::Write => "WRITE",
            ErrorKind::Copy => "COPY",
            ErrorKind::Exist => "EXIST",
            ErrorKind::Hash => "HASH",
            ErrorKind::CopyIntegrity => "COPY_INTEGRITY",
            ErrorKind::RetryWaiting => "RETRY_WAITING",
            ErrorKind::Create => "CREATE",
            ErrorKind::Move => "MOVE",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the retry loop must react to a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Another attempt may succeed (transient I/O, short reads, full disks being cleaned, ...)
    Retryable,
    /// Retrying cannot help: the file is gone or we are not allowed to touch it
    Fatal,
}

impl Severity {
    /// Conservative mapping from the OS error: missing files, permission and
    /// argument problems are fatal, everything else is worth another attempt.
    pub fn of_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::NotFound | Io::PermissionDenied | Io::InvalidInput => Severity::Fatal,
            _ => Severity::Retryable,
        }
    }
}

/// Failure of a single replication step. Carries its own severity so callers
/// branch on a value instead of unwinding.
#[derive(Debug)]
pub struct ReplicationError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub source: Option<std::io::Error>,
}

impl ReplicationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, severity: Severity::Retryable, message: message.into(), source: None }
    }

    /// Wrap an I/O error; severity is derived from the error itself.
    pub fn io(kind: ErrorKind, message: impl Into<String>, err: std::io::Error) -> Self {
        Self { kind, severity: Severity::of_io(&err), message: message.into(), source: Some(err) }
    }

    pub fn fatal(mut self) -> Self {
        self.severity = Severity::Fatal;
        self
    }

    pub fn retryable(mut self) -> Self {
        self.severity = Severity::Retryable;
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

impl std::fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Some(src) => write!(f, "[{}] {}: {}", self.kind, self.message, src),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ReplicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}
