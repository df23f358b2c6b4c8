use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregator::{ErrorAggregator, key_for};
use crate::error::{ErrorKind, ReplicationError};
use crate::transfer::ReplicationTask;
use crate::transfer::cancel::CancelToken;
use crate::transfer::engine::{ByteTransfer, ProgressFn};
use crate::transfer::fingerprint::{digests_match, fingerprint};
use crate::transfer::helpers::display_path;
use crate::transfer::quarantine::Quarantine;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    #[default]
    Exponential,
}

/// `max_retries` is the total number of copy attempts (at least one). Every
/// failed attempt is followed by a wait of `delay_for(n)`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_ms: 1000, backoff: Backoff::Exponential }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let ms = match self.backoff {
            Backoff::Fixed => self.base_delay_ms,
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Final state of one task.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Verified { attempts: u32, bytes: u64 },
    Quarantined { attempts: u32 },
    /// A backoff wait was cancelled
    Interrupted { attempts: u32 },
    /// A fatal error ended the task without retries
    Abandoned { kind: ErrorKind },
    /// The batch was cancelled before the task started
    Cancelled,
}

impl TaskOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, TaskOutcome::Verified { .. })
    }
}

/// Drives fingerprint, copy, fingerprint and compare for a task until the
/// copy verifies, the budget runs out, or a fatal error shows up.
pub struct RetryController<'a> {
    transfer: &'a dyn ByteTransfer,
    aggregator: &'a ErrorAggregator,
    quarantine: &'a Quarantine,
    cancel: &'a CancelToken,
}

impl<'a> RetryController<'a> {
    pub fn new(
        transfer: &'a dyn ByteTransfer,
        aggregator: &'a ErrorAggregator,
        quarantine: &'a Quarantine,
        cancel: &'a CancelToken,
    ) -> Self {
        Self { transfer, aggregator, quarantine, cancel }
    }

    /// One attempt. `Ok(None)` means the copy finished but digests differ.
    fn attempt(
        &self,
        task: &ReplicationTask,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<Option<u64>, ReplicationError> {
        let source_fp = fingerprint(task.source())?;
        let bytes = self.transfer.copy(task.source(), task.target(), task.strategy(), progress)?;
        // the next attempt rewrites the target, so its failures never end the task
        let target_fp = fingerprint(task.target()).map_err(ReplicationError::retryable)?;
        if digests_match(Some(&source_fp), Some(&target_fp)) {
            Ok(Some(bytes))
        } else {
            tracing::warn!(
                "checksum mismatch for {}: source {} target {}",
                display_path(task.source()),
                source_fp,
                target_fp
            );
            Ok(None)
        }
    }

    pub fn run(&self, task: &ReplicationTask, progress: Option<ProgressFn<'_>>) -> TaskOutcome {
        let key = key_for(task.source());
        let policy = task.policy();
        let budget = policy.max_attempts();
        let mut attempt = 0u32;
        while attempt < budget {
            let delay = policy.delay_for(attempt);
            attempt += 1;
            match self.attempt(task, progress) {
                Ok(Some(bytes)) => {
                    tracing::info!(
                        "verified {} -> {} ({} bytes, attempt {})",
                        display_path(task.source()),
                        display_path(task.target()),
                        bytes,
                        attempt
                    );
                    return TaskOutcome::Verified { attempts: attempt, bytes };
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!("giving up on {}: {}", display_path(task.source()), e);
                    self.aggregator.record(&key, &e);
                    return TaskOutcome::Abandoned { kind: e.kind };
                }
                Err(e) => {
                    tracing::debug!("attempt {} of {} failed: {}", attempt, budget, e);
                    self.aggregator.record(&key, &e);
                }
            }

            tracing::debug!(
                "waiting {} ms after attempt {} on {}",
                delay.as_millis(),
                attempt,
                display_path(task.source())
            );
            if !self.cancel.sleep(delay) {
                self.aggregator.report(
                    &key,
                    ErrorKind::RetryWaiting,
                    format!(
                        "Interrupted while waiting {} ms after attempt {} of {}",
                        delay.as_millis(),
                        attempt,
                        budget
                    ),
                    None,
                );
                return TaskOutcome::Interrupted { attempts: attempt };
            }
        }

        self.aggregator.report(
            &key,
            ErrorKind::CopyIntegrity,
            format!(
                "Failed to copy file {} to {} after {} attempts. File will be moved to {} for investigation.",
                display_path(task.source()),
                display_path(task.target()),
                budget,
                display_path(self.quarantine.dir())
            ),
            None,
        );
        self.quarantine.submit(task.source(), self.aggregator);
        TaskOutcome::Quarantined { attempts: budget }
    }
}

/// Retry any fallible step with the backoff rules of `policy`, up to
/// `max_attempts` calls. Fatal errors and cancelled waits return the latest
/// error right away.
pub fn retry_operation<T, F>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    mut op: F,
) -> Result<T, ReplicationError>
where
    F: FnMut(u32) -> Result<T, ReplicationError>,
{
    let mut retry = 0u32;
    loop {
        match op(retry + 1) {
            Ok(v) => return Ok(v),
            Err(e) if e.is_fatal() || retry + 1 >= policy.max_attempts() => return Err(e),
            Err(e) => {
                tracing::debug!("retry_operation attempt {} failed: {}", retry + 1, e);
                if !cancel.sleep(policy.delay_for(retry)) {
                    return Err(e);
                }
            }
        }
        retry += 1;
    }
}
