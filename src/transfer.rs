// transfer module: batch orchestration of verified copies
pub mod cancel;
pub mod engine;
mod enumeration;
pub mod fingerprint;
mod helpers;
pub mod quarantine;
pub mod retry;
mod workers;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::aggregator::{ErrorAggregator, key_for, render_report};
use crate::config::ReplicationConfig;
use crate::error::{ErrorKind, ReplicationError};
use crate::util::{init_progress_and_mp, set_startup_header};

pub use self::cancel::CancelToken;
pub use self::engine::{ByteTransfer, CopyStrategy, LocalTransfer, StrategyKind, StrategyPlan};
pub use self::helpers::normalize_path;
pub use self::quarantine::{Quarantine, QuarantineMode};
pub use self::retry::{Backoff, RetryController, RetryPolicy, TaskOutcome, retry_operation};

use self::enumeration::{SourceFile, enumerate_flat, enumerate_recursive};
use self::helpers::display_path;
use self::workers::{WorkerCtx, spawn_workers};

/// Upper bound for the worker pool regardless of hardware.
pub const MAX_WORKERS: usize = 64;

/// One file to replicate. Built by the orchestrator, consumed by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationTask {
    source: PathBuf,
    target: PathBuf,
    size: u64,
    buffer_size: usize,
    strategy: CopyStrategy,
    policy: RetryPolicy,
}

impl ReplicationTask {
    /// Task for a file of `size` bytes; the strategy is picked from `plan`.
    pub fn new(
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        size: u64,
        plan: &StrategyPlan,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            size,
            buffer_size: plan.buffer_size,
            strategy: CopyStrategy::select(size, plan),
            policy,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Size observed at enumeration time.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn strategy(&self) -> CopyStrategy {
        self.strategy
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

/// Knobs for `replicate_directory`.
#[derive(Clone)]
pub struct BatchOptions {
    /// `None` picks a count from the hardware and the batch shape
    pub workers: Option<usize>,
    pub plan: StrategyPlan,
    pub retry: RetryPolicy,
    /// `None` means `<source_dir>/../quarantine`
    pub quarantine_dir: Option<PathBuf>,
    pub quarantine_mode: QuarantineMode,
    pub recursive: bool,
    pub deadline: Option<Duration>,
    /// Cancel it to stop the batch early. Each batch runs on a child of this
    /// token, so a fired deadline does not leak into later batches.
    pub cancel: CancelToken,
    pub transfer: Arc<dyn ByteTransfer>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from_config(&ReplicationConfig::default())
    }
}

impl BatchOptions {
    pub fn from_config(cfg: &ReplicationConfig) -> Self {
        Self {
            workers: cfg.workers,
            plan: StrategyPlan::from_config(cfg),
            retry: cfg.retry,
            quarantine_dir: cfg.quarantine_dir.clone(),
            quarantine_mode: cfg.quarantine_mode,
            recursive: cfg.recursive,
            deadline: cfg.deadline_secs.map(Duration::from_secs),
            cancel: CancelToken::new(),
            transfer: Arc::new(LocalTransfer),
        }
    }

    /// Quarantine location for a batch reading from `source_dir`.
    pub fn quarantine_dir_for(&self, source_dir: &Path) -> PathBuf {
        match &self.quarantine_dir {
            Some(dir) => dir.clone(),
            None => quarantine::default_quarantine_dir(source_dir),
        }
    }
}

/// Counts for one batch. `files` equals the sum of the outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub files: usize,
    pub verified: usize,
    pub quarantined: usize,
    pub interrupted: usize,
    pub abandoned: usize,
    pub cancelled: usize,
    pub workers: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl BatchReport {
    fn fold(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Verified { bytes, .. } => {
                self.verified += 1;
                self.bytes += bytes;
            }
            TaskOutcome::Quarantined { .. } => self.quarantined += 1,
            TaskOutcome::Interrupted { .. } => self.interrupted += 1,
            TaskOutcome::Abandoned { .. } => self.abandoned += 1,
            TaskOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// Worker count for a batch: explicit value or the auto heuristic, clamped to
/// `1..=min(files, MAX_WORKERS)`.
pub fn resolve_workers(explicit: Option<usize>, files: usize, total_size: u64) -> usize {
    let wanted = explicit.unwrap_or_else(|| {
        crate::auto_concurrency::choose_auto_concurrency(files, total_size)
    });
    let cap = files.clamp(1, MAX_WORKERS);
    wanted.clamp(1, cap)
}

/// Replicate every regular file of `source_dir` into `target_dir`, verifying
/// each copy. All failures land in `aggregator`; an empty aggregator afterwards
/// means every file was copied and verified.
pub fn replicate_directory(
    source_dir: &Path,
    target_dir: &Path,
    opts: &BatchOptions,
    aggregator: &ErrorAggregator,
) -> BatchReport {
    run_batch(source_dir, target_dir, opts, aggregator, None)
}

fn list_sources(
    source_dir: &Path,
    recursive: bool,
    aggregator: &ErrorAggregator,
) -> Result<Vec<SourceFile>, ReplicationError> {
    if recursive {
        enumerate_recursive(source_dir, aggregator)
    } else {
        enumerate_flat(source_dir, aggregator)
    }
}

// Cancel `cancel` once `deadline` passes, unless the returned sender is dropped first.
fn spawn_deadline_watcher(
    deadline: Duration,
    cancel: CancelToken,
) -> (crossbeam_channel::Sender<()>, std::thread::JoinHandle<()>) {
    let (done_tx, done_rx) = bounded::<()>(0);
    let handle = std::thread::spawn(move || {
        if let Err(crossbeam_channel::RecvTimeoutError::Timeout) = done_rx.recv_timeout(deadline) {
            tracing::warn!("batch deadline of {:?} reached, cancelling", deadline);
            cancel.cancel();
        }
    });
    (done_tx, handle)
}

pub(crate) fn run_batch(
    source_dir: &Path,
    target_dir: &Path,
    opts: &BatchOptions,
    aggregator: &ErrorAggregator,
    total_pb: Option<&ProgressBar>,
) -> BatchReport {
    let start = Instant::now();
    let mut report = BatchReport::default();

    if let Err(e) = std::fs::create_dir_all(target_dir) {
        let err = ReplicationError::io(
            ErrorKind::Create,
            format!("failed to create target dir {}", display_path(target_dir)),
            e,
        );
        tracing::error!("{}", err);
        aggregator.record(key_for(target_dir), &err);
        report.elapsed = start.elapsed();
        return report;
    }

    if let (Ok(src), Ok(dst)) = (source_dir.canonicalize(), target_dir.canonicalize())
        && src == dst
    {
        let err = ReplicationError::new(
            ErrorKind::Copy,
            format!(
                "source {} and target {} are the same directory",
                display_path(source_dir),
                display_path(target_dir)
            ),
        )
        .fatal();
        tracing::error!("{}", err);
        aggregator.record(key_for(source_dir), &err);
        report.elapsed = start.elapsed();
        return report;
    }

    let files = match list_sources(source_dir, opts.recursive, aggregator) {
        Ok(files) => files,
        Err(err) => {
            tracing::error!("{}", err);
            aggregator.record(key_for(source_dir), &err);
            report.elapsed = start.elapsed();
            return report;
        }
    };
    report.files = files.len();
    if files.is_empty() {
        tracing::info!("nothing to replicate in {}", display_path(source_dir));
        report.elapsed = start.elapsed();
        return report;
    }

    let total_size: u64 = files.iter().map(|f| f.size).sum();
    if let Some(pb) = total_pb {
        pb.set_length(total_size);
    }
    let workers = resolve_workers(opts.workers, files.len(), total_size);
    report.workers = workers;
    let quarantine =
        Arc::new(Quarantine::new(opts.quarantine_dir_for(source_dir), opts.quarantine_mode));
    tracing::info!(
        "replicating {} file(s), {} bytes, {} worker(s), quarantine {}",
        files.len(),
        total_size,
        workers,
        display_path(quarantine.dir())
    );

    let cancel = opts.cancel.child();
    let watcher = opts.deadline.map(|d| spawn_deadline_watcher(d, cancel.clone()));

    // capacity strictly above the task count when small, bounded otherwise
    let cap = std::cmp::min(std::cmp::max(4, workers * 4 + 1), files.len() + 1);
    let (tx, rx) = bounded::<ReplicationTask>(cap);
    let (outcome_tx, outcome_rx) = unbounded::<TaskOutcome>();

    // workers first, so the producer never blocks on a full queue with nobody draining it
    let handles = spawn_workers(
        workers,
        WorkerCtx {
            rx,
            outcome_tx,
            transfer: opts.transfer.clone(),
            aggregator: aggregator.clone(),
            quarantine: quarantine.clone(),
            cancel,
            total_pb: total_pb.cloned(),
        },
    );

    for f in files {
        let task =
            ReplicationTask::new(f.path, target_dir.join(&f.rel), f.size, &opts.plan, opts.retry);
        // blocking send applies backpressure
        if tx.send(task).is_err() {
            tracing::error!("all workers exited early");
            break;
        }
    }
    drop(tx);

    for h in handles {
        if h.join().is_err() {
            tracing::error!("a replication worker panicked");
        }
    }
    for outcome in outcome_rx.iter() {
        report.fold(outcome);
    }

    if let Some((done_tx, handle)) = watcher {
        drop(done_tx);
        let _ = handle.join();
    }

    if quarantine.mode() == QuarantineMode::Deferred {
        let moved = quarantine.flush(aggregator);
        tracing::info!("deferred quarantine moved {} file(s)", moved);
    }

    report.elapsed = start.elapsed();
    report
}

/// Arguments for `handle_replicate` grouped to avoid too-many-arguments lint.
#[derive(Clone)]
pub struct HandleReplicateArgs {
    pub source: PathBuf,
    pub target: PathBuf,
    pub config: ReplicationConfig,
    pub verbose: bool,
    pub json: bool,
    pub quiet: bool,
    pub failures_out: Option<PathBuf>,
}

/// Bars stay off when nothing else may go to the console, and with `verbose`,
/// whose `info` log lines would tear through them.
fn progress_hidden(quiet: bool, json: bool, verbose: bool) -> bool {
    quiet || json || verbose
}

/// `vf replicate` entry point. Returns whether any error was recorded.
pub fn handle_replicate(args: HandleReplicateArgs) -> Result<bool> {
    let HandleReplicateArgs { source, target, config, verbose, json, quiet, failures_out } = args;
    if !source.is_dir() {
        anyhow::bail!("source {} is not a directory", source.display());
    }

    let total_style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    )
    .with_context(|| "invalid progress template")?
    .progress_chars("=> ");

    let opts = BatchOptions::from_config(&config);
    let (mp, total_pb, header) =
        init_progress_and_mp(progress_hidden(quiet, json, verbose), 0, &total_style);
    set_startup_header(
        &header,
        "Replicate",
        opts.workers,
        opts.retry.base_delay_ms,
        opts.plan.buffer_size,
    );

    let aggregator = ErrorAggregator::new();
    let report = run_batch(&source, &target, &opts, &aggregator, Some(&total_pb));

    let _ = mp.clear();
    header.finish_and_clear();
    total_pb.finish_and_clear();

    if !quiet {
        crate::util::print_summary(&report);
        println!("{}", render_report(&aggregator));
    }

    let mut failures_path: Option<PathBuf> = None;
    if !aggregator.is_empty() {
        failures_path = crate::util::write_failures_jsonl(failures_out, &aggregator);
        if !quiet && let Some(ref p) = failures_path {
            println!("Failure report written to: {}", p.display());
        }
    }

    if json {
        let summary_obj = serde_json::json!({
            "files": report.files,
            "verified": report.verified,
            "quarantined": report.quarantined,
            "interrupted": report.interrupted,
            "abandoned": report.abandoned,
            "cancelled": report.cancelled,
            "workers": report.workers,
            "total_bytes": report.bytes,
            "elapsed_secs": report.elapsed.as_secs_f64(),
            "errors": aggregator.total_records(),
            "failures_path": failures_path.as_ref().map(|p| p.to_string_lossy().to_string()),
        });
        if let Ok(line) = serde_json::to_string(&summary_obj) {
            println!("{}", line);
        }
    }

    Ok(!aggregator.is_empty())
}
