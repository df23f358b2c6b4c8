use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use indicatif::ProgressBar;

use crate::aggregator::{ErrorAggregator, key_for};
use crate::error::{ErrorKind, ReplicationError};
use crate::transfer::ReplicationTask;
use crate::transfer::cancel::CancelToken;
use crate::transfer::engine::ByteTransfer;
use crate::transfer::helpers::display_path;
use crate::transfer::quarantine::Quarantine;
use crate::transfer::retry::{RetryController, TaskOutcome};

/// Everything a worker thread needs; cloned once per worker.
#[derive(Clone)]
pub(crate) struct WorkerCtx {
    pub(crate) rx: Receiver<ReplicationTask>,
    pub(crate) outcome_tx: Sender<TaskOutcome>,
    pub(crate) transfer: Arc<dyn ByteTransfer>,
    pub(crate) aggregator: ErrorAggregator,
    pub(crate) quarantine: Arc<Quarantine>,
    pub(crate) cancel: CancelToken,
    pub(crate) total_pb: Option<ProgressBar>,
}

/// Spawn `workers` threads draining `ctx.rx`. The caller owns the handles and
/// must join all of them.
pub(crate) fn spawn_workers(workers: usize, ctx: WorkerCtx) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let ctx = ctx.clone();
        let handle = std::thread::spawn(move || {
            let mut done = 0usize;
            while let Ok(task) = ctx.rx.recv() {
                let outcome = run_one(&ctx, &task);
                done += 1;
                let _ = ctx.outcome_tx.send(outcome);
            }
            tracing::debug!("[worker {}] finished after {} task(s)", worker_id, done);
        });
        handles.push(handle);
    }
    handles
}

fn run_one(ctx: &WorkerCtx, task: &ReplicationTask) -> TaskOutcome {
    let key = key_for(task.source());
    if ctx.cancel.is_cancelled() {
        ctx.aggregator.report(
            &key,
            ErrorKind::Cancelled,
            format!("batch cancelled before {} was started", display_path(task.source())),
            None,
        );
        return TaskOutcome::Cancelled;
    }

    if let Some(parent) = task.target().parent()
        && !parent.as_os_str().is_empty()
        && !parent.is_dir()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        let err = ReplicationError::io(
            ErrorKind::Create,
            format!("failed to create target dir {}", display_path(parent)),
            e,
        );
        ctx.aggregator.record(&key, &err);
        return TaskOutcome::Abandoned { kind: ErrorKind::Create };
    }

    let controller =
        RetryController::new(ctx.transfer.as_ref(), &ctx.aggregator, &ctx.quarantine, &ctx.cancel);
    match &ctx.total_pb {
        Some(pb) => {
            // retries restart from zero; only count bytes past the furthest point seen
            let furthest = AtomicU64::new(0);
            let advance = |processed: u64, _total: u64| {
                let prev = furthest.fetch_max(processed, Ordering::Relaxed);
                if processed > prev {
                    pb.inc(processed - prev);
                }
            };
            let outcome = controller.run(task, Some(&advance));
            if !outcome.is_verified() {
                // keep the total bar consistent when a file never completes
                let rest = task.size().saturating_sub(furthest.load(Ordering::Relaxed));
                pb.inc(rest);
            }
            outcome
        }
        None => controller.run(task, None),
    }
}
