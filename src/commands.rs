use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use owo_colors::OwoColorize;

use crate::aggregator::{ErrorAggregator, render_report};
use crate::cli::{StrategyArg, TuningArgs};
use crate::config::ReplicationConfig;
use crate::transfer::engine::percent;
use crate::transfer::fingerprint::fingerprint;
use crate::transfer::{
    Backoff, BatchOptions, CancelToken, HandleReplicateArgs, Quarantine, ReplicationTask,
    RetryController, RetryPolicy, StrategyPlan, TaskOutcome, retry_operation,
};

/// Load the config file and layer the command line overrides on top.
pub fn resolve_config(tuning: &TuningArgs) -> Result<ReplicationConfig> {
    let mut cfg = ReplicationConfig::load(tuning.config.as_deref())?;
    apply_tuning(&mut cfg, tuning);
    Ok(cfg)
}

pub fn apply_tuning(cfg: &mut ReplicationConfig, t: &TuningArgs) {
    if let Some(r) = t.retries {
        cfg.retry.max_retries = r;
    }
    if let Some(ms) = t.base_delay_ms {
        cfg.retry.base_delay_ms = ms;
    }
    if t.fixed_backoff {
        cfg.retry.backoff = Backoff::Fixed;
    }
    if let Some(kib) = t.buf_kib {
        cfg.buffer_size = kib.max(1) * 1024;
    }
    if let Some(mib) = t.mmap_threshold_mib {
        cfg.mmap_threshold = mib.saturating_mul(1024 * 1024);
    }
    if t.unsafe_mmap {
        cfg.safe_mmap = false;
    }
}

/// Arguments of `vf replicate` as parsed from the command line.
pub struct ReplicateCmd {
    pub source: PathBuf,
    pub target: PathBuf,
    pub concurrency: Option<usize>,
    pub quarantine_dir: Option<PathBuf>,
    pub defer_quarantine: bool,
    pub recursive: bool,
    pub deadline_secs: Option<u64>,
    pub failures_out: Option<PathBuf>,
    pub tuning: TuningArgs,
    pub json: bool,
    pub quiet: bool,
    pub verbose: bool,
}

pub fn handle_replicate(cmd: ReplicateCmd) -> Result<bool> {
    let mut config = resolve_config(&cmd.tuning)?;
    if cmd.concurrency.is_some() {
        config.workers = cmd.concurrency;
    }
    if cmd.quarantine_dir.is_some() {
        config.quarantine_dir = cmd.quarantine_dir;
    }
    if cmd.defer_quarantine {
        config.quarantine_mode = crate::transfer::QuarantineMode::Deferred;
    }
    if cmd.recursive {
        config.recursive = true;
    }
    if cmd.deadline_secs.is_some() {
        config.deadline_secs = cmd.deadline_secs;
    }
    tracing::debug!("effective config: {:?}", config);
    crate::transfer::handle_replicate(HandleReplicateArgs {
        source: cmd.source,
        target: cmd.target,
        config,
        verbose: cmd.verbose,
        json: cmd.json,
        quiet: cmd.quiet,
        failures_out: cmd.failures_out,
    })
}

/// `vf copy`: one verified copy. Returns whether any error was recorded.
pub fn handle_copy(
    source: &Path,
    target: &Path,
    strategy: Option<StrategyArg>,
    show_progress: bool,
    tuning: &TuningArgs,
) -> Result<bool> {
    let opts = BatchOptions::from_config(&resolve_config(tuning)?);
    let size = std::fs::metadata(source).map(|m| m.len()).unwrap_or(0);
    let plan = StrategyPlan { forced: strategy.map(Into::into), ..opts.plan };
    let task = ReplicationTask::new(source, target, size, &plan, opts.retry);

    let source_dir = source.parent().unwrap_or(Path::new("."));
    let quarantine = Quarantine::new(opts.quarantine_dir_for(source_dir), opts.quarantine_mode);
    let aggregator = ErrorAggregator::new();
    let controller =
        RetryController::new(opts.transfer.as_ref(), &aggregator, &quarantine, &opts.cancel);

    let print_progress = |processed: u64, total: u64| {
        print!("\rProgress: {:.1}% ", percent(processed, total));
        let _ = std::io::stdout().flush();
    };
    let start = Instant::now();
    let outcome = if show_progress {
        let o = controller.run(&task, Some(&print_progress));
        println!();
        o
    } else {
        controller.run(&task, None)
    };
    quarantine.flush(&aggregator);

    match outcome {
        TaskOutcome::Verified { attempts, bytes } => println!(
            "{} {} ({}, {} attempt(s), {})",
            "verified".green(),
            target.display(),
            crate::util::human_bytes(bytes),
            attempts,
            task.strategy().label()
        ),
        other => println!("{} {:?}", "failed".red(), other),
    }
    println!("Elapsed time: {}", crate::util::format_elapsed(start.elapsed()));
    if !aggregator.is_empty() {
        println!("{}", render_report(&aggregator));
    }
    Ok(!aggregator.is_empty())
}

/// `vf hash`: print `<hex>  <path>` per file. Returns whether any file failed.
pub fn handle_hash(paths: &[PathBuf]) -> Result<bool> {
    let policy = RetryPolicy { max_retries: 2, base_delay_ms: 100, backoff: Backoff::Exponential };
    let cancel = CancelToken::new();
    let mut failed = false;
    for p in paths {
        match retry_operation(&policy, &cancel, |_| fingerprint(p)) {
            Ok(fp) => println!("{}  {}", fp, p.display()),
            Err(e) => {
                eprintln!("{} {}", "error:".red(), e);
                failed = true;
            }
        }
    }
    Ok(failed)
}
