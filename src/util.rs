use chrono::Utc;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use owo_colors::OwoColorize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::aggregator::ErrorAggregator;
use crate::transfer::BatchReport;

/// Try to enable ANSI escape sequence support on Windows consoles.
/// Returns true if enabling succeeded (or platform likely already supports ANSI), false otherwise.
#[cfg(windows)]
pub fn try_enable_ansi_on_windows() -> bool {
    enable_ansi_support::enable_ansi_support().is_ok()
}

// On non-Windows platforms the crate is not required and ANSI support is typically available
// by default in terminals; provide a no-op fallback to avoid referencing the optional crate.
#[cfg(not(windows))]
pub fn try_enable_ansi_on_windows() -> bool {
    false
}

/// Convert a byte count into a human readable string using IEC units (KiB/MiB/GiB).
pub fn human_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Initialize a MultiProgress with a header line above a total ProgressBar.
/// `hidden` suppresses drawing (quiet/json output, or logs going to the console).
pub fn init_progress_and_mp(
    hidden: bool,
    total: u64,
    total_style: &ProgressStyle,
) -> (Arc<MultiProgress>, ProgressBar, ProgressBar) {
    let mp = Arc::new(if hidden {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    } else {
        MultiProgress::new()
    });
    let header = mp.add(ProgressBar::new_spinner());
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        header.set_style(style);
    }
    let total_pb = mp.add(ProgressBar::new(total));
    total_pb.set_style(total_style.clone());
    let _ = try_enable_ansi_on_windows();
    (mp, total_pb, header)
}

/// Startup line shown above the total bar: Action, Worker, Backoff, Buf.
pub fn set_startup_header(
    header: &ProgressBar,
    action: &str,
    workers: Option<usize>,
    backoff_ms: u64,
    buf_size: usize,
) {
    let buf_hr = human_bytes(buf_size as u64);
    let workers = workers.map(|w| w.to_string()).unwrap_or_else(|| "auto".to_string());
    let action_field = format!("{:<16}", format!("Action:{}", action));
    let conc_field = format!("{:<12}", format!("Worker:{}", workers));
    let backoff_field = format!("{:<16}", format!("Backoff:{}ms", backoff_ms));
    let buffer_field = format!("{:<14}", format!("Buf:{}", buf_hr));
    header.set_message(format!(
        "{}    {}    {}    {}",
        action_field.green(),
        conc_field.cyan(),
        backoff_field.yellow(),
        buffer_field.magenta()
    ));
}

/// Print a concise summary line for a finished batch.
pub fn print_summary(report: &BatchReport) {
    let elapsed_secs = report.elapsed.as_secs_f64();
    let rate = if elapsed_secs > 0.0 {
        report.bytes as f64 / 1024.0 / 1024.0 / elapsed_secs
    } else {
        0.0
    };
    let line = format!(
        "Average rate: {:.2} MB/s ({} bytes in {:.2} s, {} files) | verified: {} | quarantined: {} | interrupted: {} | abandoned: {} | cancelled: {}",
        rate,
        report.bytes,
        elapsed_secs,
        report.files,
        report.verified,
        report.quarantined,
        report.interrupted,
        report.abandoned,
        report.cancelled
    );
    if report.verified == report.files {
        println!("{}", line.green());
    } else {
        println!("{}", line.yellow());
    }
}

/// `Elapsed time: 1 min 2.345 s` style rendering for single-file commands.
pub fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    let millis = d.subsec_millis();
    if secs >= 60 {
        format!("{} min {}.{:03} s", secs / 60, secs % 60, millis)
    } else {
        format!("{}.{:03} s", secs, millis)
    }
}

/// Write every aggregated record as one JSON line. With no explicit path the
/// report goes to `~/.verifile/logs/failures-<UTC>.jsonl`. Returns the path
/// written, or `None` when nothing could be written.
pub fn write_failures_jsonl(path: Option<PathBuf>, aggregator: &ErrorAggregator) -> Option<PathBuf> {
    let p = match path {
        Some(p) => p,
        None => crate::config::logs_dir()?
            .join(format!("failures-{}.jsonl", Utc::now().format("%Y%m%dT%H%M%SZ"))),
    };
    if let Some(parent) = p.parent()
        && !parent.as_os_str().is_empty()
    {
        let _ = std::fs::create_dir_all(parent);
    }
    let mut f = match OpenOptions::new().create(true).append(true).open(&p) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!("cannot write failure report {}: {}", p.display(), e);
            return None;
        }
    };
    for record in aggregator.records() {
        if let Ok(line) = serde_json::to_string(&record) {
            let _ = writeln!(f, "{}", line);
        }
    }
    Some(p)
}

/// Console logging filtered by `RUST_LOG` (default `warn`, `info` with
/// `verbose`). Verbose runs also log to a file under `~/.verifile/logs`; keep
/// the returned guard alive until exit so buffered lines are flushed.
pub fn init_tracing(verbose: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let file_dir = if verbose { crate::config::logs_dir() } else { None };
    match file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(
                dir,
                format!("vf-{}.log", Utc::now().format("%Y%m%dT%H%M%SZ")),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer().with_writer(writer).with_ansi(false);
            let _ = tracing_subscriber::registry().with(filter).with(console).with(file).try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry().with(filter).with(console).try_init();
            None
        }
    }
}
