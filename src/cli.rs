use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::transfer::StrategyKind;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

/// Knobs shared by `replicate` and `copy`; each overrides the config file value.
#[derive(Args, Debug, Clone, Default)]
pub struct TuningArgs {
    #[clap(long = "retries", help = "Copy attempts per file before quarantine (default 3)")]
    pub retries: Option<u32>,
    #[clap(long = "base-delay-ms", help = "Backoff base delay in milliseconds (default 1000)")]
    pub base_delay_ms: Option<u64>,
    #[clap(long = "fixed-backoff", help = "Wait the base delay before every retry instead of doubling it")]
    pub fixed_backoff: bool,
    #[clap(long = "buf-kib", help = "Streamed copy buffer in KiB (default 8)")]
    pub buf_kib: Option<usize>,
    #[clap(long = "mmap-threshold-mib", help = "Files at least this large are copied via mmap (default 64)")]
    pub mmap_threshold_mib: Option<u64>,
    #[clap(long = "unsafe-mmap", help = "Skip per-window msync and final fsync for mapped copies")]
    pub unsafe_mmap: bool,
    #[clap(long = "config", help = "Config file (default ~/.verifile/config.json)")]
    pub config: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyArg {
    Streamed,
    Mmap,
    Kernel,
}

impl From<StrategyArg> for StrategyKind {
    fn from(s: StrategyArg) -> Self {
        match s {
            StrategyArg::Streamed => StrategyKind::Streamed,
            StrategyArg::Mmap => StrategyKind::Mmap,
            StrategyArg::Kernel => StrategyKind::Kernel,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Copy every file of a directory and verify each copy by SHA-256", name = "replicate")]
    Replicate {
        source: PathBuf,
        target: PathBuf,
        #[clap(short = 'c', long = "concurrency", help = "Number of concurrent workers (default: auto)")]
        concurrency: Option<usize>,
        #[clap(long = "quarantine-dir", help = "Where exhausted files go (default <SOURCE>/../quarantine)")]
        quarantine_dir: Option<PathBuf>,
        #[clap(long = "defer-quarantine", help = "Move exhausted files only after all workers finish")]
        defer_quarantine: bool,
        #[clap(long, help = "Descend into subdirectories, mirroring their layout")]
        recursive: bool,
        #[clap(long = "deadline-secs", help = "Cancel the batch after this many seconds")]
        deadline_secs: Option<u64>,
        #[clap(long = "failures-out", help = "JSON Lines failure report path (default ~/.verifile/logs)")]
        failures_out: Option<PathBuf>,
        #[clap(flatten)]
        tuning: TuningArgs,
        #[clap(long, help = "Print a one-line JSON summary")]
        json: bool,
        #[clap(short, long, help = "Suppress the human summary")]
        quiet: bool,
        #[clap(short, long, help = "Print verbose diagnostic logs and keep a log file")]
        verbose: bool,
    },
    #[clap(about = "Copy a single file with verification and retries", name = "copy")]
    Copy {
        source: PathBuf,
        target: PathBuf,
        #[clap(long, value_enum, help = "Force a copy strategy (default: by file size)")]
        strategy: Option<StrategyArg>,
        #[clap(long, help = "Print progress percentage while copying")]
        progress: bool,
        #[clap(flatten)]
        tuning: TuningArgs,
        #[clap(short, long, help = "Print verbose diagnostic logs")]
        verbose: bool,
    },
    #[clap(about = "Print SHA-256 fingerprints", name = "hash")]
    Hash {
        #[clap(num_args = 1.., required = true)]
        paths: Vec<PathBuf>,
    },
}
