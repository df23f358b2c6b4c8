use clap::Parser;

use verifile::cli::{Cli, Commands};
use verifile::commands::{self, ReplicateCmd};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Commands::Replicate { verbose, .. } | Commands::Copy { verbose, .. } => *verbose,
        Commands::Hash { .. } => false,
    };
    let log_guard = verifile::util::init_tracing(verbose);

    let had_errors = match cli.command {
        Commands::Replicate {
            source,
            target,
            concurrency,
            quarantine_dir,
            defer_quarantine,
            recursive,
            deadline_secs,
            failures_out,
            tuning,
            json,
            quiet,
            verbose,
        } => commands::handle_replicate(ReplicateCmd {
            source,
            target,
            concurrency,
            quarantine_dir,
            defer_quarantine,
            recursive,
            deadline_secs,
            failures_out,
            tuning,
            json,
            quiet,
            verbose,
        })?,
        Commands::Copy { source, target, strategy, progress, tuning, .. } => {
            commands::handle_copy(&source, &target, strategy, progress, &tuning)?
        }
        Commands::Hash { paths } => commands::handle_hash(&paths)?,
    };

    if had_errors {
        // drop the guard first so the log file is flushed before exiting
        drop(log_guard);
        std::process::exit(1);
    }
    Ok(())
}
