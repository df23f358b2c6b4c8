pub mod aggregator;
pub mod auto_concurrency;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod transfer;
pub mod util;

pub use aggregator::{ErrorAggregator, ErrorRecord};
pub use error::{ErrorKind, ReplicationError, Severity};
pub use transfer::{BatchOptions, BatchReport, replicate_directory};
