//! Command-line entry points.

use clap::Args;

pub mod ocr;
pub mod schema;
pub mod serve;
pub mod suggest;

/// Common options for subcommands that process a batch of records with
/// bounded concurrency.
#[derive(Debug, Clone, Args)]
pub struct BatchOpts {
    /// Max number of documents/pages to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "1")]
    pub job_count: usize,
}
