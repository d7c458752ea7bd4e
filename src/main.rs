use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod autotag;
mod cmd;
mod config;
mod data_url;
mod dms;
mod errors;
mod jobs;
mod models;
mod ocr;
mod prelude;
mod prompt;
mod rate_limit;
mod rate_limited_model;
mod retry;
mod schema;
mod suggest;
mod ui;

/// An AI companion for a document management service: OCR new pages,
/// suggest metadata, and optionally apply it automatically to
/// trigger-tagged documents.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OPENAI_API_BASE (optional): Override the server URL.
  - OPENAI_API_KEY: The OpenAI key to use.
  - AZURE_API_KEY: The Azure Document Intelligence key to use.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run the OCR job manager and auto-tag control loop until interrupted.
    Serve(cmd::serve::ServeOpts),
    /// Run the OCR pipeline once over a single local image file, bypassing
    /// the DMS and job manager, for debugging a provider or prompt.
    Ocr(cmd::ocr::OcrOpts),
    /// Suggest metadata for a batch of documents read from a file.
    Suggest(cmd::suggest::SuggestOpts),
    /// Print schemas for input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Serve(_) => true,
            Cmd::Ocr(opts) => opts.output_path.is_none(),
            Cmd::Suggest(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point. Unlike a bare `fn main() -> Result<()>`, we classify the
/// error ourselves before exiting: a missing API key and a transient HTTP
/// failure shouldn't both just print a backtrace and return 1, since callers
/// scripting this binary need to tell "fix your config" apart from "retry
/// me" by exit code alone.
#[tokio::main]
async fn main() {
    let ui = Ui::init();

    // Initialize tracing.
    let directive = Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    if let Err(error) = real_main(ui).await {
        let app_error = errors::AppError::classify(error);
        eprintln!("Error: {app_error}");
        std::process::exit(app_error.exit_code());
    }
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Serve(opts) => {
            cmd::serve::cmd_serve(opts).await?;
        }
        Cmd::Ocr(opts) => {
            cmd::ocr::cmd_ocr(opts).await?;
        }
        Cmd::Suggest(opts) => {
            cmd::suggest::cmd_suggest(opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}
