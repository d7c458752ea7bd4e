//! The `schema` subcommand: print the JSON Schema for one of our batch
//! input/output record types, for downstream tooling to validate against.

use clap::{Args, ValueEnum};
use schemars::schema_for;
use tokio::io::AsyncWriteExt as _;

use crate::{async_utils::io::create_writer, dms::Document, prelude::*, suggest::SuggestionResult};

/// The record types we can emit a schema for.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// The input document record consumed by `suggest`.
    Document,
    /// The output record produced by `suggest`.
    SuggestionResult,
}

/// Command-line arguments for the `schema` subcommand.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(opts: &SchemaOpts) -> Result<()> {
    let schema = match opts.schema_type {
        SchemaType::Document => schema_for!(Document),
        SchemaType::SuggestionResult => schema_for!(SuggestionResult),
    };

    let mut writer = create_writer(opts.output_path.as_deref()).await?;
    let schema_str = serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    writer.write_all(schema_str.as_bytes()).await.context("failed to write schema")?;
    writer.write_all(b"\n").await.context("failed to write schema")?;
    writer.flush().await.context("failed to flush schema")?;
    Ok(())
}
