//! The `suggest` subcommand: run the metadata suggestion engine over a
//! batch of documents read from a file, independent of any live DMS.

use clap::Args;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::{create_writer, read_json_or_toml},
    cmd::BatchOpts,
    config::ConfigOverrides,
    dms::Document,
    models::{ModelConfig, ModelOpts, create_model},
    prelude::*,
    prompt::TemplateRegistry,
    rate_limited_model::{RateLimitedModel, RetryConfig},
    suggest::{Candidates, Field, SuggestionEngine},
};

/// The input file's shape: `{"documents": [...]}`.
#[derive(Debug, Deserialize)]
struct SuggestBatchInput {
    documents: Vec<Document>,
}

/// Command-line arguments for the `suggest` subcommand.
#[derive(Debug, Args)]
pub struct SuggestOpts {
    /// Path to a config file (TOML).
    #[clap(long, default_value = "config.toml")]
    pub config_path: PathBuf,

    /// Input batch file (JSON or TOML), containing a `documents` array.
    pub input_path: PathBuf,

    /// Output location. Defaults to standard output. One JSON record per
    /// line.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Which fields to generate suggestions for. Defaults to all.
    #[clap(long = "field", value_enum)]
    pub fields: Vec<SuggestField>,

    #[clap(flatten)]
    pub config_overrides: ConfigOverrides,

    #[clap(flatten)]
    pub batch_opts: BatchOpts,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum SuggestField {
    Title,
    Tag,
    Correspondent,
    CreatedDate,
}

impl From<SuggestField> for Field {
    fn from(value: SuggestField) -> Self {
        match value {
            SuggestField::Title => Field::Title,
            SuggestField::Tag => Field::Tag,
            SuggestField::Correspondent => Field::Correspondent,
            SuggestField::CreatedDate => Field::CreatedDate,
        }
    }
}

/// The `suggest` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_suggest(opts: &SuggestOpts) -> Result<()> {
    let config = crate::config::load(&opts.config_path, opts.config_overrides.clone()).await?;

    let model = create_model(&ModelConfig {
        kind: config.llm_provider,
        model: config.llm_model.clone().unwrap_or_default(),
        api_base: config.api_base.clone(),
        api_key: config.api_key.clone(),
    })?;
    let rate_limited = RateLimitedModel::new(
        model,
        config.rate_limit(),
        RetryConfig {
            max_retries: config.max_retries,
            backoff_max_wait: config.backoff_max_wait(),
            ..Default::default()
        },
    );
    let registry = TemplateRegistry::load_from_dir(&config.prompts_dir).await?;

    let fields: Vec<Field> = if opts.fields.is_empty() {
        vec![Field::Title, Field::Tag, Field::Correspondent, Field::CreatedDate]
    } else {
        opts.fields.iter().copied().map(Field::from).collect()
    };

    let worker_count = opts.batch_opts.job_count.max(1);
    let engine = SuggestionEngine::new(
        registry,
        rate_limited,
        ModelOpts::default(),
        config.token_limit,
        config.llm_language.clone().unwrap_or_else(|| "English".to_owned()),
        worker_count,
    );

    let input: SuggestBatchInput = read_json_or_toml(&opts.input_path).await?;
    let candidates = Candidates::default();
    let cancellation = tokio_util::sync::CancellationToken::new();
    let results = engine.suggest(input.documents, &fields, &candidates, &cancellation).await;

    let mut writer = create_writer(opts.output_path.as_deref()).await?;
    for result in &results {
        let line = serde_json::to_string(result).context("failed to serialize suggestion result")?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    writer.flush().await?;

    Ok(())
}
