//! The `serve` subcommand: run the OCR job manager (component F) and the
//! auto-tag control loop (component G) together against a DMS, until
//! interrupted.

use std::sync::Arc;

use clap::Args;

use crate::{
    autotag::AutoTagLoop,
    config::ConfigOverrides,
    dms::{DmsClient, FakeDmsClient},
    jobs::JobManager,
    models::{ModelConfig, ModelOpts, create_model},
    ocr::provider_from_config,
    prelude::*,
    prompt::TemplateRegistry,
    rate_limited_model::{RateLimitedModel, RetryConfig},
    suggest::SuggestionEngine,
};

/// Command-line arguments for the `serve` subcommand.
#[derive(Debug, Args)]
pub struct ServeOpts {
    /// Path to a config file (TOML).
    #[clap(long, default_value = "config.toml")]
    pub config_path: PathBuf,

    /// Seed the built-in fake DMS client from a JSON file of documents,
    /// instead of a real DMS endpoint. No real DMS client ships in this
    /// crate; wiring one in is outside this crate's scope.
    #[clap(long)]
    pub fake_dms_documents: Option<PathBuf>,

    #[clap(flatten)]
    pub config_overrides: ConfigOverrides,
}

/// The `serve` subcommand: runs the OCR job manager and the auto-tag loop
/// concurrently until `Ctrl-C` is received, then cancels both and waits for
/// them to wind down.
#[instrument(level = "info", skip_all)]
pub async fn cmd_serve(opts: &ServeOpts) -> Result<()> {
    let config = crate::config::load(&opts.config_path, opts.config_overrides.clone()).await?;

    let auto_tag = config
        .auto_tag
        .clone()
        .ok_or_else(|| anyhow!("serve requires auto_tag to be configured"))?;

    let dms: Arc<dyn DmsClient> = match &opts.fake_dms_documents {
        Some(path) => {
            let documents = crate::async_utils::io::read_json_or_toml(path).await?;
            Arc::new(FakeDmsClient::new(documents))
        }
        None => Arc::new(FakeDmsClient::new(vec![])),
    };

    let provider = provider_from_config(&config)?;
    let ocr_opts = crate::ocr::OcrOpts {
        enable_hocr: config.enable_hocr,
        ..Default::default()
    };
    let job_manager = JobManager::start(
        config.ocr_worker_count,
        config.ocr_queue_size,
        Arc::clone(&dms),
        provider,
        ocr_opts,
        config.hocr_output_path.clone(),
    );

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
    let engine = SuggestionEngine::new(
        registry,
        rate_limited,
        ModelOpts::default(),
        config.token_limit,
        config.llm_language.clone().unwrap_or_else(|| "English".to_owned()),
        1,
    );
    let control_loop = AutoTagLoop::new(Arc::clone(&dms), engine, auto_tag, config.polling_interval());

    let cancellation = tokio_util::sync::CancellationToken::new();
    let loop_cancellation = cancellation.clone();

    info!("serve started, awaiting Ctrl-C to shut down");

    tokio::select! {
        () = control_loop.run(&loop_cancellation) => {
            warn!("auto-tag loop exited on its own");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("shutdown signal received");
        }
    }

    cancellation.cancel();
    info!(grace_period = ?config.shutdown_grace_period(), "draining in-flight OCR jobs before exit");
    job_manager.shutdown(config.shutdown_grace_period()).await;

    Ok(())
}
