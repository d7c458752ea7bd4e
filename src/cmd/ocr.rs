//! The `ocr` subcommand: a debugging tool that runs the configured OCR
//! provider once over a single local image, bypassing the DMS and the job
//! manager's queue entirely. Prints either the `OcrResult` as pretty JSON,
//! or — when hOCR is enabled and the provider supports it — the finalized
//! hOCR XML document, to stdout or `--out`.

use clap::Args;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer,
    config::{ConfigOverrides, OcrProviderKind},
    ocr::OcrOpts as OcrRunOpts,
    prelude::*,
};

/// Command-line arguments for the `ocr` subcommand.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Path to a config file (TOML).
    #[clap(long, default_value = "config.toml")]
    pub config_path: PathBuf,

    /// The page image to OCR.
    #[clap(long)]
    pub input: PathBuf,

    /// Override the configured OCR provider for this one run.
    #[clap(long, value_enum)]
    pub provider: Option<OcrProviderKind>,

    /// Output location. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Emit hOCR structured layout instead of plain-text JSON, if the
    /// configured provider supports it.
    #[clap(long)]
    pub enable_hocr: bool,

    #[clap(flatten)]
    pub config_overrides: ConfigOverrides,
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(opts: &OcrOpts) -> Result<()> {
    let mut config = crate::config::load(&opts.config_path, opts.config_overrides.clone()).await?;
    if let Some(provider) = opts.provider {
        config.ocr_provider = Some(provider);
    }
    let provider = crate::ocr::provider_from_config(&config)?;

    let run_opts = OcrRunOpts {
        enable_hocr: opts.enable_hocr || config.enable_hocr,
        ..Default::default()
    };

    let bytes = tokio::fs::read(&opts.input).await.with_context(|| format!("reading {:?}", opts.input))?;
    let result = provider.process_image(&bytes, 1, &run_opts).await?;

    let mut writer = create_writer(opts.output_path.as_deref()).await?;
    if run_opts.enable_hocr {
        if let Some(accumulator) = provider.hocr_accumulator() {
            writer.write_all(accumulator.finalize().as_bytes()).await?;
            writer.flush().await?;
            return Ok(());
        }
        warn!("--enable-hocr was set, but the selected provider doesn't emit hOCR; printing JSON instead");
    }

    let json = serde_json::to_string_pretty(&result).context("failed to serialize OCR result")?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    Ok(())
}
