//! Layered configuration: CLI flags override environment variables (loaded
//! from `.env` via `dotenvy`), which override `config.toml`. Unknown keys in
//! `config.toml` are rejected outright rather than silently ignored.

use std::time::Duration;

use serde::Deserialize;

use crate::{errors::AppError, models::ModelKind, prelude::*, rate_limit::RateLimit};

/// The OCR provider variant selected by `ocr_provider`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum OcrProviderKind {
    Llm,
    GoogleDocai,
    Azure,
    Docling,
    MistralOcr,
    IosOcr,
}

/// The full set of recognized configuration options (§6). Every field here
/// corresponds to one row of the configuration table; there is
/// intentionally no catch-all "extra options" bag, so a typo in
/// `config.toml` is a startup error instead of a silently-ignored key.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub llm_provider: Option<ModelKind>,
    pub llm_model: Option<String>,

    pub vision_llm_provider: Option<ModelKind>,
    pub vision_llm_model: Option<String>,
    pub vision_llm_prompt: Option<String>,
    pub vision_llm_max_tokens: Option<u32>,
    pub vision_llm_temperature: Option<f32>,

    pub ocr_provider: Option<OcrProviderKind>,

    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub azure_endpoint: Option<String>,
    pub azure_api_key: Option<String>,
    pub google_project_id: Option<String>,

    pub enable_hocr: bool,
    pub hocr_output_path: Option<PathBuf>,

    pub token_limit: i64,

    pub auto_tag: Option<String>,
    pub manual_tag: Option<String>,

    pub requests_per_minute: u32,
    pub max_retries: u32,
    pub backoff_max_wait_secs: u64,

    pub ocr_worker_count: usize,
    pub ocr_queue_size: usize,
    pub ocr_page_concurrency: usize,

    pub polling_interval_secs: u64,
    pub shutdown_grace_period_secs: u64,

    pub llm_language: Option<String>,

    pub prompts_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm_provider: None,
            llm_model: None,
            vision_llm_provider: None,
            vision_llm_model: None,
            vision_llm_prompt: None,
            vision_llm_max_tokens: None,
            vision_llm_temperature: None,
            ocr_provider: None,
            api_base: None,
            api_key: None,
            azure_endpoint: None,
            azure_api_key: None,
            google_project_id: None,
            enable_hocr: false,
            hocr_output_path: None,
            token_limit: 0,
            auto_tag: None,
            manual_tag: None,
            requests_per_minute: 60,
            max_retries: 3,
            backoff_max_wait_secs: 10,
            ocr_worker_count: 1,
            ocr_queue_size: 16,
            ocr_page_concurrency: 1,
            polling_interval_secs: 60,
            shutdown_grace_period_secs: 30,
            llm_language: None,
            prompts_dir: PathBuf::from("prompts"),
        }
    }
}

impl Config {
    /// `requests_per_minute` as a [`RateLimit`].
    pub fn rate_limit(&self) -> RateLimit {
        RateLimit::new(self.requests_per_minute as usize, crate::rate_limit::RateLimitPeriod::Minute)
    }

    /// `backoff_max_wait_secs` as a [`Duration`].
    pub fn backoff_max_wait(&self) -> Duration {
        Duration::from_secs(self.backoff_max_wait_secs)
    }

    /// `polling_interval_secs` as a [`Duration`].
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    /// `shutdown_grace_period_secs` as a [`Duration`].
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

/// Overrides an [`Opts`] (CLI flags) contributes on top of file/env config.
/// Every field is optional; `None` means "not overridden on the command
/// line, defer to the layer below."
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigOverrides {
    #[clap(long)]
    pub llm_provider: Option<ModelKind>,
    #[clap(long)]
    pub llm_model: Option<String>,
    #[clap(long)]
    pub ocr_provider: Option<OcrProviderKind>,
    #[clap(long)]
    pub enable_hocr: bool,
    #[clap(long)]
    pub token_limit: Option<i64>,
}

impl ConfigOverrides {
    fn apply(self, mut config: Config) -> Config {
        if let Some(v) = self.llm_provider {
            config.llm_provider = Some(v);
        }
        if let Some(v) = self.llm_model {
            config.llm_model = Some(v);
        }
        if let Some(v) = self.ocr_provider {
            config.ocr_provider = Some(v);
        }
        if self.enable_hocr {
            config.enable_hocr = true;
        }
        if let Some(v) = self.token_limit {
            config.token_limit = v;
        }
        config
    }
}

/// Load configuration: `config.toml` (if present) as the base layer,
/// environment variables (already loaded from `.env` by the caller) as the
/// middle layer, CLI overrides on top.
///
/// Environment variables are consulted only for secrets that shouldn't live
/// in a checked-in `config.toml`: `OPENAI_API_KEY`, `AZURE_API_KEY`, and
/// similar. Structural options (which provider, which model, worker counts)
/// belong in `config.toml` or on the command line.
#[instrument(level = "debug", skip(overrides))]
pub async fn load(config_path: &Path, overrides: ConfigOverrides) -> Result<Config> {
    let config = if config_path.exists() {
        let source = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("failed to read config file at {:?}", config_path))?;
        toml::from_str::<Config>(&source).map_err(|error| {
            if error.to_string().contains("unknown variant") {
                anyhow::Error::new(AppError::ProviderUnsupported(anyhow!(
                    "{error} (in config file at {config_path:?})"
                )))
            } else {
                anyhow::Error::new(error).context(format!("failed to parse config file at {config_path:?}"))
            }
        })?
    } else {
        Config::default()
    };

    let mut config = overrides.apply(config);

    if config.api_key.is_none() {
        config.api_key = std::env::var("OPENAI_API_KEY").ok();
    }
    if config.azure_api_key.is_none() {
        config.azure_api_key = std::env::var("AZURE_API_KEY").ok();
    }
    if config.api_base.is_none() {
        config.api_base = std::env::var("OPENAI_API_BASE").ok();
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_key_is_rejected() {
        let toml = r#"
not_a_real_option = true
"#;
        let result = toml::from_str::<Config>(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_defaults_when_absent() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.ocr_worker_count, 1);
        assert_eq!(config.requests_per_minute, 60);
        assert!(!config.enable_hocr);
    }

    #[test]
    fn test_cli_overrides_win_over_file() {
        let file_config: Config = toml::from_str("token_limit = 500").unwrap();
        let overrides = ConfigOverrides {
            token_limit: Some(1000),
            ..Default::default()
        };
        let merged = overrides.apply(file_config);
        assert_eq!(merged.token_limit, 1000);
    }
}
