//! The LLM model abstraction (component B).
//!
//! A [`Model`] is a closed sum type with one variant per backend family:
//! OpenAI-compatible chat-completion endpoints (including Azure and
//! self-hosted relays such as LiteLLM or Ollama), vendor-native SDKs (via
//! [`genai`]), and a fixed `echo` model used in tests and dry runs. Adding a
//! new backend means adding a variant and a constructor, not teaching every
//! caller about a new trait object.

use keen_retry::RetryResult;

use crate::{
    prelude::*,
    prompt::{ChatPrompt, Rendered},
    rate_limit::RateLimit,
};

pub mod echo;
pub mod native;
pub mod openai;

/// Which model backend a [`Model`] talks to. Used by configuration to pick
/// a variant without exposing the variant's internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum ModelKind {
    /// An OpenAI-compatible `/chat/completions` endpoint.
    OpenAiCompatible,
    /// A vendor-native SDK, dispatched through [`genai`].
    Native,
    /// A fixed model that echoes its input back. Used for tests.
    Echo,
}

/// Options common to every model call. Unknown or unsupported options are
/// ignored silently by whichever variant receives them, per the contract.
#[derive(Debug, Clone, clap::Args)]
pub struct ModelOpts {
    /// Maximum number of completion tokens. Absent means no cap.
    #[clap(long)]
    pub max_tokens: Option<u32>,

    /// Sampling temperature.
    #[clap(long)]
    pub temperature: Option<f32>,

    /// Nucleus sampling parameter.
    #[clap(long)]
    pub top_p: Option<f32>,

    /// Top-k sampling parameter. Only honored by providers that support it.
    #[clap(long)]
    pub top_k: Option<u32>,

    /// Reasoning/thinking token budget. Only honored by providers that
    /// support it.
    #[clap(long)]
    pub thinking_budget: Option<u32>,

    /// Per-call timeout, in seconds.
    #[clap(long, default_value_t = 60)]
    pub timeout_secs: u64,

    /// Requests-per-minute (or -second) throttle applied by the rate-limited
    /// wrapper around this model.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,
}

impl Default for ModelOpts {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            thinking_budget: None,
            timeout_secs: 60,
            rate_limit: None,
        }
    }
}

impl ModelOpts {
    /// This call's configured timeout.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    /// Wrap a future with this call's configured timeout.
    pub async fn apply_timeout<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let timeout = self.timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| anyhow!("request timed out after {:?}", timeout))?
    }
}

/// Token accounting for a single model call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Is this usage record entirely absent (provider didn't report it)?
    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
    }
}

/// The result of a single chat completion call.
#[derive(Debug, Clone)]
pub struct ChatCompletionResponse {
    /// The assistant's response, parsed as JSON per the requested schema.
    pub response: Value,
    /// Token usage, if the provider reported it.
    pub token_usage: TokenUsage,
    /// Did the model's output appear to be cut off by `max_tokens`?
    pub saturated: bool,
}

/// Retry-aware result type used throughout the model layer. The `()`
/// reported-input/input slots mean retries replay the whole call rather
/// than threading partial state back in; chat completions have no partial
/// progress worth preserving between attempts.
pub type ModelRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// A configured language model, ready to accept rendered prompts.
#[derive(Clone)]
pub enum Model {
    OpenAiCompatible(openai::OpenAiModel),
    Native(native::NativeModel),
    Echo(echo::EchoModel),
}

impl Model {
    /// Run one chat completion. Callers needing retry/backoff should wrap
    /// this in the rate-limited wrapper (component C) rather than retrying
    /// here directly.
    #[instrument(level = "debug", skip(self, prompt), fields(kind = self.kind_name()))]
    pub async fn chat_completion(
        &self,
        prompt: &ChatPrompt<Rendered>,
        opts: &ModelOpts,
    ) -> ModelRetryResult<ChatCompletionResponse> {
        match self {
            Model::OpenAiCompatible(model) => model.chat_completion(prompt, opts).await,
            Model::Native(model) => model.chat_completion(prompt, opts).await,
            Model::Echo(model) => model.chat_completion(prompt, opts).await,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Model::OpenAiCompatible(_) => "openai_compatible",
            Model::Native(_) => "native",
            Model::Echo(_) => "echo",
        }
    }
}

/// Config needed to construct a [`Model`] of any kind. Only the fields
/// relevant to the selected `kind` need to be set; others are ignored.
#[derive(Debug, Clone, Default)]
pub struct ModelConfig {
    pub kind: Option<ModelKind>,
    pub model: String,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
}

/// Build the [`Model`] selected by `config.kind`. Mirrors the "closed sum
/// type, one constructor per variant" design: the match arm is the only
/// place a new variant needs to be wired in.
pub fn create_model(config: &ModelConfig) -> Result<Model> {
    let kind = config.kind.ok_or_else(|| {
        crate::errors::AppError::ConfigMissing(anyhow!("no model provider configured (llm_provider / vision_llm_provider)"))
    })?;
    match kind {
        ModelKind::OpenAiCompatible => Ok(Model::OpenAiCompatible(openai::OpenAiModel::new(
            config.model.clone(),
            config.api_base.clone(),
            config.api_key.clone(),
        ))),
        ModelKind::Native => Ok(Model::Native(native::NativeModel::new(config.model.clone()))),
        ModelKind::Echo => Ok(Model::Echo(echo::EchoModel)),
    }
}

/// Validate a parsed model response against the schema we asked it to
/// follow. A well-behaved provider honoring `response_format`/`JsonSpec`
/// should never fail this, but some relays apply it loosely or ignore it
/// under load, so callers treat a mismatch as a transient, retryable
/// failure rather than a fatal one.
pub fn validate_response_schema(schema: &Value, response: &Value) -> Result<()> {
    let validator = jsonschema::validator_for(schema).context("response schema is not a valid JSON Schema")?;
    let errors: Vec<String> = validator.iter_errors(response).map(|error| error.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("model response did not match the requested schema: {}", errors.join("; ")))
    }
}

/// Detect output saturation: the model's completion used at least as many
/// tokens as the configured cap, so the text was likely truncated.
pub fn detect_saturation(max_tokens: Option<u32>, completion_tokens: u32) -> bool {
    match max_tokens {
        Some(max_tokens) if max_tokens > 0 => completion_tokens >= max_tokens,
        _ => false,
    }
}

/// Strip a `<think>...</think>` span emitted by reasoning models.
///
/// If the opening tag is present without a matching closing tag, the string
/// is returned unchanged; we don't guess at where reasoning might have
/// ended.
pub fn strip_reasoning(text: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";
    match (text.find(OPEN), text.find(CLOSE)) {
        (Some(start), Some(end)) if end > start => {
            let mut result = String::with_capacity(text.len());
            result.push_str(&text[..start]);
            result.push_str(&text[end + CLOSE.len()..]);
            result.trim().to_owned()
        }
        _ => text.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_reasoning_removes_span() {
        let text = "before<think>internal monologue</think>after";
        assert_eq!(strip_reasoning(text), "beforeafter");
    }

    #[test]
    fn test_strip_reasoning_idempotent() {
        let text = "before<think>internal monologue</think>after";
        let once = strip_reasoning(text);
        let twice = strip_reasoning(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_strip_reasoning_leaves_plain_text_unchanged() {
        assert_eq!(strip_reasoning("no think span here"), "no think span here");
    }

    #[test]
    fn test_strip_reasoning_unmatched_open_tag_unchanged() {
        let text = "before<think>no closing tag";
        assert_eq!(strip_reasoning(text), text);
    }

    #[test]
    fn test_detect_saturation() {
        assert!(detect_saturation(Some(100), 100));
        assert!(detect_saturation(Some(100), 150));
        assert!(!detect_saturation(Some(100), 99));
        assert!(!detect_saturation(None, 100));
        assert!(!detect_saturation(Some(0), 100));
    }

    #[test]
    fn test_validate_response_schema_accepts_matching_response() {
        let schema = json!({
            "type": "object",
            "properties": {"title": {"type": "string"}},
            "required": ["title"],
        });
        let response = json!({"title": "Invoice"});
        assert!(validate_response_schema(&schema, &response).is_ok());
    }

    #[test]
    fn test_validate_response_schema_rejects_mismatched_response() {
        let schema = json!({
            "type": "object",
            "properties": {"title": {"type": "string"}},
            "required": ["title"],
        });
        let response = json!({"title": 42});
        assert!(validate_response_schema(&schema, &response).is_err());
    }
}
