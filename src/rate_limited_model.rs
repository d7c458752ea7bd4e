//! The rate-limited LLM wrapper (component C).
//!
//! Wraps any [`Model`] with a token-bucket throttle and exponential-backoff
//! retry. The contract is identical to the wrapped model's: callers can't
//! tell a [`RateLimitedModel`] from a bare [`Model`] except that it's
//! slower under load and recovers from transient failures on its own.

use std::{sync::Arc, time::Duration};

use keen_retry::RetryResult;
use leaky_bucket::RateLimiter;

use crate::{
    models::{ChatCompletionResponse, Model, ModelOpts},
    prelude::*,
    prompt::{ChatPrompt, Rendered},
    rate_limit::RateLimit,
};

/// Configuration for the retry policy layered on top of the token bucket.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Smallest backoff between retries.
    pub backoff_min_wait: Duration,
    /// Largest backoff between retries; exponential growth is capped here.
    pub backoff_max_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_min_wait: Duration::from_secs(1),
            backoff_max_wait: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// The backoff to wait before retry attempt number `attempt` (1-based),
    /// doubling each time and capped at `backoff_max_wait`, with +/-20%
    /// jitter so many concurrent callers don't retry in lockstep. Shares its
    /// formula with the OCR provider HTTP retry (`retry::with_http_retry`)
    /// via `retry::backoff_for_attempt`.
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        crate::retry::backoff_for_attempt(self.backoff_min_wait, self.backoff_max_wait, attempt)
    }
}

/// A model wrapped with a token-bucket throttle and retrying dispatcher.
#[derive(Clone)]
pub struct RateLimitedModel {
    model: Arc<Model>,
    limiter: Arc<RateLimiter>,
    retry_config: RetryConfig,
}

impl RateLimitedModel {
    /// Wrap `model`, throttling to `rate_limit` and retrying per
    /// `retry_config`.
    pub fn new(model: Model, rate_limit: RateLimit, retry_config: RetryConfig) -> Self {
        Self {
            model: Arc::new(model),
            limiter: Arc::new(rate_limit.to_rate_limiter()),
            retry_config,
        }
    }

    /// Run one chat completion, acquiring a rate-limit token first and
    /// retrying on transient failure with exponential backoff.
    ///
    /// Guarantees: exactly one downstream call per retry attempt; total
    /// attempts never exceed `max_retries + 1`; cancellation is surfaced
    /// immediately and never retried, even mid-backoff.
    #[instrument(level = "debug", skip(self, prompt, cancellation))]
    pub async fn chat_completion(
        &self,
        prompt: &ChatPrompt<Rendered>,
        opts: &ModelOpts,
        cancellation: &tokio_util::sync::CancellationToken,
    ) -> Result<ChatCompletionResponse> {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                return Err(anyhow!("cancelled while waiting for rate-limit token"));
            }
            () = self.limiter.acquire_one() => {}
        }

        let mut attempt: u32 = 0;
        let mut last_error;
        loop {
            attempt += 1;
            match self.model.chat_completion(prompt, opts).await {
                RetryResult::Ok { output, .. } => {
                    if attempt > 1 {
                        debug!(attempt, "chat completion recovered after transient failure");
                    }
                    return Ok(output);
                }
                RetryResult::Fatal { error, .. } => return Err(error),
                RetryResult::Transient { error, .. } => {
                    last_error = error;
                }
            }

            if attempt > self.retry_config.max_retries {
                warn!(attempt, "chat completion retries exhausted");
                return Err(anyhow!("all retry attempts failed: {last_error}"));
            }

            let backoff = self.retry_config.backoff_for_attempt(attempt);
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    return Err(anyhow!("cancelled during retry backoff"));
                }
                () = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{ModelConfig, ModelKind, create_model},
        prompt::Message,
        rate_limit::RateLimitPeriod,
        schema::Schema,
    };

    fn echo_model() -> Model {
        create_model(&ModelConfig {
            kind: Some(ModelKind::Echo),
            ..Default::default()
        })
        .unwrap()
    }

    fn ping_prompt() -> ChatPrompt<Rendered> {
        ChatPrompt::<Rendered>::new(
            None,
            vec![Message::User {
                text: Some("ping".to_owned()),
                images: vec![],
            }],
            Schema::from_type::<String>(),
        )
    }

    #[tokio::test]
    async fn test_successful_call_acquires_token_and_returns() {
        let wrapped = RateLimitedModel::new(
            echo_model(),
            RateLimit::new(60, RateLimitPeriod::Minute),
            RetryConfig::default(),
        );
        let token = tokio_util::sync::CancellationToken::new();
        let result = wrapped
            .chat_completion(&ping_prompt(), &ModelOpts::default(), &token)
            .await
            .unwrap();
        assert_eq!(result.response, json!("ping"));
    }

    #[tokio::test]
    async fn test_cancellation_before_token_acquisition_is_not_retried() {
        let wrapped = RateLimitedModel::new(
            echo_model(),
            RateLimit::new(1, RateLimitPeriod::Second),
            RetryConfig::default(),
        );
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let result = wrapped
            .chat_completion(&ping_prompt(), &ModelOpts::default(), &token)
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_backoff_caps_at_max_wait() {
        let config = RetryConfig {
            max_retries: 10,
            backoff_min_wait: Duration::from_secs(1),
            backoff_max_wait: Duration::from_secs(10),
        };
        for attempt in 1..=10 {
            let backoff = config.backoff_for_attempt(attempt);
            assert!(backoff <= Duration::from_secs(12), "attempt {attempt} backoff {backoff:?} exceeded cap");
        }
    }

}
