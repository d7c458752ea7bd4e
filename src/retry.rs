//! Support utilities for [`keen_retry`]'s retry API.

use core::fmt;
use std::time::Duration;

use async_openai::error::OpenAIError;
use keen_retry::RetryResult;
use rand::Rng as _;
use reqwest::StatusCode;

use crate::prelude::*;

/// Macro which implements `?`-like behavior for [`RetryResult`].
macro_rules! try_with_retry_result {
    ($result:expr) => {
        match $result {
            ::keen_retry::RetryResult::Ok { output, .. } => output,
            ::keen_retry::RetryResult::Transient { input, error } => {
                return ::keen_retry::RetryResult::Transient {
                    input,
                    error: From::from(error),
                };
            }
            ::keen_retry::RetryResult::Fatal { input, error } => {
                return ::keen_retry::RetryResult::Fatal {
                    input,
                    error: From::from(error),
                };
            }
        }
    };
}

// Here's a trick to export a macro within a crate as if it were a normal
// symbol.
pub(crate) use try_with_retry_result;

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Convert a [`Result`] into a [`RetryResult`].
pub(crate) trait IntoRetryResult<T, E> {
    /// Convert a [`Result`] into a [`RetryResult::Transient`].
    fn into_transient(self) -> RetryResult<(), (), T, E>;

    /// Convert a [`Result`] into a [`RetryResult::Fatal`].
    fn into_fatal(self) -> RetryResult<(), (), T, E>;

    /// Convert a [`Result`] into an appropriate [`RetryResult`],
    /// depending on the return value of `is_transient`.
    fn into_retry_result<F>(self, is_transient: F) -> RetryResult<(), (), T, E>
    where
        F: FnOnce(&E) -> bool;
}

impl<T, E> IntoRetryResult<T, E> for Result<T, E>
where
    E: fmt::Debug,
{
    fn into_transient(self) -> RetryResult<(), (), T, E> {
        match self {
            Ok(value) => RetryResult::Ok {
                reported_input: (),
                output: value,
            },
            Err(error) => {
                debug!("Potentially transient error: {:?}", error);
                RetryResult::Transient { input: (), error }
            }
        }
    }

    fn into_fatal(self) -> RetryResult<(), (), T, E> {
        match self {
            Ok(value) => RetryResult::Ok {
                reported_input: (),
                output: value,
            },
            Err(error) => RetryResult::Fatal { input: (), error },
        }
    }

    fn into_retry_result<F>(self, is_transient: F) -> RetryResult<(), (), T, E>
    where
        F: FnOnce(&E) -> bool,
    {
        match self {
            Ok(value) => RetryResult::Ok {
                reported_input: (),
                output: value,
            },
            Err(error) if is_transient(&error) => {
                debug!("Potentially transient error: {:?}", error);
                RetryResult::Transient { input: (), error }
            }
            Err(error) => RetryResult::Fatal { input: (), error },
        }
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient. The prevents us
/// from doing large numbers of retries with exponential backoff on errors that
/// will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for OpenAIError {
    fn is_known_transient(&self) -> bool {
        match self {
            OpenAIError::Reqwest(error) => error.is_known_transient(),
            _ => false,
        }
    }
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Assume all other kinds of HTTP errors are transient. Unfortunately,
            // there are a lot of things that can go wrong, and `reqwest` doesn't
            // expose most of them in sufficient detail to be certain which are
            // transient.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

/// Build a [`RetryResult::Transient`] value.
pub(crate) fn retry_result_transient<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Transient { input: (), error }
}

/// Unwrap a [`Result`], converting `Err` into a fatal [`RetryResult`] and
/// returning early. Used for errors we never want to retry, such as a
/// malformed request we built ourselves.
macro_rules! try_fatal {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                return $crate::retry::retry_result_fatal(::anyhow::Error::from(error));
            }
        }
    };
}
pub(crate) use try_fatal;

/// Unwrap a [`Result`], converting `Err` into a transient [`RetryResult`] and
/// returning early. Used for errors we always want to retry, such as a
/// response that didn't match our requested schema.
macro_rules! try_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                return $crate::retry::retry_result_transient(::anyhow::Error::from(
                    error,
                ));
            }
        }
    };
}
pub(crate) use try_transient;

/// Unwrap a [`Result`] whose error type implements [`IsKnownTransient`],
/// converting `Err` into either a transient or fatal [`RetryResult`]
/// depending on [`IsKnownTransient::is_known_transient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                if $crate::retry::IsKnownTransient::is_known_transient(&error) {
                    return $crate::retry::retry_result_transient(::anyhow::Error::from(
                        error,
                    ));
                } else {
                    return $crate::retry::retry_result_fatal(::anyhow::Error::from(
                        error,
                    ));
                }
            }
        }
    };
}
pub(crate) use try_potentially_transient;

/// Exponential backoff with +/-20% jitter, doubling per attempt (1-based)
/// and capped at `max_wait`. Shared by the chat-completion retry wrapper
/// (`rate_limited_model::RetryConfig`) and [`with_http_retry`] below, so the
/// two retry paths can't silently drift apart.
pub(crate) fn backoff_for_attempt(min_wait: Duration, max_wait: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let unjittered = min_wait
        .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
        .min(max_wait);
    let jitter_ratio = rand::rng().random_range(0.8..=1.2);
    unjittered.mul_f64(jitter_ratio)
}

/// Retry policy for the direct HTTP calls OCR providers (component A) make
/// to their backends, independent of the chat-completion retry wrapper.
/// Per the specification, this is a fixed policy, not a configuration knob:
/// max 3 attempts, exponential backoff between 1s and 10s.
#[derive(Debug, Clone, Copy)]
pub struct HttpRetryConfig {
    pub max_retries: u32,
    pub backoff_min_wait: Duration,
    pub backoff_max_wait: Duration,
}

impl Default for HttpRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_min_wait: Duration::from_secs(1),
            backoff_max_wait: Duration::from_secs(10),
        }
    }
}

/// Retry `f` while it returns a [`reqwest::Error`] classified as transient
/// by [`IsKnownTransient`], using the same retry-classification machinery
/// as the chat-completion path instead of inventing a second one.
pub(crate) async fn with_http_retry<T, F, Fut>(config: &HttpRetryConfig, mut f: F) -> Result<T, reqwest::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, reqwest::Error>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt > config.max_retries || !error.is_known_transient() {
                    return Err(error);
                }
                let backoff = backoff_for_attempt(config.backoff_min_wait, config.backoff_max_wait, attempt);
                debug!(attempt, %error, ?backoff, "retrying transient HTTP error");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod http_retry_tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_with_http_retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let config = HttpRetryConfig {
            max_retries: 3,
            backoff_min_wait: Duration::from_millis(1),
            backoff_max_wait: Duration::from_millis(2),
        };
        let result: Result<u32, reqwest::Error> = with_http_retry(&config, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
