//! The application-wide error taxonomy.
//!
//! Every fallible operation above the lowest-level I/O wrappers eventually
//! produces one of these variants, so callers that need to branch on *kind*
//! of failure (the auto-tag loop deciding whether to back off, the job
//! manager deciding whether to retry a page) can match on [`AppError`]
//! instead of string-sniffing an [`anyhow::Error`].

use std::fmt;

use async_openai::error::OpenAIError;

use crate::retry::IsKnownTransient;

/// A typed error, classified by the policy that should apply to it.
#[derive(Debug)]
pub enum AppError {
    /// Required configuration (an API key, a provider selection) was
    /// absent. Fatal at startup.
    ConfigMissing(anyhow::Error),
    /// The configured provider name doesn't match any known variant. Fatal
    /// at startup.
    ProviderUnsupported(anyhow::Error),
    /// Bytes handed to an image-only provider weren't a supported image
    /// format. The owning job fails; the process continues.
    UnsupportedMediaType(anyhow::Error),
    /// A retryable I/O failure (HTTP 5xx, timeout, connection reset) that
    /// exhausted its retry budget.
    TransientIo(anyhow::Error),
    /// The provider rejected our credentials. Surfaced immediately; never
    /// retried.
    AuthnAuthz(anyhow::Error),
    /// A prompt template's fixed envelope alone exceeds the token budget.
    /// The affected field is skipped; other fields and documents continue.
    PromptOversize(anyhow::Error),
    /// The caller's cancellation token fired mid-operation.
    Cancelled,
    /// An invariant was violated. Fatal to the affected job or request; the
    /// process itself keeps running.
    Internal(anyhow::Error),
}

impl AppError {
    /// Should this error trigger a process-level backoff in the auto-tag
    /// loop, as opposed to being fatal to a single document or request?
    pub fn is_backoff_trigger(&self) -> bool {
        !matches!(self, AppError::ConfigMissing(_) | AppError::ProviderUnsupported(_))
    }

    /// The exit code a CLI invocation should use if this error escapes
    /// `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::ConfigMissing(_) | AppError::ProviderUnsupported(_) => 2,
            _ => 1,
        }
    }

    /// Classify an arbitrary error into our taxonomy. Reuses the
    /// `reqwest`/`async-openai` transient judgment already implemented for
    /// the retry paths (`retry::IsKnownTransient`) rather than re-deriving a
    /// second opinion on the same errors.
    pub fn classify(error: anyhow::Error) -> AppError {
        if error.is::<AppError>() {
            return error.downcast::<AppError>().expect("just checked with is::<AppError>()");
        }

        let known_transient = error.chain().find_map(|cause| {
            if let Some(reqwest_err) = cause.downcast_ref::<reqwest::Error>() {
                Some(reqwest_err.is_known_transient())
            } else {
                cause.downcast_ref::<OpenAIError>().map(|openai_err| openai_err.is_known_transient())
            }
        });

        match known_transient {
            Some(true) => AppError::TransientIo(error),
            _ => AppError::Internal(error),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::ConfigMissing(err) => write!(f, "missing configuration: {err}"),
            AppError::ProviderUnsupported(err) => write!(f, "unsupported provider: {err}"),
            AppError::UnsupportedMediaType(err) => write!(f, "unsupported file type: {err}"),
            AppError::TransientIo(err) => write!(f, "request failed: {err}"),
            AppError::AuthnAuthz(err) => write!(f, "authentication failed: {err}"),
            AppError::PromptOversize(err) => write!(f, "prompt template exceeds token limit: {err}"),
            AppError::Cancelled => write!(f, "operation cancelled"),
            AppError::Internal(err) => write!(f, "internal error: {err}"),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::ConfigMissing(err)
            | AppError::ProviderUnsupported(err)
            | AppError::UnsupportedMediaType(err)
            | AppError::TransientIo(err)
            | AppError::AuthnAuthz(err)
            | AppError::PromptOversize(err)
            | AppError::Internal(err) => err.chain().next().map(|e| e as &(dyn std::error::Error + 'static)),
            AppError::Cancelled => None,
        }
    }
}

impl IsKnownTransient for AppError {
    fn is_known_transient(&self) -> bool {
        matches!(self, AppError::TransientIo(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_missing_is_not_a_backoff_trigger() {
        let err = AppError::ConfigMissing(anyhow::anyhow!("missing OPENAI_API_KEY"));
        assert!(!err.is_backoff_trigger());
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_transient_io_is_a_backoff_trigger_and_known_transient() {
        let err = AppError::TransientIo(anyhow::anyhow!("HTTP 503"));
        assert!(err.is_backoff_trigger());
        assert!(err.is_known_transient());
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_cancelled_is_a_backoff_trigger_but_not_transient() {
        let err = AppError::Cancelled;
        assert!(err.is_backoff_trigger());
        assert!(!err.is_known_transient());
    }

    #[test]
    fn test_classify_passes_through_an_existing_app_error() {
        let classified = AppError::classify(anyhow::Error::new(AppError::ConfigMissing(anyhow::anyhow!("no key"))));
        assert!(matches!(classified, AppError::ConfigMissing(_)));
    }

    #[test]
    fn test_classify_defaults_unrecognized_errors_to_internal() {
        let classified = AppError::classify(anyhow::anyhow!("some ad-hoc failure"));
        assert!(matches!(classified, AppError::Internal(_)));
    }
}
