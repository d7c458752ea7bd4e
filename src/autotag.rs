//! The auto-tag control loop (component G): polls the DMS for
//! auto-trigger-tagged documents, drives the suggestion engine over all
//! fields, and pushes results back. Runs until the caller cancels it.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    dms::{DmsClient, DocumentUpdate},
    errors::AppError,
    prelude::*,
    suggest::{Candidates, Field, SuggestionEngine, SuggestionResult, candidates_from},
};

/// `min_backoff` per the specification's retained open-question behavior:
/// any successful iteration, even one that found zero documents, resets to
/// this floor.
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

pub struct AutoTagLoop {
    dms: Arc<dyn DmsClient>,
    engine: SuggestionEngine,
    auto_tag: String,
    polling_interval: Duration,
}

impl AutoTagLoop {
    pub fn new(dms: Arc<dyn DmsClient>, engine: SuggestionEngine, auto_tag: String, polling_interval: Duration) -> Self {
        Self {
            dms,
            engine,
            auto_tag,
            polling_interval,
        }
    }

    /// Run the loop until `cancellation` fires. Honors cancellation at
    /// every sleep and call, per the specification.
    #[instrument(level = "info", skip_all)]
    pub async fn run(&self, cancellation: &CancellationToken) {
        let mut backoff = MIN_BACKOFF;

        loop {
            if cancellation.is_cancelled() {
                info!("auto-tag loop shutting down");
                return;
            }

            match self.run_iteration(cancellation).await {
                Ok(processed) => {
                    if processed > 0 {
                        info!(processed, "auto-tag iteration processed documents");
                    }
                    backoff = MIN_BACKOFF;
                    if !sleep_cancellably(self.polling_interval, cancellation).await {
                        return;
                    }
                }
                Err(error) => {
                    let app_error = AppError::classify(error);
                    if !app_error.is_backoff_trigger() {
                        error!(error = %app_error, "auto-tag loop hit a fatal configuration error, stopping");
                        return;
                    }
                    warn!(error = %app_error, ?backoff, "auto-tag iteration failed, backing off");
                    if !sleep_cancellably(backoff, cancellation).await {
                        return;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// One poll-process-push cycle. Returns the number of documents
    /// processed (zero is not an error — it's the "nothing to do" case).
    async fn run_iteration(&self, cancellation: &CancellationToken) -> Result<usize> {
        let documents = self
            .dms
            .list_documents_by_tag(&self.auto_tag)
            .await
            .context("listing auto-trigger-tagged documents")?;

        if documents.is_empty() {
            return Ok(0);
        }

        let known_tags = self.dms.list_tags().await.context("listing known tags")?;
        let known_custom_fields = self.dms.list_custom_fields().await.context("listing custom fields")?;
        let candidates = candidates_from(&documents, known_tags, known_custom_fields.clone());

        let fields = all_fields(&known_custom_fields);
        let document_count = documents.len();

        let results = self.engine.suggest(documents, &fields, &candidates, cancellation).await;

        for result in &results {
            self.push_result(result).await.with_context(|| format!("pushing update for document {}", result.document_id))?;
        }

        Ok(document_count)
    }

    async fn push_result(&self, result: &SuggestionResult) -> Result<()> {
        let update = DocumentUpdate {
            title: result.title.clone(),
            tags: result.tags.clone(),
            correspondent: result.correspondent.clone(),
            created_date: result.created_date.clone(),
            custom_fields: result.custom_fields.clone(),
        };
        if update.title.is_none()
            && update.tags.is_none()
            && update.correspondent.is_none()
            && update.created_date.is_none()
            && update.custom_fields.is_none()
        {
            // Every field failed (all attached to `errors`); nothing to push.
            return Ok(());
        }
        self.dms.update_document(result.document_id, update).await
    }
}

fn all_fields(known_custom_fields: &[String]) -> Vec<Field> {
    let mut fields = vec![Field::Title, Field::Tag, Field::Correspondent, Field::CreatedDate];
    fields.extend(known_custom_fields.iter().cloned().map(Field::CustomField));
    fields
}

/// Sleep for `duration`, but return early (with `false`) if `cancellation`
/// fires first. Returns `true` if the sleep ran to completion.
async fn sleep_cancellably(duration: Duration, cancellation: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dms::{Document, FakeDmsClient},
        models::{ModelConfig, ModelKind, ModelOpts, create_model},
        prompt::TemplateRegistry,
        rate_limit::{RateLimit, RateLimitPeriod},
        rate_limited_model::{RateLimitedModel, RetryConfig},
    };

    fn engine() -> SuggestionEngine {
        let model = create_model(&ModelConfig {
            kind: Some(ModelKind::Echo),
            ..Default::default()
        })
        .unwrap();
        let rate_limited = RateLimitedModel::new(model, RateLimit::new(1000, RateLimitPeriod::Second), RetryConfig::default());
        SuggestionEngine::new(
            TemplateRegistry::with_defaults(),
            rate_limited,
            ModelOpts::default(),
            0,
            "English".to_owned(),
            1,
        )
    }

    #[tokio::test]
    async fn test_empty_document_list_is_not_an_error() {
        let dms: Arc<dyn DmsClient> = Arc::new(FakeDmsClient::new(vec![]));
        let control_loop = AutoTagLoop::new(dms, engine(), "auto".to_owned(), Duration::from_millis(10));
        let token = CancellationToken::new();
        let processed = control_loop.run_iteration(&token).await.unwrap();
        assert_eq!(processed, 0);
    }

    #[tokio::test]
    async fn test_iteration_pushes_suggestions_for_tagged_documents() {
        let document = Document {
            id: 7,
            title: "Untitled".to_owned(),
            body: "Invoice body text.".to_owned(),
            tags: vec!["auto".to_owned()],
            correspondent: None,
            custom_fields: Default::default(),
        };
        let dms: Arc<dyn DmsClient> = Arc::new(FakeDmsClient::new(vec![document]));
        let control_loop = AutoTagLoop::new(Arc::clone(&dms), engine(), "auto".to_owned(), Duration::from_millis(10));
        let token = CancellationToken::new();
        let processed = control_loop.run_iteration(&token).await.unwrap();
        assert_eq!(processed, 1);

        let updated = dms.fetch_document(7).await.unwrap();
        assert_ne!(updated.title, "Untitled");
    }

    #[tokio::test]
    async fn test_cancellation_short_circuits_sleep() {
        let token = CancellationToken::new();
        token.cancel();
        let completed = sleep_cancellably(Duration::from_secs(60), &token).await;
        assert!(!completed);
    }

    #[test]
    fn test_config_missing_is_not_a_backoff_trigger() {
        let classified = AppError::classify(anyhow::Error::new(AppError::ConfigMissing(anyhow::anyhow!("no ocr provider"))));
        assert!(!classified.is_backoff_trigger());
    }
}
