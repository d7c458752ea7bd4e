//! The metadata suggestion engine (component E).
//!
//! Drives title/tag/correspondent/created-date/custom-field generation for
//! a batch of documents, one rendered prompt per enabled field per
//! document, through the rate-limited model. A failure on one field of one
//! document never aborts the batch; it's attached to that document's
//! record and every other field/document proceeds.

use std::collections::HashMap;

use futures::{StreamExt as _, stream};
use schemars::JsonSchema;
use tokio_util::sync::CancellationToken;

use crate::{
    dms::Document,
    models::ModelOpts,
    prelude::*,
    prompt::{
        ChatPrompt, TemplateRegistry, Unrendered,
        truncate::{ApproxTokenizer, Tokenizer, available_tokens, truncate},
    },
    rate_limited_model::RateLimitedModel,
    schema::Schema,
};

/// One metadata field the engine can generate a suggestion for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Title,
    Tag,
    Correspondent,
    CreatedDate,
    CustomField(String),
}

impl Field {
    fn template_name(&self) -> &str {
        match self {
            Field::Title => "title",
            Field::Tag => "tag",
            Field::Correspondent => "correspondent",
            Field::CreatedDate => "created_date",
            Field::CustomField(_) => "custom_field",
        }
    }

    fn result_key(&self) -> String {
        match self {
            Field::Title => "title".to_owned(),
            Field::Tag => "tag".to_owned(),
            Field::Correspondent => "correspondent".to_owned(),
            Field::CreatedDate => "created_date".to_owned(),
            Field::CustomField(name) => format!("custom_field:{name}"),
        }
    }

    fn response_schema(&self) -> Schema {
        match self {
            Field::Title => Schema::JsonValue {
                json: json!({
                    "title": "TitleSuggestion",
                    "type": "object",
                    "properties": {"title": {"type": "string", "description": "The suggested document title."}},
                    "required": ["title"],
                    "additionalProperties": false,
                }),
            },
            Field::Tag => Schema::JsonValue {
                json: json!({
                    "title": "TagSuggestion",
                    "type": "object",
                    "properties": {
                        "tags": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "The suggested tags for this document."
                        }
                    },
                    "required": ["tags"],
                    "additionalProperties": false,
                }),
            },
            Field::Correspondent => Schema::JsonValue {
                json: json!({
                    "title": "CorrespondentSuggestion",
                    "type": "object",
                    "properties": {"correspondent": {"type": "string", "description": "The suggested correspondent name."}},
                    "required": ["correspondent"],
                    "additionalProperties": false,
                }),
            },
            Field::CreatedDate => Schema::JsonValue {
                json: json!({
                    "title": "CreatedDateSuggestion",
                    "type": "object",
                    "properties": {"created_date": {"type": "string", "description": "The document's creation date, as YYYY-MM-DD."}},
                    "required": ["created_date"],
                    "additionalProperties": false,
                }),
            },
            Field::CustomField(_) => Schema::JsonValue {
                json: json!({
                    "title": "CustomFieldSuggestion",
                    "type": "object",
                    "properties": {"value": {"description": "The suggested value for this custom field."}},
                    "required": ["value"],
                    "additionalProperties": false,
                }),
            },
        }
    }
}

/// Candidate values the templates may offer the model as context, computed
/// once per batch rather than once per document.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    pub tags: Vec<String>,
    pub correspondents: Vec<String>,
    pub custom_fields: Vec<String>,
}

/// Per-document output: the original document plus whichever fields were
/// successfully suggested, and an error message (keyed by field) for
/// whichever weren't.
#[derive(Debug, Clone, Default, Serialize, JsonSchema)]
pub struct SuggestionResult {
    pub document_id: i64,
    pub title: Option<String>,
    pub tags: Option<Vec<String>>,
    pub correspondent: Option<String>,
    pub created_date: Option<String>,
    pub custom_fields: Option<HashMap<String, Value>>,
    pub errors: HashMap<String, String>,
}

impl SuggestionResult {
    fn for_document(document_id: i64) -> Self {
        Self {
            document_id,
            ..Default::default()
        }
    }
}

/// Drives per-field prompt construction, truncation, and model calls for a
/// batch of documents.
pub struct SuggestionEngine {
    registry: TemplateRegistry,
    model: RateLimitedModel,
    model_opts: ModelOpts,
    token_limit: i64,
    tokenizer: ApproxTokenizer,
    language: String,
    /// Bounded fan-out across documents; default 1 to respect upstream
    /// throttles, per the specification.
    worker_count: usize,
}

impl SuggestionEngine {
    pub fn new(
        registry: TemplateRegistry,
        model: RateLimitedModel,
        model_opts: ModelOpts,
        token_limit: i64,
        language: String,
        worker_count: usize,
    ) -> Self {
        Self {
            registry,
            model,
            model_opts,
            token_limit,
            tokenizer: ApproxTokenizer,
            language,
            worker_count: worker_count.max(1),
        }
    }

    /// Generate suggestions for every document in `documents`, for every
    /// field in `fields`. Output order matches `documents`' order
    /// regardless of completion order.
    #[instrument(level = "debug", skip_all, fields(documents = documents.len(), fields = fields.len()))]
    pub async fn suggest(
        &self,
        documents: Vec<Document>,
        fields: &[Field],
        candidates: &Candidates,
        cancellation: &CancellationToken,
    ) -> Vec<SuggestionResult> {
        let indexed: Vec<(usize, Document)> = documents.into_iter().enumerate().collect();

        let mut results: Vec<(usize, SuggestionResult)> = stream::iter(indexed)
            .map(|(index, document)| async move {
                let result = self.suggest_one(&document, fields, candidates, cancellation).await;
                (index, result)
            })
            .buffer_unordered(self.worker_count)
            .collect()
            .await;

        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    /// Generate every enabled field's suggestion for a single document. A
    /// field that fails (oversize prompt, model error) attaches its error
    /// to the record; the remaining fields still run.
    async fn suggest_one(
        &self,
        document: &Document,
        fields: &[Field],
        candidates: &Candidates,
        cancellation: &CancellationToken,
    ) -> SuggestionResult {
        let mut result = SuggestionResult::for_document(document.id);

        for field in fields {
            match self.suggest_field(document, field, candidates, cancellation).await {
                Ok(value) => self.attach(&mut result, field, value),
                Err(error) => {
                    result.errors.insert(field.result_key(), error.to_string());
                }
            }
        }

        result
    }

    fn attach(&self, result: &mut SuggestionResult, field: &Field, value: Value) {
        match field {
            Field::Title => result.title = value.get("title").and_then(Value::as_str).map(str::to_owned),
            Field::Tag => {
                result.tags = value.get("tags").and_then(Value::as_array).map(|tags| {
                    tags.iter().filter_map(Value::as_str).map(str::to_owned).collect()
                });
            }
            Field::Correspondent => {
                result.correspondent = value.get("correspondent").and_then(Value::as_str).map(str::to_owned);
            }
            Field::CreatedDate => {
                result.created_date = value.get("created_date").and_then(Value::as_str).map(str::to_owned);
            }
            Field::CustomField(name) => {
                if let Some(suggested) = value.get("value") {
                    result
                        .custom_fields
                        .get_or_insert_with(HashMap::new)
                        .insert(name.clone(), suggested.clone());
                }
            }
        }
    }

    /// Render the field's template, call the model, and return the raw
    /// structured response. Truncation and oversize handling happen here;
    /// per-field errors are returned, not panicked on.
    async fn suggest_field(
        &self,
        document: &Document,
        field: &Field,
        candidates: &Candidates,
        cancellation: &CancellationToken,
    ) -> Result<Value> {
        let template_name = field.template_name();

        let envelope_data = self.template_data(document, field, candidates, "");
        let envelope_text = self.registry.render(template_name, &envelope_data)?;
        let envelope_tokens = self.tokenizer.count_tokens(&envelope_text);

        let content = match available_tokens(envelope_tokens, self.token_limit)? {
            None => document.body.clone(),
            Some(budget) => truncate(&document.body, budget, &self.tokenizer)?,
        };

        let data = self.template_data(document, field, candidates, &content);
        let prompt = ChatPrompt::<Unrendered>::render(&self.registry, template_name, &data, vec![], field.response_schema())?;

        let response = self.model.chat_completion(&prompt, &self.model_opts, cancellation).await?;
        Ok(response.response)
    }

    fn template_data(&self, document: &Document, field: &Field, candidates: &Candidates, content: &str) -> Value {
        let mut data = json!({
            "language": self.language,
            "title": document.title,
            "tags": document.tags,
            "existing_tags": candidates.tags,
            "existing_correspondents": candidates.correspondents,
            "content": content,
        });

        if let Field::CustomField(name) = field {
            data["field_name"] = json!(name);
            data["field_description"] = json!(format!("the document's {name} value"));
        }

        data
    }
}

/// Compute candidate lists from the batch's documents and the DMS's known
/// tag/custom-field catalogs. Correspondent candidates come from the input
/// documents themselves; the DMS client interface (§H) has no dedicated
/// "list correspondents" capability.
pub fn candidates_from(documents: &[Document], known_tags: Vec<String>, known_custom_fields: Vec<String>) -> Candidates {
    let mut correspondents: Vec<String> = documents.iter().filter_map(|doc| doc.correspondent.clone()).collect();
    correspondents.sort();
    correspondents.dedup();

    Candidates {
        tags: known_tags,
        correspondents,
        custom_fields: known_custom_fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{ModelConfig, ModelKind, create_model},
        rate_limit::{RateLimit, RateLimitPeriod},
        rate_limited_model::RetryConfig,
    };

    fn sample_document() -> Document {
        Document {
            id: 1,
            title: "Untitled".to_owned(),
            body: "Dear Sir, please find enclosed the invoice for March.".to_owned(),
            tags: vec![],
            correspondent: None,
            custom_fields: HashMap::new(),
        }
    }

    fn engine(token_limit: i64) -> SuggestionEngine {
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
            token_limit,
            "English".to_owned(),
            2,
        )
    }

    #[tokio::test]
    async fn test_suggest_preserves_input_order() {
        let engine = engine(0);
        let documents = vec![
            Document { id: 1, ..sample_document() },
            Document { id: 2, ..sample_document() },
            Document { id: 3, ..sample_document() },
        ];
        let candidates = Candidates::default();
        let token = CancellationToken::new();
        let results = engine.suggest(documents, &[Field::Title], &candidates, &token).await;
        let ids: Vec<i64> = results.iter().map(|r| r.document_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_oversize_envelope_attaches_error_not_panic() {
        // A token limit far too small for even the envelope forces a
        // PromptOversize-shaped error, attached to the record rather than
        // propagated.
        let engine = engine(1);
        let documents = vec![sample_document()];
        let candidates = Candidates::default();
        let token = CancellationToken::new();
        let results = engine.suggest(documents, &[Field::Title], &candidates, &token).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].title.is_none());
        assert!(results[0].errors.contains_key("title"));
    }

    #[tokio::test]
    async fn test_successful_title_suggestion_via_echo_model() {
        let engine = engine(0);
        let documents = vec![sample_document()];
        let candidates = Candidates::default();
        let token = CancellationToken::new();
        let results = engine.suggest(documents, &[Field::Title], &candidates, &token).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].title.is_some());
        assert!(results[0].errors.is_empty());
    }
}
