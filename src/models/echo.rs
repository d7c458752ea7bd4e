//! The `echo` model: a fixed, deterministic model used in tests, dry runs,
//! and the `schema` debug subcommand. It never makes a network call.

use crate::{
    models::{ChatCompletionResponse, ModelOpts, ModelRetryResult, TokenUsage},
    prelude::*,
    prompt::{ChatPrompt, Message, Rendered},
    retry::retry_result_ok,
};

/// A model that synthesizes a response matching the requested schema out of
/// the prompt's own text, without calling out to any provider.
#[derive(Clone, Default)]
pub struct EchoModel;

impl EchoModel {
    pub async fn chat_completion(
        &self,
        prompt: &ChatPrompt<Rendered>,
        _opts: &ModelOpts,
    ) -> ModelRetryResult<ChatCompletionResponse> {
        let text = prompt
            .messages
            .iter()
            .rev()
            .find_map(|message| match message {
                Message::User { text, .. } => text.clone(),
                Message::Assistant { .. } => None,
            })
            .unwrap_or_default();

        let schema = match prompt.response_schema.to_json_schema().await {
            Ok(schema) => schema,
            Err(error) => return crate::retry::retry_result_fatal(error),
        };

        let response = synthesize(&schema, &text);

        retry_result_ok(ChatCompletionResponse {
            response,
            token_usage: TokenUsage {
                prompt_tokens: text.split_whitespace().count() as u32,
                completion_tokens: 0,
            },
            saturated: false,
        })
    }
}

/// Build a minimal value matching `schema`'s declared type, substituting
/// `text` wherever a string is expected. This is intentionally naive; it
/// exists to exercise the plumbing, not to simulate a real model.
fn synthesize(schema: &Value, text: &str) -> Value {
    match schema.get("type").and_then(Value::as_str) {
        Some("object") => {
            let mut object = serde_json::Map::new();
            if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
                for (key, subschema) in properties {
                    object.insert(key.clone(), synthesize(subschema, text));
                }
            }
            Value::Object(object)
        }
        Some("array") => {
            let item_schema = schema.get("items").cloned().unwrap_or(json!({"type": "string"}));
            Value::Array(vec![synthesize(&item_schema, text)])
        }
        Some("number") => json!(0),
        Some("boolean") => json!(false),
        _ => Value::String(text.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    #[tokio::test]
    async fn test_echo_returns_text_for_string_schema() {
        let model = EchoModel;
        let prompt = ChatPrompt::<Rendered>::new(
            None,
            vec![Message::User {
                text: Some("hello world".to_owned()),
                images: vec![],
            }],
            Schema::from_type::<String>(),
        );
        let result = model.chat_completion(&prompt, &ModelOpts::default()).await;
        match result {
            keen_retry::RetryResult::Ok { output, .. } => {
                assert_eq!(output.response, json!("hello world"));
            }
            _ => panic!("expected the echo model to succeed"),
        }
    }
}
