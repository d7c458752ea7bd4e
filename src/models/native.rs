//! Vendor-native models, dispatched through [`genai`] rather than an
//! OpenAI-compatible relay. Used for vendors whose native SDK exposes
//! capabilities (e.g. provider-specific safety settings, thinking budgets)
//! that the OpenAI-compatible surface doesn't carry.

use genai::{
    Client,
    chat::{ChatMessage, ChatRequest, ChatRole, ContentPart, JsonSpec, MessageContent},
};

use crate::{
    data_url::parse_data_url,
    models::{ChatCompletionResponse, ModelOpts, ModelRetryResult, TokenUsage, detect_saturation, validate_response_schema},
    prelude::*,
    prompt::{ChatPrompt, Message, Rendered},
    retry::{retry_result_ok, try_fatal, try_potentially_transient, try_transient},
    schema::get_schema_title,
};

/// A vendor-native model: a `provider::model` identifier resolved by
/// `genai`'s own config/env-var lookup (e.g. `GEMINI_API_KEY`,
/// `ANTHROPIC_API_KEY`).
#[derive(Clone)]
pub struct NativeModel {
    client: Client,
    model: String,
}

impl NativeModel {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: Client::default(),
            model: model.into(),
        }
    }

    pub async fn chat_completion(
        &self,
        prompt: &ChatPrompt<Rendered>,
        opts: &ModelOpts,
    ) -> ModelRetryResult<ChatCompletionResponse> {
        let schema = try_fatal!(prompt.response_schema.to_json_schema().await);
        let messages = to_genai_messages(prompt);

        let mut request = ChatRequest::new(messages);
        if let Some(developer) = &prompt.developer {
            request = request.with_system(developer.clone());
        }

        let mut chat_options = genai::chat::ChatOptions::default();
        if let Some(max_tokens) = opts.max_tokens {
            chat_options = chat_options.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = opts.temperature {
            chat_options = chat_options.with_temperature(temperature as f64);
        }
        if let Some(top_p) = opts.top_p {
            chat_options = chat_options.with_top_p(top_p as f64);
        }
        chat_options = chat_options.with_response_format(JsonSpec::new(get_schema_title(&schema), schema));

        let response = try_potentially_transient!(
            opts.apply_timeout(async {
                self.client
                    .exec_chat(&self.model, request, Some(&chat_options))
                    .await
                    .map_err(anyhow::Error::from)
            })
            .await
        );

        let text = response.first_text().unwrap_or_default().to_owned();
        let response_json: Value = try_transient!(
            serde_json::from_str(&text).with_context(|| format!("model did not return valid JSON: {text:?}"))
        );
        try_transient!(validate_response_schema(&schema, &response_json));

        let token_usage = TokenUsage {
            prompt_tokens: response.usage.prompt_tokens.unwrap_or(0) as u32,
            completion_tokens: response.usage.completion_tokens.unwrap_or(0) as u32,
        };
        let saturated = detect_saturation(opts.max_tokens, token_usage.completion_tokens);

        retry_result_ok(ChatCompletionResponse {
            response: response_json,
            token_usage,
            saturated,
        })
    }
}

fn to_genai_messages(prompt: &ChatPrompt<Rendered>) -> Vec<ChatMessage> {
    prompt
        .messages
        .iter()
        .map(|message| match message {
            Message::User { text, images } => {
                let mut parts = Vec::new();
                if let Some(text) = text {
                    parts.push(ContentPart::from_text(text.clone()));
                }
                for image in images {
                    if let Some((mime_type, bytes)) = parse_data_url(image) {
                        parts.push(ContentPart::from_image_base64(
                            mime_type,
                            base64::Engine::encode(&base64::prelude::BASE64_STANDARD, bytes),
                        ));
                    } else {
                        // Not a data URL we recognize; pass it through as a
                        // remote image reference.
                        parts.push(ContentPart::from_image_url(image.clone()));
                    }
                }
                ChatMessage {
                    role: ChatRole::User,
                    content: MessageContent::from(parts),
                    options: None,
                }
            }
            Message::Assistant { json } => ChatMessage {
                role: ChatRole::Assistant,
                content: MessageContent::from(json.to_string()),
                options: None,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    #[test]
    fn test_to_genai_messages_preserves_order() {
        let prompt = ChatPrompt::<Rendered>::new(
            None,
            vec![
                Message::Assistant {
                    json: json!({"ok": true}),
                },
                Message::User {
                    text: Some("follow up".to_owned()),
                    images: vec![],
                },
            ],
            Schema::from_type::<()>(),
        );
        let messages = to_genai_messages(&prompt);
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0].role, ChatRole::Assistant));
        assert!(matches!(messages[1].role, ChatRole::User));
    }
}
