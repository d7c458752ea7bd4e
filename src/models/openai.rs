//! OpenAI-compatible chat-completion models: OpenAI itself, Azure OpenAI,
//! and self-hosted relays (LiteLLM, Ollama's OpenAI-compatible endpoint,
//! vLLM, etc.) that all speak the same wire format.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart,
        ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs,
        CreateChatCompletionRequestArgs, FinishReason, ImageUrlArgs, ResponseFormat,
        ResponseFormatJsonSchema,
    },
};

use crate::{
    models::{ChatCompletionResponse, ModelOpts, ModelRetryResult, TokenUsage, detect_saturation, validate_response_schema},
    prelude::*,
    prompt::{ChatPrompt, Message, Rendered},
    retry::{retry_result_ok, try_fatal, try_potentially_transient, try_transient},
    schema::get_schema_title,
};

/// An OpenAI-compatible chat model: a base URL, an API key, and a model
/// name. The same struct serves OpenAI, Azure, and any relay that mimics
/// the `/chat/completions` wire format.
#[derive(Clone)]
pub struct OpenAiModel {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiModel {
    /// Build a model pointed at `api_base` (or OpenAI's default when
    /// `None`), authenticating with `api_key`.
    pub fn new(model: impl Into<String>, api_base: Option<String>, api_key: Option<String>) -> Self {
        let mut config = OpenAIConfig::new();
        if let Some(api_base) = api_base {
            config = config.with_api_base(api_base);
        }
        if let Some(api_key) = api_key {
            config = config.with_api_key(api_key);
        }
        Self {
            client: Client::with_config(config),
            model: model.into(),
        }
    }

    pub async fn chat_completion(
        &self,
        prompt: &ChatPrompt<Rendered>,
        opts: &ModelOpts,
    ) -> ModelRetryResult<ChatCompletionResponse> {
        let schema = try_fatal!(prompt.response_schema.to_json_schema().await);
        let messages = try_fatal!(to_openai_messages(prompt));

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model).messages(messages);

        if let Some(max_tokens) = opts.max_tokens {
            builder.max_completion_tokens(max_tokens);
        }
        if let Some(temperature) = opts.temperature {
            builder.temperature(temperature);
        }
        if let Some(top_p) = opts.top_p {
            builder.top_p(top_p);
        }
        builder.response_format(ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: None,
                name: get_schema_title(&schema),
                schema: Some(schema),
                strict: Some(true),
            },
        });

        let request = try_fatal!(builder.build());

        let response = try_potentially_transient!(
            opts.apply_timeout(async {
                self.client
                    .chat()
                    .create(request)
                    .await
                    .map_err(anyhow::Error::from)
            })
            .await
        );

        let Some(choice) = response.choices.into_iter().next() else {
            return retry_result_fatal_anyhow("model returned no choices");
        };

        if matches!(choice.finish_reason, Some(FinishReason::ContentFilter)) {
            return retry_result_fatal_anyhow("response was blocked by the provider's content filter");
        }

        let text = choice.message.content.unwrap_or_default();
        let response_json: Value = try_transient!(
            serde_json::from_str(&text).with_context(|| format!("model did not return valid JSON: {text:?}"))
        );
        // Some relays apply `response_format` loosely; treat a schema
        // mismatch as retryable rather than failing the whole batch.
        try_transient!(validate_response_schema(&schema, &response_json));

        let token_usage = response
            .usage
            .map(|usage| TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            })
            .unwrap_or_default();
        let saturated = detect_saturation(opts.max_tokens, token_usage.completion_tokens);

        retry_result_ok(ChatCompletionResponse {
            response: response_json,
            token_usage,
            saturated,
        })
    }
}

fn retry_result_fatal_anyhow<T>(msg: &str) -> ModelRetryResult<T> {
    crate::retry::retry_result_fatal(anyhow!("{msg}"))
}

/// Convert our provider-agnostic prompt into the strict alternating
/// user/assistant sequence OpenAI's wire format requires, ending in a user
/// message.
fn to_openai_messages(prompt: &ChatPrompt<Rendered>) -> Result<Vec<ChatCompletionRequestMessage>> {
    let mut messages = Vec::with_capacity(prompt.messages.len() + 1);

    if let Some(developer) = &prompt.developer {
        messages.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(developer.as_str())
                .build()?,
        ));
    }

    for (index, message) in prompt.messages.iter().enumerate() {
        match message {
            Message::User { text, images } => {
                let mut parts = Vec::new();
                if let Some(text) = text {
                    parts.push(ChatCompletionRequestUserMessageContentPart::Text(
                        ChatCompletionRequestMessageContentPartTextArgs::default()
                            .text(text.as_str())
                            .build()?,
                    ));
                }
                for image_url in images {
                    parts.push(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                        ChatCompletionRequestMessageContentPartImageArgs::default()
                            .image_url(ImageUrlArgs::default().url(image_url.as_str()).build()?)
                            .build()?,
                    ));
                }
                let content = if parts.len() == 1 {
                    if let Some(text) = text {
                        ChatCompletionRequestUserMessageContent::Text(text.clone())
                    } else {
                        ChatCompletionRequestUserMessageContent::Array(parts)
                    }
                } else {
                    ChatCompletionRequestUserMessageContent::Array(parts)
                };
                messages.push(ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(content)
                        .build()?,
                ));
            }
            Message::Assistant { json } => {
                if index == prompt.messages.len() - 1 {
                    return Err(anyhow!("prompt must end with a user message, not an assistant message"));
                }
                messages.push(ChatCompletionRequestMessage::Assistant(
                    async_openai::types::ChatCompletionRequestAssistantMessageArgs::default()
                        .content(json.to_string())
                        .build()?,
                ));
            }
        }
    }

    match messages.last() {
        Some(ChatCompletionRequestMessage::User(_)) => {}
        _ => return Err(anyhow!("prompt must end with a user message")),
    }

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    #[test]
    fn test_to_openai_messages_rejects_empty_prompt() {
        let prompt = ChatPrompt::<Rendered>::new(None, vec![], Schema::from_type::<()>());
        assert!(to_openai_messages(&prompt).is_err());
    }

    #[test]
    fn test_to_openai_messages_accepts_single_user_message() {
        let prompt = ChatPrompt::<Rendered>::new(
            None,
            vec![Message::User {
                text: Some("hello".to_owned()),
                images: vec![],
            }],
            Schema::from_type::<()>(),
        );
        let messages = to_openai_messages(&prompt).unwrap();
        assert_eq!(messages.len(), 1);
    }
}
