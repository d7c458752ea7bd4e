//! The LLM-vision OCR provider: a single chat-completion call with an image
//! part and a fixed transcription prompt.

use crate::{
    data_url::data_url,
    models::{Model, ModelOpts},
    ocr::{OcrOpts, OcrResult, postprocess_text, validate_mime_type},
    prelude::*,
    prompt::{ChatPrompt, Message, Rendered},
    schema::Schema,
};

/// A schema for a single free-text transcription field, used for every
/// vision-OCR call regardless of which vision model backs it.
fn transcription_schema() -> Schema {
    Schema::JsonValue {
        json: json!({
            "title": "Transcription",
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "The transcribed text."}
            },
            "required": ["text"],
            "additionalProperties": false,
        }),
    }
}

#[derive(Clone)]
pub struct LlmVisionProvider {
    model: Model,
    model_opts: ModelOpts,
    prompt: String,
}

impl LlmVisionProvider {
    pub fn new(model: Model, model_opts: ModelOpts, prompt: String) -> Self {
        Self {
            model,
            model_opts,
            prompt,
        }
    }

    pub async fn process_image(&self, bytes: &[u8], _page_number: u32, opts: &OcrOpts) -> Result<OcrResult> {
        let mime_type = validate_mime_type(bytes)?;
        let image = data_url(&mime_type, bytes);

        let prompt = ChatPrompt::<Rendered>::new(
            None,
            vec![Message::User {
                text: Some(self.prompt.clone()),
                images: vec![image],
            }],
            transcription_schema(),
        );

        let mut model_opts = self.model_opts.clone();
        model_opts.timeout_secs = opts.timeout.as_secs().max(1);

        let response = match self.model.chat_completion(&prompt, &model_opts).await {
            keen_retry::RetryResult::Ok { output, .. } => output,
            keen_retry::RetryResult::Fatal { error, .. } => return Err(error),
            keen_retry::RetryResult::Transient { error, .. } => {
                return Err(error).context(
                    "vision OCR call failed and this provider does not retry on its own \
                     (wrap the model in the rate-limited wrapper for retry behavior)",
                );
            }
        };

        let text = response
            .response
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();

        Ok(OcrResult {
            text: postprocess_text(text),
            hocr_page: None,
            metadata: serde_json::Map::new(),
            saturated: response.saturated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelConfig, ModelKind, create_model};

    fn png_bytes() -> Vec<u8> {
        vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0]
    }

    #[tokio::test]
    async fn test_echo_vision_returns_prompt_as_text() {
        let model = create_model(&ModelConfig {
            kind: Some(ModelKind::Echo),
            ..Default::default()
        })
        .unwrap();
        let provider = LlmVisionProvider::new(model, ModelOpts::default(), "Transcribe this.".to_owned());
        let result = provider
            .process_image(&png_bytes(), 1, &OcrOpts::default())
            .await
            .unwrap();
        // The echo model fills every string field with the last user
        // message's text, so the transcription is the prompt itself.
        assert_eq!(result.text, "Transcribe this.");
        assert!(!result.saturated);
    }

    #[tokio::test]
    async fn test_rejects_non_image_bytes() {
        let model = create_model(&ModelConfig {
            kind: Some(ModelKind::Echo),
            ..Default::default()
        })
        .unwrap();
        let provider = LlmVisionProvider::new(model, ModelOpts::default(), "Transcribe this.".to_owned());
        let result = provider
            .process_image(b"not an image", 1, &OcrOpts::default())
            .await;
        assert!(result.is_err());
    }
}
