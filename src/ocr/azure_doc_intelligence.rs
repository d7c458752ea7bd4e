//! Azure Document Intelligence: asynchronous submit-then-poll OCR.
//!
//! POST the image, read the `Operation-Location` header, then poll that
//! URL at a fixed interval until the operation's status leaves `running`.

use std::time::{Duration, Instant};

use base64::{Engine as _, prelude::BASE64_STANDARD};
use reqwest::Client;

use crate::{
    ocr::{OcrOpts, OcrResult, postprocess_text, validate_mime_type},
    prelude::*,
    retry::{HttpRetryConfig, with_http_retry},
};

#[derive(Clone)]
pub struct AzureDocIntelligenceProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    /// Total wall-clock budget for submit + all polls, independent of the
    /// per-request HTTP timeout.
    overall_timeout: Duration,
    retry_config: HttpRetryConfig,
}

impl AzureDocIntelligenceProvider {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            api_key,
            overall_timeout: Duration::from_secs(120),
            retry_config: HttpRetryConfig::default(),
        }
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }

    pub async fn process_image(&self, bytes: &[u8], _page_number: u32, opts: &OcrOpts) -> Result<OcrResult> {
        validate_mime_type(bytes)?;
        let deadline = Instant::now() + self.overall_timeout.min(opts.timeout);

        let submit_url = format!(
            "{}/documentintelligence/documentModels/prebuilt-read:analyze?api-version=2024-02-29-preview",
            self.endpoint.trim_end_matches('/')
        );
        let body = json!({ "base64Source": BASE64_STANDARD.encode(bytes) });

        let submit_response = with_http_retry(&self.retry_config, || async {
            self.client
                .post(&submit_url)
                .header("Ocp-Apim-Subscription-Key", &self.api_key)
                .json(&body)
                .timeout(Duration::from_secs(30))
                .send()
                .await
        })
        .await
        .context("submitting document to Azure Document Intelligence")?;

        let operation_location = submit_response
            .headers()
            .get("operation-location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| anyhow!("Azure response did not include an Operation-Location header"))?
            .to_owned();

        loop {
            if Instant::now() >= deadline {
                return Err(anyhow!("operation timed out"));
            }

            let poll_response: Value = with_http_retry(&self.retry_config, || async {
                self.client
                    .get(&operation_location)
                    .header("Ocp-Apim-Subscription-Key", &self.api_key)
                    .timeout(Duration::from_secs(10))
                    .send()
                    .await?
                    .json()
                    .await
            })
            .await
            .context("polling for results")?;

            match poll_response.get("status").and_then(Value::as_str) {
                Some("succeeded") => {
                    let text = poll_response
                        .pointer("/analyzeResult/content")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    return Ok(OcrResult {
                        text: postprocess_text(text),
                        hocr_page: None,
                        metadata: serde_json::Map::new(),
                        saturated: false,
                    });
                }
                Some("failed") => {
                    return Err(anyhow!("Azure Document Intelligence reported status: failed"));
                }
                _ => {
                    tokio::time::sleep(opts.poll_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_builds_with_overall_timeout() {
        let provider = AzureDocIntelligenceProvider::new("https://example.cognitiveservices.azure.com".to_owned(), "key".to_owned())
            .with_overall_timeout(Duration::from_secs(30));
        assert_eq!(provider.overall_timeout, Duration::from_secs(30));
    }
}
