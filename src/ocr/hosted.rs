//! Hosted and self-hosted OCR services that don't fit the vision-LLM or
//! submit/poll shapes: a hosted markdown-output API (e.g. Mistral OCR), a
//! local structured-parse server (Docling-style), and a self-hosted
//! mobile-device OCR endpoint.

use reqwest::{Client, multipart};

use crate::{
    ocr::{OcrOpts, OcrResult, postprocess_text, validate_mime_type},
    prelude::*,
    retry::{HttpRetryConfig, with_http_retry},
};

/// A hosted OCR API returning markdown, one document (or page) per call.
/// Mirrors the "POST image, or upload + signed URL for PDF" shape; this
/// crate only ever POSTs already-rendered page images, so the signed-URL
/// path is not exercised.
#[derive(Clone)]
pub struct HostedMarkdownProvider {
    client: Client,
    api_base: String,
    api_key: String,
    retry_config: HttpRetryConfig,
}

impl HostedMarkdownProvider {
    pub fn new(api_base: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_base,
            api_key,
            retry_config: HttpRetryConfig::default(),
        }
    }

    pub async fn process_image(&self, bytes: &[u8], _page_number: u32, opts: &OcrOpts) -> Result<OcrResult> {
        let mime_type = validate_mime_type(bytes)?;

        let response: Value = with_http_retry(&self.retry_config, || async {
            let part = multipart::Part::bytes(bytes.to_vec()).mime_str(&mime_type)?;
            let form = multipart::Form::new().part("file", part);
            self.client
                .post(format!("{}/v1/ocr", self.api_base.trim_end_matches('/')))
                .bearer_auth(&self.api_key)
                .multipart(form)
                .timeout(opts.timeout)
                .send()
                .await?
                .json()
                .await
        })
        .await
        .context("calling hosted OCR API")?;

        let pages = response.get("pages").and_then(Value::as_array).cloned().unwrap_or_default();
        let markdown: String = pages
            .iter()
            .filter_map(|page| page.get("markdown").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n\n");
        let text = markdown.trim_end_matches('\n');

        Ok(OcrResult {
            text: postprocess_text(text),
            hocr_page: None,
            metadata: serde_json::Map::new(),
            saturated: false,
        })
    }
}

/// A local structured-parse server (Docling and similar): multipart upload
/// with a fixed set of form fields requesting markdown with OCR enabled.
#[derive(Clone)]
pub struct DoclingProvider {
    client: Client,
    api_base: String,
    retry_config: HttpRetryConfig,
}

impl DoclingProvider {
    pub fn new(api_base: String) -> Self {
        Self {
            client: Client::new(),
            api_base,
            retry_config: HttpRetryConfig::default(),
        }
    }

    pub async fn process_image(&self, bytes: &[u8], _page_number: u32, opts: &OcrOpts) -> Result<OcrResult> {
        let mime_type = validate_mime_type(bytes)?;

        let response: Value = with_http_retry(&self.retry_config, || async {
            let part = multipart::Part::bytes(bytes.to_vec()).mime_str(&mime_type)?;
            let form = multipart::Form::new()
                .part("files", part)
                .text("to_formats", "md")
                .text("do_ocr", "true")
                .text("pipeline", "standard")
                .text("image_export_mode", "placeholder");
            self.client
                .post(format!("{}/v1alpha/convert/file", self.api_base.trim_end_matches('/')))
                .multipart(form)
                .timeout(opts.timeout)
                .send()
                .await?
                .json()
                .await
        })
        .await
        .context("calling Docling server")?;

        // Prefer plain text if the server returned it; fall back to
        // markdown otherwise.
        let text = response
            .pointer("/document/text_content")
            .and_then(Value::as_str)
            .or_else(|| response.pointer("/document/md_content").and_then(Value::as_str))
            .unwrap_or_default();

        Ok(OcrResult {
            text: postprocess_text(text),
            hocr_page: None,
            metadata: serde_json::Map::new(),
            saturated: false,
        })
    }
}

/// A self-hosted mobile-device OCR endpoint returning text plus per-box
/// geometry. Image dimensions are surfaced in metadata for downstream
/// consumers, even though this crate doesn't itself emit hOCR from it.
#[derive(Clone)]
pub struct IosOcrProvider {
    client: Client,
    api_base: String,
    retry_config: HttpRetryConfig,
}

impl IosOcrProvider {
    pub fn new(api_base: String) -> Self {
        Self {
            client: Client::new(),
            api_base,
            retry_config: HttpRetryConfig::default(),
        }
    }

    pub async fn process_image(&self, bytes: &[u8], _page_number: u32, opts: &OcrOpts) -> Result<OcrResult> {
        let mime_type = validate_mime_type(bytes)?;

        let response: Value = with_http_retry(&self.retry_config, || async {
            let part = multipart::Part::bytes(bytes.to_vec()).mime_str(&mime_type)?;
            let form = multipart::Form::new().part("image", part);
            self.client
                .post(format!("{}/ocr", self.api_base.trim_end_matches('/')))
                .multipart(form)
                .timeout(opts.timeout)
                .send()
                .await?
                .json()
                .await
        })
        .await
        .context("calling self-hosted mobile OCR endpoint")?;

        let text = response.get("text").and_then(Value::as_str).unwrap_or_default();

        let mut metadata = serde_json::Map::new();
        if let Some(width) = response.get("image_width") {
            metadata.insert("image_width".to_owned(), width.clone());
        }
        if let Some(height) = response.get("image_height") {
            metadata.insert("image_height".to_owned(), height.clone());
        }
        if let Some(boxes) = response.get("boxes") {
            metadata.insert("boxes".to_owned(), boxes.clone());
        }

        Ok(OcrResult {
            text: postprocess_text(text),
            hocr_page: None,
            metadata,
            saturated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_providers_construct_with_base_url() {
        let _hosted = HostedMarkdownProvider::new("https://api.example.com".to_owned(), "key".to_owned());
        let _docling = DoclingProvider::new("http://localhost:5001".to_owned());
        let _ios = IosOcrProvider::new("http://localhost:9000".to_owned());
    }
}
