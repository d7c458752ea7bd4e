//! The OCR provider abstraction (component A).
//!
//! A [`OcrProvider`] normalizes a dozen heterogeneous vision/OCR back-ends
//! behind one `process_image` contract. Per the closed-sum-type design,
//! each back-end family gets one variant and one constructor; there is no
//! string-keyed factory dispatch at call time.

use std::time::Duration;

use crate::{
    errors::AppError,
    models::{Model, ModelOpts},
    ocr::hocr::HocrAccumulator,
    prelude::*,
};

pub mod azure_doc_intelligence;
pub mod google_docai;
pub mod hocr;
pub mod hosted;
pub mod llm_vision;

/// Image formats the image-only providers accept. Anything else is a typed
/// [`crate::errors::AppError::UnsupportedMediaType`].
const SUPPORTED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/tiff", "image/bmp", "application/pdf"];

/// Sniff the MIME type of `bytes` from its leading bytes and check it's one
/// of the types image-only providers accept.
pub fn validate_mime_type(bytes: &[u8]) -> Result<String> {
    let kind = infer::get(bytes)
        .ok_or_else(|| AppError::UnsupportedMediaType(anyhow!("could not determine file type from content")))?;
    let mime_type = kind.mime_type().to_owned();
    if SUPPORTED_MIME_TYPES.contains(&mime_type.as_str()) {
        Ok(mime_type)
    } else {
        Err(AppError::UnsupportedMediaType(anyhow!("unsupported file type: {mime_type}")).into())
    }
}

/// Per-page OCR output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OcrResult {
    /// The transcribed text for this page.
    pub text: String,
    /// Structured layout, if hOCR emission was enabled and the provider
    /// supports it.
    pub hocr_page: Option<String>,
    /// Provider-specific metadata (image dimensions, confidence scores,
    /// box geometry, etc).
    pub metadata: serde_json::Map<String, Value>,
    /// Did generation hit its output-token cap?
    pub saturated: bool,
}

/// Shared knobs every provider variant accepts, even if a given variant
/// ignores some of them.
#[derive(Debug, Clone)]
pub struct OcrOpts {
    /// Overall deadline for processing a single page.
    pub timeout: Duration,
    /// Emit hOCR structured layout when the provider supports it.
    pub enable_hocr: bool,
    /// Polling interval for asynchronous submit/poll providers.
    pub poll_interval: Duration,
}

impl Default for OcrOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            enable_hocr: false,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// A configured OCR provider, thread-safe for concurrent calls once built.
#[derive(Clone)]
pub enum OcrProvider {
    /// A chat LLM given an image part and a fixed OCR prompt.
    LlmVision(llm_vision::LlmVisionProvider),
    /// Azure Document Intelligence: asynchronous submit → poll.
    AzureDocIntelligence(azure_doc_intelligence::AzureDocIntelligenceProvider),
    /// Google Document AI: synchronous RPC, with optional hOCR emission
    /// from paragraph bounding polygons.
    GoogleDocai(google_docai::GoogleDocAiProvider),
    /// A hosted OCR API that returns markdown (Mistral OCR and similar).
    HostedMarkdown(hosted::HostedMarkdownProvider),
    /// A local structured-parse server (Docling-style): multipart upload,
    /// `to_formats=md`.
    Docling(hosted::DoclingProvider),
    /// A self-hosted mobile-device OCR endpoint returning text plus
    /// per-box geometry.
    IosOcr(hosted::IosOcrProvider),
}

impl OcrProvider {
    /// Process one page's image bytes.
    ///
    /// `page_number` is 1-based, used only for ordering/metadata; the
    /// provider itself is stateless across pages except for the hOCR
    /// accumulator, which is mutex-protected internally.
    #[instrument(level = "debug", skip(self, bytes), fields(provider = self.kind_name(), bytes = bytes.len()))]
    pub async fn process_image(
        &self,
        bytes: &[u8],
        page_number: u32,
        opts: &OcrOpts,
    ) -> Result<OcrResult> {
        validate_mime_type(bytes)?;
        match self {
            OcrProvider::LlmVision(provider) => provider.process_image(bytes, page_number, opts).await,
            OcrProvider::AzureDocIntelligence(provider) => {
                provider.process_image(bytes, page_number, opts).await
            }
            OcrProvider::GoogleDocai(provider) => provider.process_image(bytes, page_number, opts).await,
            OcrProvider::HostedMarkdown(provider) => provider.process_image(bytes, page_number, opts).await,
            OcrProvider::Docling(provider) => provider.process_image(bytes, page_number, opts).await,
            OcrProvider::IosOcr(provider) => provider.process_image(bytes, page_number, opts).await,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            OcrProvider::LlmVision(_) => "llm_vision",
            OcrProvider::AzureDocIntelligence(_) => "azure_doc_intelligence",
            OcrProvider::GoogleDocai(_) => "google_docai",
            OcrProvider::HostedMarkdown(_) => "hosted_markdown",
            OcrProvider::Docling(_) => "docling",
            OcrProvider::IosOcr(_) => "ios_ocr",
        }
    }

    /// The provider's shared hOCR accumulator, if it has one. Exposed for
    /// tests and for `ocr --enable-hocr` to flush the accumulated document
    /// at the end of a job.
    pub fn hocr_accumulator(&self) -> Option<&HocrAccumulator> {
        match self {
            OcrProvider::GoogleDocai(provider) => Some(provider.hocr.as_ref()),
            _ => None,
        }
    }
}

/// Strip a leading/trailing `<think>...</think>` span and surrounding
/// whitespace from vision-model output, per the post-processing rule
/// shared by every LLM-backed variant.
pub fn postprocess_text(text: &str) -> String {
    crate::models::strip_reasoning(text).trim().to_owned()
}

/// Config needed to construct any [`OcrProvider`] variant. Unused fields
/// for the selected kind are ignored.
#[derive(Debug, Clone, Default)]
pub struct OcrProviderConfig {
    pub vision_model: Option<Model>,
    pub vision_model_opts: ModelOpts,
    pub vision_prompt: Option<String>,
    pub azure_endpoint: Option<String>,
    pub azure_api_key: Option<String>,
    pub google_project_id: Option<String>,
    pub google_location: Option<String>,
    pub google_processor_id: Option<String>,
    pub google_access_token: Option<String>,
    pub hosted_api_base: Option<String>,
    pub hosted_api_key: Option<String>,
}

/// Build the configured [`OcrProvider`] variant from `kind` and its
/// associated settings. The mapping from `config::OcrProviderKind` to a
/// variant is fixed at the call site (the closed sum type has no runtime
/// string dispatch beyond this single match).
pub fn create_ocr_provider(kind: crate::config::OcrProviderKind, config: &OcrProviderConfig) -> Result<OcrProvider> {
    use crate::config::OcrProviderKind;

    match kind {
        OcrProviderKind::Llm => {
            let model = config
                .vision_model
                .clone()
                .ok_or_else(|| AppError::ConfigMissing(anyhow!("llm OCR provider requires a configured vision model")))?;
            let prompt = config
                .vision_prompt
                .clone()
                .unwrap_or_else(|| "Transcribe all text visible in this image exactly as it appears.".to_owned());
            Ok(OcrProvider::LlmVision(llm_vision::LlmVisionProvider::new(
                model,
                config.vision_model_opts.clone(),
                prompt,
            )))
        }
        OcrProviderKind::GoogleDocai => {
            let project_id = config
                .google_project_id
                .clone()
                .ok_or_else(|| AppError::ConfigMissing(anyhow!("google_docai OCR provider requires google_project_id")))?;
            let processor_id = config
                .google_processor_id
                .clone()
                .ok_or_else(|| AppError::ConfigMissing(anyhow!("google_docai OCR provider requires google_processor_id")))?;
            let access_token = config
                .google_access_token
                .clone()
                .ok_or_else(|| AppError::ConfigMissing(anyhow!("google_docai OCR provider requires google_access_token")))?;
            let location = config.google_location.clone().unwrap_or_else(|| "us".to_owned());
            Ok(OcrProvider::GoogleDocai(google_docai::GoogleDocAiProvider::new(
                project_id,
                location,
                processor_id,
                access_token,
            )))
        }
        OcrProviderKind::Azure => {
            let endpoint = config
                .azure_endpoint
                .clone()
                .ok_or_else(|| AppError::ConfigMissing(anyhow!("azure OCR provider requires azure_endpoint")))?;
            let api_key = config
                .azure_api_key
                .clone()
                .ok_or_else(|| AppError::ConfigMissing(anyhow!("azure OCR provider requires azure_api_key")))?;
            Ok(OcrProvider::AzureDocIntelligence(azure_doc_intelligence::AzureDocIntelligenceProvider::new(
                endpoint, api_key,
            )))
        }
        OcrProviderKind::Docling => {
            let api_base = config
                .hosted_api_base
                .clone()
                .ok_or_else(|| AppError::ConfigMissing(anyhow!("docling OCR provider requires hosted_api_base")))?;
            Ok(OcrProvider::Docling(hosted::DoclingProvider::new(api_base)))
        }
        OcrProviderKind::MistralOcr => {
            let api_base = config
                .hosted_api_base
                .clone()
                .ok_or_else(|| AppError::ConfigMissing(anyhow!("mistral_ocr OCR provider requires hosted_api_base")))?;
            let api_key = config
                .hosted_api_key
                .clone()
                .ok_or_else(|| AppError::ConfigMissing(anyhow!("mistral_ocr OCR provider requires hosted_api_key")))?;
            Ok(OcrProvider::HostedMarkdown(hosted::HostedMarkdownProvider::new(api_base, api_key)))
        }
        OcrProviderKind::IosOcr => {
            let api_base = config
                .hosted_api_base
                .clone()
                .ok_or_else(|| AppError::ConfigMissing(anyhow!("ios_ocr OCR provider requires hosted_api_base")))?;
            Ok(OcrProvider::IosOcr(hosted::IosOcrProvider::new(api_base)))
        }
    }
}

/// Build the configured [`OcrProvider`] from the application's layered
/// config, constructing whatever backing vision model the `llm` variant
/// needs along the way.
pub fn provider_from_config(config: &crate::config::Config) -> Result<OcrProvider> {
    let kind = config
        .ocr_provider
        .ok_or_else(|| AppError::ConfigMissing(anyhow!("no OCR provider configured (ocr_provider)")))?;

    let mut provider_config = OcrProviderConfig {
        vision_prompt: config.vision_llm_prompt.clone(),
        azure_endpoint: config.azure_endpoint.clone(),
        azure_api_key: config.azure_api_key.clone(),
        google_project_id: config.google_project_id.clone(),
        hosted_api_base: config.api_base.clone(),
        hosted_api_key: config.api_key.clone(),
        ..Default::default()
    };
    provider_config.vision_model_opts.max_tokens = config.vision_llm_max_tokens;
    provider_config.vision_model_opts.temperature = config.vision_llm_temperature;

    if matches!(kind, crate::config::OcrProviderKind::Llm) {
        let model = crate::models::create_model(&crate::models::ModelConfig {
            kind: config.vision_llm_provider,
            model: config.vision_llm_model.clone().unwrap_or_default(),
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
        })?;
        provider_config.vision_model = Some(model);
    }

    create_ocr_provider(kind, &provider_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_mime_type_accepts_png() {
        // Minimal valid PNG signature.
        let png_bytes: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(validate_mime_type(png_bytes).unwrap(), "image/png");
    }

    #[test]
    fn test_validate_mime_type_rejects_plain_text() {
        let text_bytes = b"This is just plain text, not an image.";
        assert!(validate_mime_type(text_bytes).is_err());
    }

    #[test]
    fn test_postprocess_strips_reasoning_and_trims() {
        let raw = "  <think>hmm</think>Hello World  ";
        assert_eq!(postprocess_text(raw), "Hello World");
    }

    #[test]
    fn test_create_ocr_provider_llm_requires_vision_model() {
        let result = create_ocr_provider(crate::config::OcrProviderKind::Llm, &OcrProviderConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_create_ocr_provider_llm_succeeds_with_model() {
        let model = crate::models::create_model(&crate::models::ModelConfig {
            kind: Some(crate::models::ModelKind::Echo),
            ..Default::default()
        })
        .unwrap();
        let config = OcrProviderConfig {
            vision_model: Some(model),
            ..Default::default()
        };
        let provider = create_ocr_provider(crate::config::OcrProviderKind::Llm, &config).unwrap();
        assert!(matches!(provider, OcrProvider::LlmVision(_)));
    }

    #[test]
    fn test_create_ocr_provider_docling_requires_api_base() {
        let result = create_ocr_provider(crate::config::OcrProviderKind::Docling, &OcrProviderConfig::default());
        assert!(result.is_err());
    }
}
