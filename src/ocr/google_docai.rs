//! Google Document AI: a synchronous RPC that returns page text plus
//! (optionally) paragraph bounding polygons, which we convert into hOCR
//! when enabled.

use std::time::Duration;

use base64::{Engine as _, prelude::BASE64_STANDARD};
use reqwest::Client;

use crate::{
    ocr::{
        OcrOpts, OcrResult,
        hocr::{HocrAccumulator, NormalizedBBox, Paragraph},
        postprocess_text, validate_mime_type,
    },
    prelude::*,
    retry::{HttpRetryConfig, with_http_retry},
};

#[derive(Clone)]
pub struct GoogleDocAiProvider {
    client: Client,
    project_id: String,
    location: String,
    processor_id: String,
    access_token: String,
    /// Appended to across concurrent calls when hOCR emission is enabled.
    pub hocr: std::sync::Arc<HocrAccumulator>,
    retry_config: HttpRetryConfig,
}

impl GoogleDocAiProvider {
    pub fn new(project_id: String, location: String, processor_id: String, access_token: String) -> Self {
        Self {
            client: Client::new(),
            project_id,
            location,
            processor_id,
            access_token,
            hocr: std::sync::Arc::new(HocrAccumulator::new()),
            retry_config: HttpRetryConfig::default(),
        }
    }

    pub async fn process_image(&self, bytes: &[u8], page_number: u32, opts: &OcrOpts) -> Result<OcrResult> {
        let mime_type = validate_mime_type(bytes)?;

        let url = format!(
            "https://{loc}-documentai.googleapis.com/v1/projects/{project}/locations/{loc}/processors/{proc}:process",
            loc = self.location,
            project = self.project_id,
            proc = self.processor_id,
        );
        let body = json!({
            "rawDocument": {
                "content": BASE64_STANDARD.encode(bytes),
                "mimeType": mime_type,
            }
        });

        let response: Value = with_http_retry(&self.retry_config, || async {
            self.client
                .post(&url)
                .bearer_auth(&self.access_token)
                .json(&body)
                .timeout(opts.timeout)
                .send()
                .await?
                .json()
                .await
        })
        .await
        .context("calling Google Document AI")?;

        let text = response
            .pointer("/document/text")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut metadata = serde_json::Map::new();
        let mut hocr_page = None;

        if opts.enable_hocr {
            if let Some((width, height)) = page_dimensions(&response) {
                let paragraphs = extract_paragraphs(&response, text);
                metadata.insert("page_width".to_owned(), json!(width));
                metadata.insert("page_height".to_owned(), json!(height));
                let fragment = crate::ocr::hocr::render_page(page_number, width, height, &paragraphs)?;
                self.hocr.append(page_number, fragment.clone());
                hocr_page = Some(fragment);
            }
        }

        Ok(OcrResult {
            text: postprocess_text(text),
            hocr_page,
            metadata,
            saturated: false,
        })
    }
}

fn page_dimensions(response: &Value) -> Option<(u32, u32)> {
    let page = response.pointer("/document/pages/0")?;
    let width = page.pointer("/dimension/width")?.as_f64()? as u32;
    let height = page.pointer("/dimension/height")?.as_f64()? as u32;
    Some((width, height))
}

/// Extract each paragraph's normalized bounding polygon and corresponding
/// text-segment slice. Document AI expresses text as byte offsets into the
/// single document-wide `text` field; we slice by those offsets.
fn extract_paragraphs(response: &Value, full_text: &str) -> Vec<Paragraph> {
    let Some(paragraphs) = response.pointer("/document/pages/0/paragraphs").and_then(Value::as_array) else {
        return Vec::new();
    };

    paragraphs
        .iter()
        .filter_map(|paragraph| {
            let vertices = paragraph.pointer("/layout/boundingPoly/normalizedVertices")?.as_array()?;
            let bbox = normalized_bbox_from_vertices(vertices)?;

            let segments = paragraph.pointer("/layout/textAnchor/textSegments")?.as_array()?;
            let segment = segments.first()?;
            let start = segment.get("startIndex").and_then(Value::as_str).and_then(|s| s.parse::<usize>().ok()).unwrap_or(0);
            let end = segment.get("endIndex").and_then(Value::as_str).and_then(|s| s.parse::<usize>().ok())?;
            let text = full_text.get(start..end)?.trim().to_owned();

            Some(Paragraph { bbox, text })
        })
        .collect()
}

fn normalized_bbox_from_vertices(vertices: &[Value]) -> Option<NormalizedBBox> {
    let xs: Vec<f64> = vertices.iter().filter_map(|v| v.get("x").and_then(Value::as_f64)).collect();
    let ys: Vec<f64> = vertices.iter().filter_map(|v| v.get("y").and_then(Value::as_f64)).collect();
    if xs.is_empty() || ys.is_empty() {
        return None;
    }
    Some(NormalizedBBox {
        x0: xs.iter().cloned().fold(f64::INFINITY, f64::min),
        y0: ys.iter().cloned().fold(f64::INFINITY, f64::min),
        x1: xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        y1: ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_dimensions_from_response() {
        let response = json!({
            "document": {
                "pages": [{"dimension": {"width": 800.0, "height": 600.0}}]
            }
        });
        assert_eq!(page_dimensions(&response), Some((800, 600)));
    }

    #[test]
    fn test_extract_paragraphs_scenario() {
        let response = json!({
            "document": {
                "pages": [{
                    "dimension": {"width": 800.0, "height": 600.0},
                    "paragraphs": [{
                        "layout": {
                            "boundingPoly": {
                                "normalizedVertices": [
                                    {"x": 0.1, "y": 0.1},
                                    {"x": 0.9, "y": 0.1},
                                    {"x": 0.9, "y": 0.2},
                                    {"x": 0.1, "y": 0.2},
                                ]
                            },
                            "textAnchor": {
                                "textSegments": [{"startIndex": "0", "endIndex": "11"}]
                            }
                        }
                    }]
                }]
            }
        });
        let paragraphs = extract_paragraphs(&response, "Hello World");
        assert_eq!(paragraphs.len(), 1);
        assert_eq!(paragraphs[0].text, "Hello World");
        assert_eq!(paragraphs[0].bbox.to_pixel_bbox(800, 600), "bbox 80 60 720 120");
    }
}
