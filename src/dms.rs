//! The document-management-service client capability.
//!
//! This crate never speaks the DMS's wire protocol directly — per scope,
//! that's an external collaborator's job. What lives here is the interface
//! the rest of the pipeline is written against ([`DmsClient`]), plus a
//! simple in-memory fake used by tests and the `ocr`/`suggest` debug
//! subcommands when no real DMS is configured.

use std::collections::HashMap;

use schemars::JsonSchema;

use crate::prelude::*;

/// A document as the DMS represents it. Opaque to the core except as
/// prompt inputs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Document {
    pub id: i64,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub correspondent: Option<String>,
    #[serde(default)]
    pub custom_fields: HashMap<String, Value>,
}

/// A metadata update to push back to the DMS. Every field is independently
/// optional; `None` means "don't change this field."
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub title: Option<String>,
    pub tags: Option<Vec<String>>,
    pub correspondent: Option<String>,
    pub created_date: Option<String>,
    pub custom_fields: Option<HashMap<String, Value>>,
}

/// The capability interface the core consumes. Implemented once for the
/// real DMS (outside this crate's scope) and once here as [`FakeDmsClient`]
/// for tests and offline debugging.
#[async_trait]
pub trait DmsClient: Send + Sync {
    /// List documents bearing `tag`.
    async fn list_documents_by_tag(&self, tag: &str) -> Result<Vec<Document>>;

    /// Fetch a single document's body and metadata.
    async fn fetch_document(&self, document_id: i64) -> Result<Document>;

    /// Number of pages available for this document's rendered image.
    async fn page_count(&self, document_id: i64) -> Result<u32>;

    /// Fetch the rendered image bytes (and MIME type) for one page.
    /// `page_index` is 1-based, matching the OCR job manager's `p = 1..P`.
    async fn fetch_page_image(&self, document_id: i64, page_index: u32) -> Result<(String, Vec<u8>)>;

    /// Apply a metadata update to a document.
    async fn update_document(&self, document_id: i64, update: DocumentUpdate) -> Result<()>;

    /// All tags known to the DMS (used to populate "available candidates"
    /// in suggestion prompts).
    async fn list_tags(&self) -> Result<Vec<String>>;

    /// All custom-field names known to the DMS.
    async fn list_custom_fields(&self) -> Result<Vec<String>>;
}

/// An in-memory [`DmsClient`] backed by a fixed document set and a single
/// fake page image per document. Not for production use — it exists so the
/// job manager, suggestion engine, and CLI can be exercised without a real
/// DMS endpoint.
pub struct FakeDmsClient {
    documents: std::sync::Mutex<HashMap<i64, Document>>,
    page_image: (String, Vec<u8>),
    pages_per_document: u32,
}

impl FakeDmsClient {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents: std::sync::Mutex::new(documents.into_iter().map(|doc| (doc.id, doc)).collect()),
            page_image: ("image/png".to_owned(), Vec::new()),
            pages_per_document: 1,
        }
    }

    /// Override the fake page image returned for every page/document.
    pub fn with_page_image(mut self, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.page_image = (mime_type.into(), bytes);
        self
    }

    /// Override how many pages every document reports.
    pub fn with_pages_per_document(mut self, pages: u32) -> Self {
        self.pages_per_document = pages;
        self
    }
}

#[async_trait]
impl DmsClient for FakeDmsClient {
    async fn list_documents_by_tag(&self, tag: &str) -> Result<Vec<Document>> {
        let documents = self.documents.lock().expect("document map lock poisoned");
        Ok(documents
            .values()
            .filter(|doc| doc.tags.iter().any(|t| t == tag))
            .cloned()
            .collect())
    }

    async fn fetch_document(&self, document_id: i64) -> Result<Document> {
        let documents = self.documents.lock().expect("document map lock poisoned");
        documents
            .get(&document_id)
            .cloned()
            .ok_or_else(|| anyhow!("no such document: {document_id}"))
    }

    async fn page_count(&self, document_id: i64) -> Result<u32> {
        self.fetch_document(document_id).await?;
        Ok(self.pages_per_document)
    }

    async fn fetch_page_image(&self, document_id: i64, page_index: u32) -> Result<(String, Vec<u8>)> {
        let page_count = self.page_count(document_id).await?;
        if page_index == 0 || page_index > page_count {
            return Err(anyhow!(
                "page {page_index} out of range for document {document_id} ({page_count} pages)"
            ));
        }
        Ok(self.page_image.clone())
    }

    async fn update_document(&self, document_id: i64, update: DocumentUpdate) -> Result<()> {
        let mut documents = self.documents.lock().expect("document map lock poisoned");
        let doc = documents
            .get_mut(&document_id)
            .ok_or_else(|| anyhow!("no such document: {document_id}"))?;
        if let Some(title) = update.title {
            doc.title = title;
        }
        if let Some(tags) = update.tags {
            doc.tags = tags;
        }
        if let Some(correspondent) = update.correspondent {
            doc.correspondent = Some(correspondent);
        }
        if let Some(custom_fields) = update.custom_fields {
            doc.custom_fields.extend(custom_fields);
        }
        Ok(())
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        let documents = self.documents.lock().expect("document map lock poisoned");
        let mut tags: Vec<String> = documents.values().flat_map(|doc| doc.tags.clone()).collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    async fn list_custom_fields(&self) -> Result<Vec<String>> {
        let documents = self.documents.lock().expect("document map lock poisoned");
        let mut fields: Vec<String> = documents
            .values()
            .flat_map(|doc| doc.custom_fields.keys().cloned())
            .collect();
        fields.sort();
        fields.dedup();
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> Document {
        Document {
            id: 1,
            title: "Untitled".to_owned(),
            body: "hello world".to_owned(),
            tags: vec!["inbox".to_owned()],
            correspondent: None,
            custom_fields: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_list_documents_by_tag() {
        let client = FakeDmsClient::new(vec![sample_doc()]);
        let found = client.list_documents_by_tag("inbox").await.unwrap();
        assert_eq!(found.len(), 1);
        let missing = client.list_documents_by_tag("archived").await.unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_update_document_applies_only_given_fields() {
        let client = FakeDmsClient::new(vec![sample_doc()]);
        client
            .update_document(
                1,
                DocumentUpdate {
                    title: Some("New Title".to_owned()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let doc = client.fetch_document(1).await.unwrap();
        assert_eq!(doc.title, "New Title");
        assert_eq!(doc.tags, vec!["inbox".to_owned()]);
    }

    #[tokio::test]
    async fn test_fetch_page_image_out_of_range() {
        let client = FakeDmsClient::new(vec![sample_doc()]).with_pages_per_document(2);
        assert!(client.fetch_page_image(1, 3).await.is_err());
        assert!(client.fetch_page_image(1, 0).await.is_err());
        assert!(client.fetch_page_image(1, 2).await.is_ok());
    }
}
