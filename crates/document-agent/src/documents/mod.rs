//! Document store and retrieval pipeline
pub mod chunker;
pub mod pipeline;
pub mod prompts;
pub mod tools;

pub use chunker::MarkdownSplitter;
pub use pipeline::{BulkMutateReport, DocumentPipeline, MutateProgress};
pub use tools::SearchDocumentsTool;

use serde::{Deserialize, Serialize};

pub(crate) const DOCUMENT_INDEX: &str = "idx-documents";
pub(crate) const DOCUMENT_PREFIX: &str = "documents:";
pub(crate) const CHUNK_INDEX: &str = "idx-document-chunks";
pub(crate) const CHUNK_PREFIX: &str = "document-chunks:";

pub(crate) fn document_key(id: &str) -> String {
    format!("{}{}", DOCUMENT_PREFIX, id)
}

pub(crate) fn chunk_key(id: &str) -> String {
    format!("{}{}", CHUNK_PREFIX, id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub user_id: String,
    pub project_id: String,
    /// Stored url-safe base64 so it indexes as a single tag.
    #[serde(with = "crate::utils::codec::url_b64")]
    pub url: String,
    pub content: String,
    pub created_at: i64,
}

/// Derived retrieval artifact; rebuilt from the parent document's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChunk {
    #[serde(default)]
    pub id: String,
    pub document_id: String,
    pub user_id: String,
    pub project_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewDocument {
    pub url: String,
    pub content: String,
}

impl NewDocument {
    pub fn new(url: impl Into<String>, content: impl Into<String>) -> Self {
        Self { url: url.into(), content: content.into() }
    }
}

/// A document rendered as a downloadable markdown file.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkdownExport {
    pub file_name: String,
    pub content: String,
}

impl MarkdownExport {
    pub fn of(document: &Document) -> Self {
        Self { file_name: markdown_file_name(document), content: document.content.clone() }
    }
}

/// `<last path segment>.md`, falling back to the host and then the document id.
fn markdown_file_name(document: &Document) -> String {
    let url = document.url.split(['?', '#']).next().unwrap_or_default();
    let path = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let stem: String = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .next_back()
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '-' })
        .collect();
    let stem = stem.trim_matches(|c| c == '.' || c == '-');
    let stem = stem.strip_suffix(".md").unwrap_or(stem);
    if stem.is_empty() {
        format!("{}.md", document.id)
    } else {
        format!("{}.md", stem)
    }
}

#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub chunk: DocumentChunk,
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound on characters per chunk.
    pub chunk_size: usize,
    pub embed_batch_size: usize,
    pub mutate_batch_size: usize,
    /// Chunks at or beyond this cosine distance are not relevant.
    pub distance_threshold: f32,
    pub embedding_dimensions: usize,
    pub knn_candidates: usize,
    pub list_page_size: usize,
    pub url_page_size: usize,
    pub delete_page_size: usize,
    pub max_delete_iterations: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            embed_batch_size: 10,
            mutate_batch_size: 15,
            distance_threshold: 0.3,
            embedding_dimensions: 1536,
            knn_candidates: 100,
            list_page_size: 50,
            url_page_size: 1000,
            delete_page_size: 1000,
            max_delete_iterations: 50,
        }
    }
}
