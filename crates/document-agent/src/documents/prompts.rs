//! Structured-generation requests used by the document pipeline.
//! Every variable input is wrapped in `"""` fences.
use serde::Deserialize;
use serde_json::json;

use crate::provider::{ModelTier, OutputSchema, StructuredRequest};

const REWRITE_SYSTEM: &str = "You edit markdown documents. Apply the requested changes to the document \
and return the complete modified document. Preserve everything the instructions do not ask to change.";

const DIFF_SYSTEM: &str = "You compare two versions of a document and describe the kind of edits made. \
Describe each edit as a generic, reusable action that could be applied to a different document \
(for example \"Convert numbered lists to bullet lists\"), never as literal text changes.";

const URL_MATCH_SYSTEM: &str = "You pick the single URL from a list that best matches a question. \
Only answer with a URL from the list. If none matches, answer null.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteOutput {
    pub modified_content: String,
}

#[derive(Debug, Deserialize)]
pub struct DiffOutput {
    pub actions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlMatchOutput {
    pub matched_url: Option<String>,
}

pub fn rewrite(content: &str, instruction: &str) -> StructuredRequest {
    let schema = OutputSchema {
        name: "document_rewrite",
        schema: json!({
            "type": "object",
            "properties": { "modifiedContent": { "type": "string" } },
            "required": ["modifiedContent"],
            "additionalProperties": false
        }),
    };
    StructuredRequest::new(ModelTier::Large, schema).system(REWRITE_SYSTEM).user(format!(
        "Document:\n\"\"\"\n{}\n\"\"\"\n\nInstructions:\n\"\"\"\n{}\n\"\"\"",
        content, instruction
    ))
}

pub fn diff(old_content: &str, new_content: &str) -> StructuredRequest {
    let schema = OutputSchema {
        name: "document_diff",
        schema: json!({
            "type": "object",
            "properties": { "actions": { "type": "array", "items": { "type": "string" } } },
            "required": ["actions"],
            "additionalProperties": false
        }),
    };
    StructuredRequest::new(ModelTier::Medium, schema).system(DIFF_SYSTEM).user(format!(
        "Original:\n\"\"\"\n{}\n\"\"\"\n\nEdited:\n\"\"\"\n{}\n\"\"\"",
        old_content, new_content
    ))
}

pub fn url_match(urls: &[String], query: &str) -> StructuredRequest {
    let schema = OutputSchema {
        name: "url_match",
        schema: json!({
            "type": "object",
            "properties": { "matchedUrl": { "type": ["string", "null"] } },
            "required": ["matchedUrl"],
            "additionalProperties": false
        }),
    };
    StructuredRequest::new(ModelTier::Small, schema).system(URL_MATCH_SYSTEM).user(format!(
        "URLs:\n\"\"\"\n{}\n\"\"\"\n\nQuestion:\n\"\"\"\n{}\n\"\"\"",
        urls.join("\n"),
        query
    ))
}
