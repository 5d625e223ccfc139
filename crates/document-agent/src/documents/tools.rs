use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::DocumentPipeline;
use crate::error::AgentError;
use crate::provider::Tool;

/// Vector search over the user's document chunks, scoped to one project when set.
pub struct SearchDocumentsTool {
    pipeline: Arc<DocumentPipeline>,
    user_id: String,
    project_id: Option<String>,
}

impl SearchDocumentsTool {
    pub fn new(pipeline: Arc<DocumentPipeline>, user_id: &str, project_id: Option<&str>) -> Self {
        Self {
            pipeline,
            user_id: user_id.to_string(),
            project_id: project_id.map(str::to_string),
        }
    }
}

#[derive(Deserialize)]
struct SearchInput {
    query: String,
}

#[async_trait]
impl Tool for SearchDocumentsTool {
    fn name(&self) -> &str {
        "search_documents"
    }

    fn description(&self) -> &str {
        "Find passages from the user's documents that are relevant to a query"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value) -> anyhow::Result<String> {
        let input: SearchInput = serde_json::from_value(input).map_err(|e| AgentError::ValidationMismatch {
            expected: "search_documents input".into(),
            actual: e.to_string(),
        })?;
        let hits = self
            .pipeline
            .retrieve_chunks(&self.user_id, &input.query, self.project_id.as_deref())
            .await?;
        let passages: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                json!({
                    "documentId": hit.chunk.document_id,
                    "content": hit.chunk.content,
                    "distance": hit.distance,
                })
            })
            .collect();
        Ok(Value::Array(passages).to_string())
    }
}
