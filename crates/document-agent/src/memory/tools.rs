//! Working-memory capabilities exposed to the provider during answer generation.
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::working::{MemoryScope, WorkingMemory};
use crate::error::AgentError;
use crate::provider::Tool;

const SEARCH_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, Deserialize)]
enum MemoryKind {
    #[serde(rename = "long-term")]
    LongTerm,
    #[serde(rename = "semantic")]
    Semantic,
}

fn kind_schema() -> Value {
    json!({
        "type": "string",
        "enum": ["long-term", "semantic"],
        "description": "long-term memories are private to the user, semantic memories are shared answers"
    })
}

fn parse<T: for<'de> Deserialize<'de>>(tool: &str, input: Value) -> anyhow::Result<T> {
    serde_json::from_value(input).map_err(|e| {
        AgentError::ValidationMismatch { expected: format!("{} input", tool), actual: e.to_string() }.into()
    })
}

/// Tools bound to one user's memory.
pub fn memory_tools(working: Arc<WorkingMemory>, user_id: &str) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(SearchMemoryTool { working: working.clone(), user_id: user_id.to_string() }),
        Arc::new(AddMemoryTool { working: working.clone(), user_id: user_id.to_string() }),
        Arc::new(UpdateMemoryTool { working, user_id: user_id.to_string() }),
    ]
}

pub struct SearchMemoryTool {
    working: Arc<WorkingMemory>,
    user_id: String,
}

#[derive(Deserialize)]
struct SearchInput {
    #[serde(rename = "type")]
    kind: MemoryKind,
    query: String,
}

#[async_trait]
impl Tool for SearchMemoryTool {
    fn name(&self) -> &str {
        "search_memory"
    }

    fn description(&self) -> &str {
        "Search stored memories relevant to a query"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "type": kind_schema(), "query": { "type": "string" } },
            "required": ["type", "query"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value) -> anyhow::Result<String> {
        let input: SearchInput = parse(self.name(), input)?;
        let scope = match input.kind {
            MemoryKind::LongTerm => MemoryScope::LongTerm { user_id: &self.user_id },
            MemoryKind::Semantic => MemoryScope::Semantic,
        };
        let hits = self.working.search(scope, &input.query, SEARCH_LIMIT).await?;
        let found: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                json!({
                    "id": hit.entry.id,
                    "topic": hit.entry.topic,
                    "answer": hit.entry.answer,
                    "distance": hit.distance,
                })
            })
            .collect();
        Ok(Value::Array(found).to_string())
    }
}

pub struct AddMemoryTool {
    working: Arc<WorkingMemory>,
    user_id: String,
}

#[derive(Deserialize)]
struct AddInput {
    #[serde(rename = "type")]
    kind: MemoryKind,
    topic: String,
    answer: String,
}

#[async_trait]
impl Tool for AddMemoryTool {
    fn name(&self) -> &str {
        "add_memory"
    }

    fn description(&self) -> &str {
        "Remember a key insight under a short topic"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type": kind_schema(),
                "topic": { "type": "string" },
                "answer": { "type": "string" }
            },
            "required": ["type", "topic", "answer"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value) -> anyhow::Result<String> {
        let input: AddInput = parse(self.name(), input)?;
        let entry = match input.kind {
            MemoryKind::LongTerm => self.working.add_long_term(&self.user_id, &input.topic, &input.answer).await?,
            MemoryKind::Semantic => {
                self.working
                    .add_semantic(&input.topic, &input.answer, Some(&self.user_id))
                    .await?
            }
        };
        Ok(json!({ "id": entry.id }).to_string())
    }
}

pub struct UpdateMemoryTool {
    working: Arc<WorkingMemory>,
    user_id: String,
}

#[derive(Deserialize)]
struct UpdateInput {
    #[serde(rename = "type")]
    kind: MemoryKind,
    id: String,
    topic: String,
    answer: String,
}

#[async_trait]
impl Tool for UpdateMemoryTool {
    fn name(&self) -> &str {
        "update_memory"
    }

    fn description(&self) -> &str {
        "Replace the answer of an existing memory"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type": kind_schema(),
                "id": { "type": "string" },
                "topic": { "type": "string" },
                "answer": { "type": "string" }
            },
            "required": ["type", "id", "topic", "answer"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value) -> anyhow::Result<String> {
        let input: UpdateInput = parse(self.name(), input)?;
        let scope = match input.kind {
            MemoryKind::LongTerm => MemoryScope::LongTerm { user_id: &self.user_id },
            MemoryKind::Semantic => MemoryScope::Semantic,
        };
        let entry = self.working.update_entry(scope, &input.id, &input.topic, &input.answer).await?;
        Ok(json!({ "id": entry.id, "updated": true }).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConfig;
    use crate::testing::{temp_store, FakeProvider};

    fn tools() -> (tempfile::TempDir, Arc<WorkingMemory>, Vec<Arc<dyn Tool>>) {
        let (dir, store) = temp_store();
        let config = MemoryConfig { embedding_dimensions: 32, ..MemoryConfig::default() };
        let working = Arc::new(WorkingMemory::new(store, Arc::new(FakeProvider::new(32)), config));
        let tools = memory_tools(working.clone(), "u1");
        (dir, working, tools)
    }

    fn by_name<'a>(tools: &'a [Arc<dyn Tool>], name: &str) -> &'a Arc<dyn Tool> {
        tools.iter().find(|t| t.name() == name).unwrap()
    }

    #[tokio::test]
    async fn test_add_then_search_long_term() {
        let (_dir, _working, tools) = tools();
        by_name(&tools, "add_memory")
            .execute(json!({"type": "long-term", "topic": "tone", "answer": "formal"}))
            .await
            .unwrap();

        let out = by_name(&tools, "search_memory")
            .execute(json!({"type": "long-term", "query": "tone"}))
            .await
            .unwrap();
        let hits: Vec<Value> = serde_json::from_str(&out).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["answer"], "formal");
    }

    #[tokio::test]
    async fn test_semantic_add_records_contributor() {
        let (_dir, working, tools) = tools();
        by_name(&tools, "add_memory")
            .execute(json!({"type": "semantic", "topic": "capital of france", "answer": "Paris"}))
            .await
            .unwrap();

        let hits = working.search(MemoryScope::Semantic, "capital of france", 1).await.unwrap();
        assert_eq!(hits[0].entry.contributed_by.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_update_memory() {
        let (_dir, working, tools) = tools();
        let entry = working.add_long_term("u1", "tone", "casual").await.unwrap();
        by_name(&tools, "update_memory")
            .execute(json!({"type": "long-term", "id": entry.id, "topic": "tone", "answer": "formal"}))
            .await
            .unwrap();

        let hits = working.search(MemoryScope::LongTerm { user_id: "u1" }, "tone", 1).await.unwrap();
        assert_eq!(hits[0].entry.answer, "formal");
    }

    #[tokio::test]
    async fn test_bad_input_is_rejected() {
        let (_dir, _working, tools) = tools();
        let err = by_name(&tools, "search_memory")
            .execute(json!({"type": "episodic", "query": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(AgentError::classify(&err), Some(AgentError::ValidationMismatch { .. })));
    }
}
