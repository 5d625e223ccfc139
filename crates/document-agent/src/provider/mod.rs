//! Embedding and generation provider seam, plus the tool contract the
//! provider may call back into while generating text.
pub mod crawler;
pub mod openai;

pub use crawler::{CrawledPage, Crawler, TavilyCrawler};
pub use openai::OpenAiClient;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Large,
    Medium,
    Small,
}

#[derive(Debug, Clone)]
pub struct ModelSet {
    pub large: String,
    pub medium: String,
    pub small: String,
    pub embeddings: String,
    pub dimensions: usize,
}

impl ModelSet {
    pub fn chat_model(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Large => &self.large,
            ModelTier::Medium => &self.medium,
            ModelTier::Small => &self.small,
        }
    }
}

/// A named capability the provider may invoke while generating text.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the input object.
    fn input_schema(&self) -> Value;
    async fn execute(&self, input: Value) -> anyhow::Result<String>;
}

pub struct TextRequest {
    pub tier: ModelTier,
    pub messages: Vec<PromptMessage>,
    pub tools: Vec<Arc<dyn Tool>>,
}

impl TextRequest {
    pub fn new(tier: ModelTier) -> Self {
        Self { tier, messages: Vec::new(), tools: Vec::new() }
    }

    pub fn system(mut self, content: impl Into<String>) -> Self {
        self.messages.push(PromptMessage::system(content));
        self
    }

    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(PromptMessage::user(content));
        self
    }

    pub fn messages(mut self, messages: impl IntoIterator<Item = PromptMessage>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Content of the last user message, if any.
    pub fn last_user(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub name: &'static str,
    pub schema: Value,
}

#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub tier: ModelTier,
    pub messages: Vec<PromptMessage>,
    pub schema: OutputSchema,
}

impl StructuredRequest {
    pub fn new(tier: ModelTier, schema: OutputSchema) -> Self {
        Self { tier, messages: Vec::new(), schema }
    }

    pub fn system(mut self, content: impl Into<String>) -> Self {
        self.messages.push(PromptMessage::system(content));
        self
    }

    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(PromptMessage::user(content));
        self
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
    async fn generate_text(&self, request: TextRequest) -> anyhow::Result<String>;
    async fn generate_structured(&self, request: StructuredRequest) -> anyhow::Result<Value>;
}

/// Structured generation decoded into `T`. A shape mismatch counts as a provider failure.
pub async fn generate_object<T: DeserializeOwned>(
    provider: &dyn Provider,
    request: StructuredRequest,
) -> anyhow::Result<T> {
    let name = request.schema.name;
    let value = provider.generate_structured(request).await?;
    serde_json::from_value(value).map_err(|e| {
        AgentError::provider(format!("output does not match schema {}: {}", name, e)).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProvider;
    use serde_json::json;

    #[test]
    fn test_model_tiers() {
        let models = ModelSet {
            large: "l".into(),
            medium: "m".into(),
            small: "s".into(),
            embeddings: "e".into(),
            dimensions: 8,
        };
        assert_eq!(models.chat_model(ModelTier::Large), "l");
        assert_eq!(models.chat_model(ModelTier::Medium), "m");
        assert_eq!(models.chat_model(ModelTier::Small), "s");
    }

    #[test]
    fn test_text_request_last_user() {
        let request = TextRequest::new(ModelTier::Small)
            .system("be brief")
            .user("first")
            .messages(vec![PromptMessage::assistant("ok"), PromptMessage::user("second")]);
        assert_eq!(request.last_user(), Some("second"));
        assert_eq!(request.messages.len(), 4);
    }

    #[test]
    fn test_role_wire_names() {
        assert_eq!(serde_json::to_value(Role::Assistant).unwrap(), json!("assistant"));
    }

    #[derive(Debug, serde::Deserialize)]
    struct Answer {
        value: String,
    }

    #[tokio::test]
    async fn test_generate_object_mismatch_is_provider_failure() {
        let provider = FakeProvider::new(8).with_structured("answer", |_| json!({"unexpected": 1}));
        let request = StructuredRequest::new(
            ModelTier::Small,
            OutputSchema { name: "answer", schema: json!({"type": "object"}) },
        );
        let err = generate_object::<Answer>(&provider, request).await.unwrap_err();
        assert!(matches!(AgentError::classify(&err), Some(AgentError::ProviderFailure(_))));
    }

    #[tokio::test]
    async fn test_generate_object_decodes() {
        let provider = FakeProvider::new(8).with_structured("answer", |_| json!({"value": "42"}));
        let request = StructuredRequest::new(
            ModelTier::Small,
            OutputSchema { name: "answer", schema: json!({"type": "object"}) },
        );
        let answer: Answer = generate_object(&provider, request).await.unwrap();
        assert_eq!(answer.value, "42");
    }
}
