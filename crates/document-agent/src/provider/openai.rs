//! OpenAI-compatible HTTP provider: `/v1/embeddings` and `/v1/chat/completions`,
//! with a bounded tool-call loop and JSON-schema structured output.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{ModelSet, PromptMessage, Provider, StructuredRequest, TextRequest, Tool};
use crate::error::AgentError;
use crate::metrics;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [WireMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl WireMessage {
    fn tool_result(call_id: String, content: String) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id),
        }
    }
}

impl From<&PromptMessage> for WireMessage {
    fn from(message: &PromptMessage) -> Self {
        let role = match message.role {
            super::Role::System => "system",
            super::Role::User => "user",
            super::Role::Assistant => "assistant",
        };
        Self {
            role: role.to_string(),
            content: Some(message.content.clone()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Clone, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Clone, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: WireMessage,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    models: ModelSet,
    max_tool_steps: usize,
    http_client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str, models: ModelSet, timeout: Duration) -> Self {
        info!("Provider client initialized with backend: {}", base_url);
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            models,
            max_tool_steps: 10,
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_max_tool_steps(mut self, steps: usize) -> Self {
        self.max_tool_steps = steps.max(1);
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.base_url)
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(&self, url: &str, body: &B) -> anyhow::Result<R> {
        let response = self
            .http_client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::provider(format!("request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::provider(format!("backend returned {}: {}", status, body)).into());
        }

        response
            .json()
            .await
            .map_err(|e| AgentError::provider(format!("failed to parse provider response: {}", e)).into())
    }

    async fn complete(&self, request: &ChatCompletionRequest<'_>) -> anyhow::Result<WireMessage> {
        metrics::inc_provider_call("chat");
        let completion: ChatCompletionResponse = self.post(&self.completions_url(), request).await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| AgentError::provider("completion returned no choices").into())
    }

    async fn run_tool(tools: &[Arc<dyn Tool>], call: &WireToolCall) -> String {
        let Some(tool) = tools.iter().find(|t| t.name() == call.function.name) else {
            warn!("Provider requested unknown tool {}", call.function.name);
            return format!("Unknown tool: {}", call.function.name);
        };
        let input: Value = match serde_json::from_str(&call.function.arguments) {
            Ok(input) => input,
            Err(e) => return format!("Invalid arguments for {}: {}", call.function.name, e),
        };
        debug!("Executing tool {}", call.function.name);
        match tool.execute(input).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Tool {} failed: {}", call.function.name, e);
                format!("Tool {} failed: {}", call.function.name, e)
            }
        }
    }
}

#[async_trait]
impl Provider for OpenAiClient {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        metrics::inc_provider_call("embed");
        let request = EmbeddingRequest {
            model: &self.models.embeddings,
            input: vec![text],
            dimensions: self.models.dimensions,
        };
        let response: EmbeddingResponse = self.post(&self.embeddings_url(), &request).await?;
        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AgentError::provider("embedding response was empty").into())
    }

    async fn generate_text(&self, request: TextRequest) -> anyhow::Result<String> {
        let model = self.models.chat_model(request.tier);
        let mut messages: Vec<WireMessage> = request.messages.iter().map(WireMessage::from).collect();
        let wire_tools: Vec<WireTool> = request
            .tools
            .iter()
            .map(|tool| WireTool {
                kind: "function",
                function: WireFunction {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.input_schema(),
                },
            })
            .collect();
        let max_steps = self.max_tool_steps.max(1);

        for step in 0..max_steps {
            // The final step withholds tools so the model has to answer.
            let tools = if step + 1 < max_steps { wire_tools.clone() } else { Vec::new() };
            let body = ChatCompletionRequest { model, messages: &messages, tools, response_format: None };
            let reply = self.complete(&body).await?;

            if reply.tool_calls.is_empty() {
                return Ok(reply.content.unwrap_or_default());
            }

            debug!("Step {}: provider requested {} tool calls", step, reply.tool_calls.len());
            let calls = reply.tool_calls.clone();
            messages.push(reply);
            for call in &calls {
                let output = Self::run_tool(&request.tools, call).await;
                messages.push(WireMessage::tool_result(call.id.clone(), output));
            }
        }

        Err(AgentError::provider(format!("no answer after {} tool steps", max_steps)).into())
    }

    async fn generate_structured(&self, request: StructuredRequest) -> anyhow::Result<Value> {
        let messages: Vec<WireMessage> = request.messages.iter().map(WireMessage::from).collect();
        let body = ChatCompletionRequest {
            model: self.models.chat_model(request.tier),
            messages: &messages,
            tools: Vec::new(),
            response_format: Some(json!({
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema.name,
                    "schema": request.schema.schema,
                    "strict": true,
                },
            })),
        };
        let reply = self.complete(&body).await?;
        let content = reply.content.unwrap_or_default();
        serde_json::from_str(&content).map_err(|e| {
            AgentError::provider(format!("structured output for {} is not JSON: {}", request.schema.name, e)).into()
        })
    }
}
