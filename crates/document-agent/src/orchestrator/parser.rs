use serde::Deserialize;
use serde_json::json;

use crate::provider::{generate_object, ModelTier, OutputSchema, Provider, StructuredRequest};

const PARSE_SYSTEM: &str = "Extract the website URL to crawl and any crawl instructions from the user's \
project prompt. Use null for anything the prompt does not mention.";

/// What a project prompt asks to crawl.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProjectPrompt {
    pub url: Option<String>,
    pub instructions: Option<String>,
}

pub async fn parse_project_prompt(provider: &dyn Provider, prompt: &str) -> anyhow::Result<ProjectPrompt> {
    if prompt.trim().is_empty() {
        return Ok(ProjectPrompt::default());
    }

    let schema = OutputSchema {
        name: "project_prompt",
        schema: json!({
            "type": "object",
            "properties": {
                "url": { "type": ["string", "null"] },
                "instructions": { "type": ["string", "null"] }
            },
            "required": ["url", "instructions"],
            "additionalProperties": false
        }),
    };
    let request = StructuredRequest::new(ModelTier::Small, schema)
        .system(PARSE_SYSTEM)
        .user(format!("Prompt:\n\"\"\"\n{}\n\"\"\"", prompt));

    let mut parsed: ProjectPrompt = generate_object(provider, request).await?;
    parsed.url = parsed.url.filter(|u| !u.trim().is_empty());
    parsed.instructions = parsed.instructions.filter(|i| !i.trim().is_empty());
    Ok(parsed)
}
