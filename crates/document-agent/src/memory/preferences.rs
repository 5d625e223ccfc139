use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::working::{MemoryEntry, MemoryScope, WorkingMemory};
use crate::provider::{generate_object, ModelTier, OutputSchema, Provider, StructuredRequest};

/// Topic under which a user's editing preferences live in long-term memory.
pub const PREFERENCES_TOPIC: &str = "Editing preferences";

const MERGE_SYSTEM: &str = "You maintain a list of document editing preferences for a user. \
Combine the existing preferences with the new ones into a single list of generic edit actions. \
When two preferences conflict, keep the newer one. Drop duplicates. \
Reply with the merged list, one action per line.";

#[derive(Debug, Deserialize)]
struct MergedPreferences {
    preferences: String,
}

fn merge_schema() -> OutputSchema {
    OutputSchema {
        name: "preference_merge",
        schema: json!({
            "type": "object",
            "properties": { "preferences": { "type": "string" } },
            "required": ["preferences"],
            "additionalProperties": false
        }),
    }
}

pub struct EditingPreferences {
    working: Arc<WorkingMemory>,
    provider: Arc<dyn Provider>,
    threshold: f32,
}

impl EditingPreferences {
    pub fn new(working: Arc<WorkingMemory>, provider: Arc<dyn Provider>, threshold: f32) -> Self {
        Self { working, provider, threshold }
    }

    /// The user's stored preferences, if an entry filed under the preferences topic is close enough.
    pub async fn find(&self, user_id: &str) -> anyhow::Result<Option<MemoryEntry>> {
        let hits = self.working.search_topic(user_id, PREFERENCES_TOPIC, 1).await?;
        Ok(hits
            .into_iter()
            .find(|hit| hit.distance < self.threshold)
            .map(|hit| hit.entry))
    }

    /// Folds `actions` into the stored preferences, newest winning on conflict.
    pub async fn merge(&self, user_id: &str, actions: &[String]) -> anyhow::Result<MemoryEntry> {
        let incoming = actions.join("\n");

        match self.find(user_id).await? {
            Some(existing) => {
                let request = StructuredRequest::new(ModelTier::Medium, merge_schema())
                    .system(MERGE_SYSTEM)
                    .user(format!(
                        "Existing preferences:\n\"\"\"\n{}\n\"\"\"\n\nNew preferences:\n\"\"\"\n{}\n\"\"\"",
                        existing.answer, incoming
                    ));
                let merged: MergedPreferences = generate_object(self.provider.as_ref(), request).await?;
                info!(user_id, "Merged editing preferences into {}", existing.id);
                self.working
                    .update_entry(MemoryScope::LongTerm { user_id }, &existing.id, PREFERENCES_TOPIC, &merged.preferences)
                    .await
            }
            None => self.working.add_long_term(user_id, PREFERENCES_TOPIC, &incoming).await,
        }
    }
}
