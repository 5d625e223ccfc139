use std::sync::Arc;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::error::{is_not_found, AgentError};
use crate::store::{IndexDefinition, SearchQuery, StoreAdapter, MAX_PAGE, ROOT};
use crate::utils::{next_id, now_millis};

/// Preview shown for a conversation without messages.
pub const EMPTY_PREVIEW: &str = "New chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    /// Unix milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationRecord {
    user_id: String,
    conversation_id: String,
    summary: String,
    last_summarized_at: i64,
    messages: Vec<ConversationMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationSummary {
    conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPreview {
    pub conversation_id: String,
    pub preview: String,
}

/// A resolved conversation. Cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationHandle {
    pub user_id: String,
    pub conversation_id: String,
    key: String,
}

impl ConversationHandle {
    fn new(user_id: &str, conversation_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            key: conversation_key(user_id, conversation_id),
        }
    }
}

fn conversation_prefix(user_id: &str) -> String {
    format!("users:u{}:memory:shortterm:", user_id)
}

fn conversation_key(user_id: &str, conversation_id: &str) -> String {
    format!("{}c{}", conversation_prefix(user_id), conversation_id)
}

fn index_name(user_id: &str) -> String {
    format!("idx-{}", conversation_prefix(user_id).trim_end_matches(':').replace(':', "-"))
}

/// Per-user, per-conversation ordered message logs.
pub struct ConversationMemory {
    store: Arc<dyn StoreAdapter>,
    ttl_seconds: i64,
    known_indexes: Cache<String, ()>,
}

impl ConversationMemory {
    pub fn new(store: Arc<dyn StoreAdapter>, ttl_seconds: i64) -> Self {
        Self {
            store,
            ttl_seconds,
            known_indexes: Cache::new(10_000),
        }
    }

    async fn ensure_index(&self, user_id: &str) -> anyhow::Result<()> {
        let name = index_name(user_id);
        if self.known_indexes.contains_key(&name) {
            return Ok(());
        }
        if !self.store.index_exists(&name).await? {
            let definition = IndexDefinition::new(name.clone(), conversation_prefix(user_id))
                .tag("userId")
                .tag("conversationId")
                .text("summary")
                .numeric("lastSummarizedAt");
            self.store.create_index(&definition).await?;
            debug!(user_id, "Created conversation index {}", name);
        }
        self.known_indexes.insert(name, ());
        Ok(())
    }

    async fn refresh_ttl(&self, key: &str) -> anyhow::Result<()> {
        if self.ttl_seconds > 0 {
            self.store.expire(key, self.ttl_seconds).await?;
        }
        Ok(())
    }

    async fn create(&self, user_id: &str, conversation_id: &str) -> anyhow::Result<ConversationHandle> {
        let handle = ConversationHandle::new(user_id, conversation_id);
        let record = ConversationRecord {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            summary: String::new(),
            last_summarized_at: now_millis(),
            messages: Vec::new(),
        };
        self.store.set(&handle.key, ROOT, serde_json::to_value(&record)?).await?;
        self.refresh_ttl(&handle.key).await?;
        Ok(handle)
    }

    /// Binds to an existing conversation, or allocates a new one when the id is
    /// absent or unknown.
    pub async fn resolve(&self, user_id: &str, conversation_id: Option<&str>) -> anyhow::Result<ConversationHandle> {
        self.ensure_index(user_id).await?;

        if let Some(id) = conversation_id {
            let handle = ConversationHandle::new(user_id, id);
            if self.store.exists(&handle.key).await? {
                return Ok(handle);
            }
            debug!(user_id, "Conversation {} not found, allocating a new one", id);
        }

        let handle = self.create(user_id, &next_id()).await?;
        info!(user_id, "Started conversation {}", handle.conversation_id);
        Ok(handle)
    }

    pub async fn exists(&self, user_id: &str, conversation_id: &str) -> anyhow::Result<bool> {
        self.store.exists(&conversation_key(user_id, conversation_id)).await
    }

    /// Appends a message. Previously appended messages are never reordered.
    pub async fn push(
        &self,
        handle: &ConversationHandle,
        role: MessageRole,
        content: &str,
    ) -> anyhow::Result<ConversationMessage> {
        let message = ConversationMessage {
            id: next_id(),
            role,
            content: content.to_string(),
            timestamp: now_millis(),
        };
        let value = serde_json::to_value(&message)?;

        match self.store.append(&handle.key, "$.messages", value.clone()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {
                // Expired between resolve and push.
                debug!(user_id = %handle.user_id, "Recreating expired conversation {}", handle.conversation_id);
                self.create(&handle.user_id, &handle.conversation_id).await?;
                self.store.append(&handle.key, "$.messages", value).await?;
            }
            Err(e) => return Err(e),
        }

        self.refresh_ttl(&handle.key).await?;
        Ok(message)
    }

    pub async fn latest(&self, handle: &ConversationHandle) -> anyhow::Result<Option<ConversationMessage>> {
        match self.store.get(&handle.key, "$.messages[-1]").await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn messages(&self, handle: &ConversationHandle) -> anyhow::Result<Vec<ConversationMessage>> {
        match self.store.get(&handle.key, "$.messages").await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Every conversation of the user with its latest message as preview, newest first.
    pub async fn all_conversations(&self, user_id: &str) -> anyhow::Result<Vec<ConversationPreview>> {
        self.ensure_index(user_id).await?;
        let query = SearchQuery::all()
            .sort_by("conversationId", true)
            .returning(&["conversationId"])
            .page(0, MAX_PAGE);
        let reply = self.store.search(&index_name(user_id), &query).await?;

        let mut previews = Vec::with_capacity(reply.documents.len());
        for summary in reply.parse_all::<ConversationSummary>() {
            let handle = ConversationHandle::new(user_id, &summary.conversation_id);
            let preview = self
                .latest(&handle)
                .await?
                .map(|m| m.content)
                .unwrap_or_else(|| EMPTY_PREVIEW.to_string());
            previews.push(ConversationPreview { conversation_id: summary.conversation_id, preview });
        }
        Ok(previews)
    }

    /// Empties the message log; the conversation itself survives.
    pub async fn clear(&self, handle: &ConversationHandle) -> anyhow::Result<()> {
        match self.store.set(&handle.key, "$.messages", json!([])).await {
            Err(e) if is_not_found(&e) => {
                Err(AgentError::not_found("conversation", handle.conversation_id.clone()).into())
            }
            other => other,
        }
    }

    /// Drops every conversation of the user along with the user's index.
    pub async fn wipe(&self, user_id: &str) -> anyhow::Result<()> {
        let name = index_name(user_id);
        self.store.drop_index(&name, true).await?;
        self.known_indexes.invalidate(&name);
        // Conversations created before the index existed are not covered by it.
        let stray = self.store.keys(&conversation_prefix(user_id)).await?;
        self.store.del(&stray).await?;
        info!(user_id, "Removed all conversations");
        Ok(())
    }
}
