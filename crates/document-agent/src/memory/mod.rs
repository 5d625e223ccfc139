//! Memory module - per-conversation message logs and vector-searchable working memory
pub mod conversation;
pub mod preferences;
pub mod tools;
pub mod working;

pub use conversation::{ConversationHandle, ConversationMemory, ConversationMessage, ConversationPreview, MessageRole};
pub use preferences::EditingPreferences;
pub use working::{MemoryEntry, MemoryScope, ScoredEntry, WorkingMemory};

use std::sync::Arc;

use tracing::info;

use crate::provider::Provider;
use crate::store::StoreAdapter;

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Conversation TTL in seconds; non-positive disables expiry.
    pub ttl_seconds: i64,
    pub embedding_dimensions: usize,
    /// Semantic cache hits must be strictly closer than this.
    pub semantic_cache_threshold: f32,
    pub preference_threshold: f32,
    pub delete_page_size: usize,
    pub max_delete_iterations: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: -1,
            embedding_dimensions: 1536,
            semantic_cache_threshold: 0.15,
            preference_threshold: 0.3,
            delete_page_size: 1000,
            max_delete_iterations: 50,
        }
    }
}

pub struct Memory {
    pub conversations: ConversationMemory,
    pub working: Arc<WorkingMemory>,
    pub preferences: EditingPreferences,
}

impl Memory {
    pub fn new(store: Arc<dyn StoreAdapter>, provider: Arc<dyn Provider>, config: MemoryConfig) -> Self {
        let working = Arc::new(WorkingMemory::new(Arc::clone(&store), Arc::clone(&provider), config.clone()));
        Self {
            conversations: ConversationMemory::new(store, config.ttl_seconds),
            preferences: EditingPreferences::new(Arc::clone(&working), provider, config.preference_threshold),
            working,
        }
    }

    /// Removes every conversation of the user together with the working-memory
    /// entries the user owns or contributed.
    pub async fn wipe_all(&self, user_id: &str) -> anyhow::Result<()> {
        self.conversations.wipe(user_id).await?;
        let removed = self.working.wipe_for_user(user_id).await?;
        info!(user_id, "Wiped conversations and {} memory entries", removed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{temp_store, FakeProvider};

    #[tokio::test]
    async fn test_wipe_all_clears_user_state_only() {
        let (_dir, store) = temp_store();
        let provider = Arc::new(FakeProvider::new(32));
        let config = MemoryConfig { embedding_dimensions: 32, ..MemoryConfig::default() };
        let memory = Memory::new(store, provider, config);

        let mine = memory.conversations.resolve("u1", None).await.unwrap();
        memory.conversations.push(&mine, MessageRole::User, "hello").await.unwrap();
        let theirs = memory.conversations.resolve("u2", None).await.unwrap();
        memory.conversations.push(&theirs, MessageRole::User, "hey").await.unwrap();

        memory.working.add_long_term("u1", "favourite colour", "blue").await.unwrap();
        memory.working.add_semantic("what is rust", "a language", Some("u1")).await.unwrap();
        memory.working.add_semantic("what is go", "a language", Some("u2")).await.unwrap();

        memory.wipe_all("u1").await.unwrap();

        assert!(memory.conversations.all_conversations("u1").await.unwrap().is_empty());
        assert_eq!(memory.conversations.all_conversations("u2").await.unwrap().len(), 1);
        assert!(memory
            .working
            .search(MemoryScope::LongTerm { user_id: "u1" }, "favourite colour", 5)
            .await
            .unwrap()
            .is_empty());
        let semantic = memory.working.search(MemoryScope::Semantic, "what is", 5).await.unwrap();
        assert_eq!(semantic.len(), 1);
        assert_eq!(semantic[0].entry.topic, "what is go");
    }
}
