use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use super::MemoryConfig;
use crate::error::AgentError;
use crate::provider::Provider;
use crate::store::{get_json, IndexDefinition, SearchQuery, StoreAdapter, MAX_PAGE, ROOT};
use crate::utils::{next_id, now_millis};

const LONG_TERM_INDEX: &str = "idx-memory-longterm";
const LONG_TERM_PREFIX: &str = "memory:longterm:";
const SEMANTIC_INDEX: &str = "idx-memory-semantic";
const SEMANTIC_PREFIX: &str = "memory:semantic:";

/// Which partition a lookup runs against. Long-term entries belong to one
/// user; semantic entries are shared by everyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryScope<'a> {
    LongTerm { user_id: &'a str },
    Semantic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub id: String,
    pub topic: String,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// User whose question produced a semantic entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributed_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub distance: f32,
}

fn long_term_key(user_id: &str, id: &str) -> String {
    format!("{}u{}:{}", LONG_TERM_PREFIX, user_id, id)
}

fn semantic_key(id: &str) -> String {
    format!("{}{}", SEMANTIC_PREFIX, id)
}

/// Vector-searchable long-term (per user) and semantic (global) memory.
pub struct WorkingMemory {
    store: Arc<dyn StoreAdapter>,
    provider: Arc<dyn Provider>,
    config: MemoryConfig,
    indexes: OnceCell<()>,
}

impl WorkingMemory {
    pub fn new(store: Arc<dyn StoreAdapter>, provider: Arc<dyn Provider>, config: MemoryConfig) -> Self {
        Self { store, provider, config, indexes: OnceCell::new() }
    }

    async fn ensure_indexes(&self) -> anyhow::Result<()> {
        self.indexes
            .get_or_try_init(|| async {
                let dimensions = self.config.embedding_dimensions;
                self.store
                    .create_index(
                        &IndexDefinition::new(LONG_TERM_INDEX, LONG_TERM_PREFIX)
                            .tag("userId")
                            .tag("topic")
                            .vector("embedding", dimensions),
                    )
                    .await?;
                self.store
                    .create_index(
                        &IndexDefinition::new(SEMANTIC_INDEX, SEMANTIC_PREFIX)
                            .tag("contributedBy")
                            .text("topic")
                            .vector("embedding", dimensions),
                    )
                    .await?;
                Ok::<_, anyhow::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn insert(&self, key: String, mut entry: MemoryEntry) -> anyhow::Result<MemoryEntry> {
        self.ensure_indexes().await?;
        entry.embedding = self.provider.embed(&entry.topic).await?;
        self.store.set(&key, ROOT, serde_json::to_value(&entry)?).await?;
        Ok(entry)
    }

    fn entry(topic: &str, answer: &str) -> MemoryEntry {
        let now = now_millis();
        MemoryEntry {
            id: next_id(),
            topic: topic.to_string(),
            answer: answer.to_string(),
            embedding: Vec::new(),
            user_id: None,
            contributed_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn add_long_term(&self, user_id: &str, topic: &str, answer: &str) -> anyhow::Result<MemoryEntry> {
        let mut entry = Self::entry(topic, answer);
        entry.user_id = Some(user_id.to_string());
        let entry = self.insert(long_term_key(user_id, &entry.id), entry).await?;
        info!(user_id, "Stored long-term memory {} ({})", entry.id, entry.topic);
        Ok(entry)
    }

    pub async fn add_semantic(
        &self,
        topic: &str,
        answer: &str,
        contributed_by: Option<&str>,
    ) -> anyhow::Result<MemoryEntry> {
        let mut entry = Self::entry(topic, answer);
        entry.contributed_by = contributed_by.map(str::to_string);
        let entry = self.insert(semantic_key(&entry.id), entry).await?;
        debug!("Stored semantic memory {}", entry.id);
        Ok(entry)
    }

    fn key_for(scope: MemoryScope<'_>, id: &str) -> String {
        match scope {
            MemoryScope::LongTerm { user_id } => long_term_key(user_id, id),
            MemoryScope::Semantic => semantic_key(id),
        }
    }

    /// Re-embeds and overwrites an existing entry in place.
    pub async fn update_entry(
        &self,
        scope: MemoryScope<'_>,
        id: &str,
        topic: &str,
        answer: &str,
    ) -> anyhow::Result<MemoryEntry> {
        let key = Self::key_for(scope, id);
        let mut entry: MemoryEntry = get_json(self.store.as_ref(), &key)
            .await?
            .ok_or_else(|| AgentError::not_found("memory", id))?;

        entry.topic = topic.to_string();
        entry.answer = answer.to_string();
        entry.updated_at = now_millis();
        let entry = self.insert(key, entry).await?;
        debug!("Updated memory {}", entry.id);
        Ok(entry)
    }

    /// Nearest entries to `query`, closest first. Callers apply their own cutoff.
    pub async fn search(&self, scope: MemoryScope<'_>, query: &str, k: usize) -> anyhow::Result<Vec<ScoredEntry>> {
        self.nearest(scope, None, query, k).await
    }

    /// Like `search`, restricted to the user's long-term entries filed under exactly `topic`.
    pub async fn search_topic(&self, user_id: &str, topic: &str, k: usize) -> anyhow::Result<Vec<ScoredEntry>> {
        self.nearest(MemoryScope::LongTerm { user_id }, Some(topic), topic, k).await
    }

    async fn nearest(
        &self,
        scope: MemoryScope<'_>,
        topic: Option<&str>,
        query: &str,
        k: usize,
    ) -> anyhow::Result<Vec<ScoredEntry>> {
        self.ensure_indexes().await?;
        let vector = self.provider.embed(query).await?;

        let (index, search) = match scope {
            MemoryScope::LongTerm { user_id } => {
                (LONG_TERM_INDEX, SearchQuery::all().tag("userId", user_id).tag_opt("topic", topic))
            }
            MemoryScope::Semantic => (SEMANTIC_INDEX, SearchQuery::all()),
        };
        let search = search.knn("embedding", vector, k).page(0, k);
        let reply = self.store.search(index, &search).await?;

        Ok(reply
            .documents
            .iter()
            .filter_map(|hit| match hit.parse::<MemoryEntry>() {
                Ok(entry) => Some(ScoredEntry { entry, distance: hit.distance.unwrap_or(1.0) }),
                Err(e) => {
                    error!("{}", e);
                    None
                }
            })
            .collect())
    }

    /// Answer of a semantic entry close enough to count as the same question.
    pub async fn cached_answer(&self, question: &str) -> anyhow::Result<Option<String>> {
        let nearest = self.search(MemoryScope::Semantic, question, 1).await?;
        Ok(nearest
            .into_iter()
            .find(|hit| hit.distance < self.config.semantic_cache_threshold)
            .map(|hit| {
                debug!("Semantic cache hit at distance {:.3}", hit.distance);
                hit.entry.answer
            }))
    }

    /// Removes the user's long-term entries and the semantic entries they contributed.
    pub async fn wipe_for_user(&self, user_id: &str) -> anyhow::Result<usize> {
        self.ensure_indexes().await?;
        let keys = self.store.keys(&format!("{}u{}:", LONG_TERM_PREFIX, user_id)).await?;

        let contributed = SearchQuery::all()
            .tag("contributedBy", user_id)
            .returning(&["contributedBy"])
            .page(0, MAX_PAGE);
        let removed = crate::store::delete_all_matching(
            self.store.as_ref(),
            SEMANTIC_INDEX,
            contributed,
            self.config.delete_page_size,
            self.config.max_delete_iterations,
        )
        .await?;

        let long_term = self.store.del(&keys).await?;
        Ok(long_term + removed)
    }
}
