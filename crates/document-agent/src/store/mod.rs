//! Store adapter - JSON documents by key, secondary indexes over tag/text/vector
//! fields, paged search and per-key expiration.
pub mod schema;
pub mod sqlite;
pub mod vector;

pub use schema::{FieldKind, IndexDefinition, IndexField};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::AgentError;

/// Default page size of a search when no limit is given.
pub const DEFAULT_PAGE: usize = 10;
/// Largest page a single search returns.
pub const MAX_PAGE: usize = 1000;

/// Root JSON path.
pub const ROOT: &str = "$";

#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Creating an index that already exists succeeds without changes.
    async fn create_index(&self, definition: &IndexDefinition) -> anyhow::Result<()>;
    async fn index_exists(&self, name: &str) -> anyhow::Result<bool>;
    /// Drops the index; with `delete_documents` every key under its prefix goes too.
    async fn drop_index(&self, name: &str, delete_documents: bool) -> anyhow::Result<()>;

    /// Reads the value at `path`. `None` when the key or the path is absent.
    async fn get(&self, key: &str, path: &str) -> anyhow::Result<Option<Value>>;
    /// Writes `value` at `path`. Non-root paths require the key to exist.
    async fn set(&self, key: &str, path: &str, value: Value) -> anyhow::Result<()>;
    /// Root-level multi-set in one transaction.
    async fn mset(&self, entries: Vec<(String, Value)>) -> anyhow::Result<()>;
    /// Appends to the array at `path`, returning its new length.
    async fn append(&self, key: &str, path: &str, value: Value) -> anyhow::Result<usize>;
    async fn array_len(&self, key: &str, path: &str) -> anyhow::Result<Option<usize>>;

    async fn exists(&self, key: &str) -> anyhow::Result<bool>;
    async fn del(&self, keys: &[String]) -> anyhow::Result<usize>;
    /// Sets a TTL; a non-positive TTL deletes the key.
    async fn expire(&self, key: &str, seconds: i64) -> anyhow::Result<bool>;
    async fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>>;

    async fn search(&self, index: &str, query: &SearchQuery) -> anyhow::Result<SearchReply>;
}

#[derive(Debug, Clone)]
pub struct TagFilter {
    pub field: String,
    pub any_of: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct KnnClause {
    pub field: String,
    pub vector: Vec<f32>,
    pub k: usize,
}

#[derive(Debug, Clone)]
pub struct SortBy {
    pub field: String,
    pub descending: bool,
}

/// Search over one index. An empty query matches every document in scope.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub tags: Vec<TagFilter>,
    pub text: Option<(String, String)>,
    pub knn: Option<KnnClause>,
    pub sort_by: Option<SortBy>,
    /// Field aliases to project; empty returns whole documents.
    pub return_fields: Vec<String>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            text: None,
            knn: None,
            sort_by: None,
            return_fields: Vec::new(),
            offset: 0,
            limit: DEFAULT_PAGE,
        }
    }
}

impl SearchQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn tag(mut self, field: &str, value: impl Into<String>) -> Self {
        self.tags.push(TagFilter { field: field.to_string(), any_of: vec![value.into()] });
        self
    }

    pub fn tag_opt(self, field: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.tag(field, value),
            None => self,
        }
    }

    pub fn text(mut self, field: &str, needle: impl Into<String>) -> Self {
        self.text = Some((field.to_string(), needle.into()));
        self
    }

    pub fn knn(mut self, field: &str, vector: Vec<f32>, k: usize) -> Self {
        self.knn = Some(KnnClause { field: field.to_string(), vector, k });
        self
    }

    pub fn sort_by(mut self, field: &str, descending: bool) -> Self {
        self.sort_by = Some(SortBy { field: field.to_string(), descending });
        self
    }

    pub fn returning(mut self, fields: &[&str]) -> Self {
        self.return_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit.min(MAX_PAGE);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub key: String,
    pub value: Value,
    /// Cosine distance for KNN searches.
    pub distance: Option<f32>,
}

impl SearchHit {
    pub fn parse<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| anyhow::anyhow!("Malformed document at {}: {}", self.key, e))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchReply {
    pub total: usize,
    pub documents: Vec<SearchHit>,
}

impl SearchReply {
    pub fn keys(&self) -> Vec<String> {
        self.documents.iter().map(|hit| hit.key.clone()).collect()
    }

    /// Parses every hit, skipping (and logging) malformed ones.
    pub fn parse_all<T: DeserializeOwned>(&self) -> Vec<T> {
        self.documents
            .iter()
            .filter_map(|hit| match hit.parse() {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    error!("{}", e);
                    None
                }
            })
            .collect()
    }
}

/// Typed read of a whole document.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn StoreAdapter,
    key: &str,
) -> anyhow::Result<Option<T>> {
    match store.get(key, ROOT).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Search-and-delete until the index reports nothing left, at most `max_iterations` pages.
pub async fn delete_all_matching(
    store: &dyn StoreAdapter,
    index: &str,
    query: SearchQuery,
    page_size: usize,
    max_iterations: usize,
) -> anyhow::Result<usize> {
    let query = query.page(0, page_size);
    let mut deleted = 0;

    for iteration in 0..max_iterations {
        let reply = store.search(index, &query).await?;
        if reply.total == 0 {
            debug!("Cleared {} entries from {} in {} passes", deleted, index, iteration);
            return Ok(deleted);
        }
        deleted += store.del(&reply.keys()).await?;
    }

    let remaining = store.search(index, &query.page(0, 1)).await?.total;
    if remaining == 0 {
        return Ok(deleted);
    }
    error!(
        "Index {} still reports {} entries after {} deletion passes",
        index, remaining, max_iterations
    );
    Err(AgentError::StoreInconsistency { scope: index.to_string(), iterations: max_iterations }.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    /// Delegates to SQLite but never deletes anything.
    struct StickyStore(SqliteStore);

    #[async_trait]
    impl StoreAdapter for StickyStore {
        async fn create_index(&self, definition: &IndexDefinition) -> anyhow::Result<()> {
            self.0.create_index(definition).await
        }
        async fn index_exists(&self, name: &str) -> anyhow::Result<bool> {
            self.0.index_exists(name).await
        }
        async fn drop_index(&self, name: &str, delete_documents: bool) -> anyhow::Result<()> {
            self.0.drop_index(name, delete_documents).await
        }
        async fn get(&self, key: &str, path: &str) -> anyhow::Result<Option<Value>> {
            self.0.get(key, path).await
        }
        async fn set(&self, key: &str, path: &str, value: Value) -> anyhow::Result<()> {
            self.0.set(key, path, value).await
        }
        async fn mset(&self, entries: Vec<(String, Value)>) -> anyhow::Result<()> {
            self.0.mset(entries).await
        }
        async fn append(&self, key: &str, path: &str, value: Value) -> anyhow::Result<usize> {
            self.0.append(key, path, value).await
        }
        async fn array_len(&self, key: &str, path: &str) -> anyhow::Result<Option<usize>> {
            self.0.array_len(key, path).await
        }
        async fn exists(&self, key: &str) -> anyhow::Result<bool> {
            self.0.exists(key).await
        }
        async fn del(&self, _keys: &[String]) -> anyhow::Result<usize> {
            Ok(0)
        }
        async fn expire(&self, key: &str, seconds: i64) -> anyhow::Result<bool> {
            self.0.expire(key, seconds).await
        }
        async fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
            self.0.keys(prefix).await
        }
        async fn search(&self, index: &str, query: &SearchQuery) -> anyhow::Result<SearchReply> {
            self.0.search(index, query).await
        }
    }

    async fn seeded(dir: &TempDir, count: usize) -> SqliteStore {
        let store = SqliteStore::open(&dir.path().join("store.db")).unwrap();
        store
            .create_index(&IndexDefinition::new("idx-items", "items:").tag("group"))
            .await
            .unwrap();
        let entries = (0..count)
            .map(|i| (format!("items:{:03}", i), json!({"group": if i % 2 == 0 { "even" } else { "odd" }})))
            .collect();
        store.mset(entries).await.unwrap();
        store
    }

    #[test]
    fn test_page_is_capped() {
        let query = SearchQuery::all().page(0, 50_000);
        assert_eq!(query.limit, MAX_PAGE);
        assert_eq!(SearchQuery::all().limit, DEFAULT_PAGE);
    }

    #[tokio::test]
    async fn test_delete_all_matching_pages_through() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir, 25).await;

        let deleted = delete_all_matching(&store, "idx-items", SearchQuery::all().tag("group", "even"), 4, 10)
            .await
            .unwrap();
        assert_eq!(deleted, 13);

        let left = store.search("idx-items", &SearchQuery::all()).await.unwrap();
        assert_eq!(left.total, 12);
    }

    #[tokio::test]
    async fn test_delete_all_matching_is_bounded() {
        let dir = TempDir::new().unwrap();
        let store = StickyStore(seeded(&dir, 3).await);

        let err = delete_all_matching(&store, "idx-items", SearchQuery::all(), 2, 5)
            .await
            .unwrap_err();
        match AgentError::classify(&err) {
            Some(AgentError::StoreInconsistency { scope, iterations }) => {
                assert_eq!(scope, "idx-items");
                assert_eq!(*iterations, 5);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_json_typed() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir, 1).await;
        let value: Option<Value> = get_json(&store, "items:000").await.unwrap();
        assert_eq!(value, Some(json!({"group": "even"})));
        let missing: Option<Value> = get_json(&store, "items:999").await.unwrap();
        assert!(missing.is_none());
    }
}
