use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use super::prompts::{self, DiffOutput, RewriteOutput, UrlMatchOutput};
use super::{
    chunk_key, document_key, ChunkHit, Document, DocumentChunk, MarkdownExport, MarkdownSplitter, NewDocument,
    PipelineConfig,
    CHUNK_INDEX, CHUNK_PREFIX, DOCUMENT_INDEX, DOCUMENT_PREFIX,
};
use crate::error::AgentError;
use crate::metrics;
use crate::provider::{generate_object, Provider};
use crate::store::{delete_all_matching, get_json, IndexDefinition, SearchQuery, StoreAdapter, MAX_PAGE, ROOT};
use crate::utils::{encode_url, next_id, now_millis};

/// Per-document outcome reported while a bulk mutation runs.
#[derive(Debug)]
pub enum MutateProgress<'a> {
    Updated(&'a Document),
    Failed { document: &'a Document, error: &'a anyhow::Error },
}

#[derive(Debug, Default)]
pub struct BulkMutateReport {
    pub updated: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Deserialize)]
struct UrlOnly {
    #[serde(with = "crate::utils::codec::url_b64")]
    url: String,
}

pub struct DocumentPipeline {
    store: Arc<dyn StoreAdapter>,
    provider: Arc<dyn Provider>,
    config: PipelineConfig,
    splitter: MarkdownSplitter,
    indexes: OnceCell<()>,
}

impl DocumentPipeline {
    pub fn new(store: Arc<dyn StoreAdapter>, provider: Arc<dyn Provider>, config: PipelineConfig) -> Self {
        Self {
            splitter: MarkdownSplitter::new(config.chunk_size),
            store,
            provider,
            config,
            indexes: OnceCell::new(),
        }
    }

    async fn ensure_indexes(&self) -> anyhow::Result<()> {
        self.indexes
            .get_or_try_init(|| async {
                self.store
                    .create_index(
                        &IndexDefinition::new(DOCUMENT_INDEX, DOCUMENT_PREFIX)
                            .tag("userId")
                            .tag("projectId")
                            .tag("url")
                            .text("content"),
                    )
                    .await?;
                self.store
                    .create_index(
                        &IndexDefinition::new(CHUNK_INDEX, CHUNK_PREFIX)
                            .tag("documentId")
                            .tag("userId")
                            .tag("projectId")
                            .text("content")
                            .vector("embedding", self.config.embedding_dimensions),
                    )
                    .await?;
                Ok::<_, anyhow::Error>(())
            })
            .await?;
        Ok(())
    }

    /// Chunks and embeds the document's content, then stores every chunk at once.
    async fn index_chunks(&self, document: &Document) -> anyhow::Result<usize> {
        let pieces = self.splitter.split(&document.content);
        let mut embeddings = Vec::with_capacity(pieces.len());
        for batch in pieces.chunks(self.config.embed_batch_size.max(1)) {
            let results = join_all(batch.iter().map(|piece| self.provider.embed(piece))).await;
            for result in results {
                embeddings.push(result?);
            }
        }

        let mut entries = Vec::with_capacity(pieces.len());
        for (content, embedding) in pieces.into_iter().zip(embeddings) {
            let chunk = DocumentChunk {
                id: next_id(),
                document_id: document.id.clone(),
                user_id: document.user_id.clone(),
                project_id: document.project_id.clone(),
                content,
                embedding,
            };
            entries.push((chunk_key(&chunk.id), serde_json::to_value(&chunk)?));
        }

        let count = entries.len();
        if count > 0 {
            self.store.mset(entries).await?;
        }
        metrics::add_chunks_indexed(count);
        debug!(user_id = %document.user_id, "Indexed {} chunks for document {}", count, document.id);
        Ok(count)
    }

    /// Persists each document and its chunks. An empty input touches nothing.
    pub async fn ingest(
        &self,
        user_id: &str,
        project_id: &str,
        inputs: Vec<NewDocument>,
    ) -> anyhow::Result<Vec<Document>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_indexes().await?;

        let mut documents = Vec::with_capacity(inputs.len());
        for input in inputs {
            let document = Document {
                id: next_id(),
                user_id: user_id.to_string(),
                project_id: project_id.to_string(),
                url: input.url,
                content: input.content,
                created_at: now_millis(),
            };
            self.store
                .set(&document_key(&document.id), ROOT, serde_json::to_value(&document)?)
                .await?;
            self.index_chunks(&document).await?;
            documents.push(document);
        }

        info!(user_id, project_id, "Ingested {} documents", documents.len());
        Ok(documents)
    }

    /// Chunks strictly closer to `query` than the distance threshold, nearest first.
    pub async fn retrieve_chunks(
        &self,
        user_id: &str,
        query: &str,
        project_id: Option<&str>,
    ) -> anyhow::Result<Vec<ChunkHit>> {
        self.ensure_indexes().await?;
        let vector = self.provider.embed(query).await?;

        let search = SearchQuery::all()
            .tag("userId", user_id)
            .tag_opt("projectId", project_id)
            .knn("embedding", vector, self.config.knn_candidates)
            .returning(&["documentId", "userId", "projectId", "content"])
            .page(0, self.config.knn_candidates);
        let reply = self.store.search(CHUNK_INDEX, &search).await?;

        let hits: Vec<ChunkHit> = reply
            .documents
            .iter()
            .filter_map(|hit| {
                let distance = hit.distance?;
                if distance >= self.config.distance_threshold {
                    return None;
                }
                let mut chunk: DocumentChunk = match hit.parse() {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        error!("{}", e);
                        return None;
                    }
                };
                chunk.id = hit.key.trim_start_matches(CHUNK_PREFIX).to_string();
                Some(ChunkHit { chunk, distance })
            })
            .collect();

        debug!(user_id, "{} of {} candidate chunks within threshold", hits.len(), reply.total);
        Ok(hits)
    }

    /// Documents behind the nearest chunks. Falls back to asking the provider
    /// which known URL the query refers to.
    pub async fn retrieve_documents(
        &self,
        user_id: &str,
        project_id: Option<&str>,
        query: &str,
    ) -> anyhow::Result<Vec<Document>> {
        let hits = self.retrieve_chunks(user_id, query, project_id).await?;

        let mut seen = HashSet::new();
        let mut documents = Vec::new();
        for hit in hits {
            if !seen.insert(hit.chunk.document_id.clone()) {
                continue;
            }
            match self.read(&hit.chunk.document_id).await? {
                Some(document) => documents.push(document),
                None => warn!(user_id, "Chunk {} points at missing document {}", hit.chunk.id, hit.chunk.document_id),
            }
        }
        if !documents.is_empty() {
            return Ok(documents);
        }

        let urls = self.all_urls(user_id, project_id).await?;
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let matched: UrlMatchOutput = generate_object(self.provider.as_ref(), prompts::url_match(&urls, query)).await?;
        let url = match matched.matched_url {
            Some(url) if urls.contains(&url) => url,
            Some(url) => {
                debug!(user_id, "Provider picked unknown url {}", url);
                return Ok(Vec::new());
            }
            None => return Ok(Vec::new()),
        };

        debug!(user_id, "Falling back to url match {}", url);
        Ok(self.by_url(user_id, project_id, &url).await?.into_iter().collect())
    }

    /// Rewrites the document per `instruction` and rebuilds its chunks.
    pub async fn mutate(&self, document: &Document, instruction: &str) -> anyhow::Result<Document> {
        self.ensure_indexes().await?;
        let rewritten: RewriteOutput =
            generate_object(self.provider.as_ref(), prompts::rewrite(&document.content, instruction)).await?;

        let removed = delete_all_matching(
            self.store.as_ref(),
            CHUNK_INDEX,
            SearchQuery::all().tag("documentId", document.id.as_str()).returning(&["documentId"]),
            self.config.delete_page_size,
            self.config.max_delete_iterations,
        )
        .await?;

        let updated = Document { content: rewritten.modified_content, ..document.clone() };
        self.index_chunks(&updated).await?;
        match self.store.set(&document_key(&updated.id), "$.content", updated.content.clone().into()).await {
            Err(e) if crate::error::is_not_found(&e) => {
                return Err(AgentError::not_found("document", updated.id.clone()).into())
            }
            other => other?,
        }

        info!(user_id = %updated.user_id, "Mutated document {} ({} stale chunks removed)", updated.id, removed);
        Ok(updated)
    }

    /// Applies `instruction` to every document of the project, a fixed-size
    /// batch at a time. `progress` fires once per document.
    pub async fn bulk_mutate<F>(
        &self,
        progress: F,
        user_id: &str,
        project_id: &str,
        instruction: &str,
    ) -> anyhow::Result<BulkMutateReport>
    where
        F: Fn(MutateProgress<'_>) + Send + Sync,
    {
        let documents: Vec<Document> = self.scan(user_id, Some(project_id), &[]).await?;
        let mut report = BulkMutateReport::default();
        let progress = &progress;

        for batch in documents.chunks(self.config.mutate_batch_size.max(1)) {
            let outcomes = join_all(batch.iter().map(|document| async move {
                let outcome = self.mutate(document, instruction).await;
                match &outcome {
                    Ok(updated) => progress(MutateProgress::Updated(updated)),
                    Err(error) => progress(MutateProgress::Failed { document, error }),
                }
                (document.id.clone(), outcome)
            }))
            .await;

            for (id, outcome) in outcomes {
                match outcome {
                    Ok(_) => report.updated.push(id),
                    Err(e) => {
                        error!(user_id, "Failed to mutate document {}: {}", id, e);
                        report.failed.push(id);
                    }
                }
            }
        }

        info!(
            user_id,
            project_id,
            "Bulk mutation finished: {} updated, {} failed",
            report.updated.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Generic edit actions describing how `old_content` became `new_content`.
    pub async fn diff(&self, old_content: &str, new_content: &str) -> anyhow::Result<Vec<String>> {
        let output: DiffOutput = generate_object(self.provider.as_ref(), prompts::diff(old_content, new_content)).await?;
        Ok(output.actions)
    }

    /// Every document in scope, one page at a time in key order.
    async fn scan<T: DeserializeOwned>(
        &self,
        user_id: &str,
        project_id: Option<&str>,
        fields: &[&str],
    ) -> anyhow::Result<Vec<T>> {
        self.ensure_indexes().await?;
        let page = self.config.url_page_size.clamp(1, MAX_PAGE);
        let mut found = Vec::new();
        let mut offset = 0;
        loop {
            let query = SearchQuery::all()
                .tag("userId", user_id)
                .tag_opt("projectId", project_id)
                .returning(fields)
                .page(offset, page);
            let reply = self.store.search(DOCUMENT_INDEX, &query).await?;
            let fetched = reply.documents.len();
            found.extend(reply.parse_all::<T>());
            offset += fetched;
            if fetched < page || offset >= reply.total {
                break;
            }
        }
        Ok(found)
    }

    /// First page of the user's documents, ordered by url.
    pub async fn all(&self, user_id: &str, project_id: Option<&str>) -> anyhow::Result<Vec<Document>> {
        let mut documents: Vec<Document> = self.scan(user_id, project_id, &[]).await?;
        documents.sort_by(|a, b| a.url.cmp(&b.url).then_with(|| a.id.cmp(&b.id)));
        documents.truncate(self.config.list_page_size);
        Ok(documents)
    }

    pub async fn all_urls(&self, user_id: &str, project_id: Option<&str>) -> anyhow::Result<Vec<String>> {
        let urls: Vec<UrlOnly> = self.scan(user_id, project_id, &["url"]).await?;
        Ok(urls.into_iter().map(|u| u.url).collect())
    }

    pub async fn by_url(
        &self,
        user_id: &str,
        project_id: Option<&str>,
        url: &str,
    ) -> anyhow::Result<Option<Document>> {
        self.ensure_indexes().await?;
        let query = SearchQuery::all()
            .tag("userId", user_id)
            .tag_opt("projectId", project_id)
            .tag("url", encode_url(url))
            .page(0, 1);
        Ok(self.store.search(DOCUMENT_INDEX, &query).await?.parse_all().into_iter().next())
    }

    pub async fn read(&self, document_id: &str) -> anyhow::Result<Option<Document>> {
        get_json(self.store.as_ref(), &document_key(document_id)).await
    }

    /// The user's document as a markdown file; another user's document reads as missing.
    pub async fn export_markdown(&self, user_id: &str, document_id: &str) -> anyhow::Result<MarkdownExport> {
        let document = self
            .read(document_id)
            .await?
            .filter(|d| d.user_id == user_id)
            .ok_or_else(|| AgentError::not_found("document", document_id))?;
        debug!(user_id, "Exporting document {} as markdown", document_id);
        Ok(MarkdownExport::of(&document))
    }

    /// Removes the user's documents and their chunks.
    pub async fn remove_all_for_user(&self, user_id: &str) -> anyhow::Result<usize> {
        self.ensure_indexes().await?;
        let scope = SearchQuery::all().tag("userId", user_id).returning(&["userId"]);
        let page = self.config.delete_page_size;
        let max = self.config.max_delete_iterations;

        let chunks = delete_all_matching(self.store.as_ref(), CHUNK_INDEX, scope.clone(), page, max).await?;
        let documents = delete_all_matching(self.store.as_ref(), DOCUMENT_INDEX, scope, page, max).await?;
        info!(user_id, "Removed {} documents and {} chunks", documents, chunks);
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use crate::testing::{fenced, temp_store, FakeProvider};

    const DIMS: usize = 256;

    fn pipeline_with(
        provider: FakeProvider,
        config: PipelineConfig,
    ) -> (tempfile::TempDir, Arc<crate::store::SqliteStore>, Arc<FakeProvider>, DocumentPipeline) {
        let (dir, store) = temp_store();
        let provider = Arc::new(provider);
        let pipeline = DocumentPipeline::new(store.clone(), provider.clone(), config);
        (dir, store, provider, pipeline)
    }

    fn config() -> PipelineConfig {
        PipelineConfig { embedding_dimensions: DIMS, ..PipelineConfig::default() }
    }

    fn pipeline(
        provider: FakeProvider,
    ) -> (tempfile::TempDir, Arc<crate::store::SqliteStore>, Arc<FakeProvider>, DocumentPipeline) {
        pipeline_with(provider, config())
    }

    fn rewrite_replacing(from: &'static str, to: &'static str) -> FakeProvider {
        FakeProvider::new(DIMS).with_structured("document_rewrite", move |request| {
            json!({ "modifiedContent": fenced(request, 0).replace(from, to) })
        })
    }

    async fn chunks_of(store: &crate::store::SqliteStore, document_id: &str) -> Vec<DocumentChunk> {
        store
            .search(CHUNK_INDEX, &SearchQuery::all().tag("documentId", document_id).page(0, 1000))
            .await
            .unwrap()
            .parse_all()
    }

    #[tokio::test]
    async fn test_ingest_empty_is_noop() {
        let (_dir, store, provider, pipeline) = pipeline(FakeProvider::new(DIMS));
        let documents = pipeline.ingest("u1", "p1", Vec::new()).await.unwrap();

        assert!(documents.is_empty());
        assert!(store.keys("").await.unwrap().is_empty());
        assert!(!store.index_exists(CHUNK_INDEX).await.unwrap());
        assert_eq!(provider.embed_calls(), 0);
    }

    #[tokio::test]
    async fn test_ingest_chunks_and_embeds_in_batches() {
        let provider = FakeProvider::new(DIMS).with_delay(Duration::from_millis(5));
        let config = PipelineConfig { chunk_size: 20, ..config() };
        let (_dir, store, provider, pipeline) = pipeline_with(provider, config);

        let content = (0..30).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ");
        let documents = pipeline
            .ingest("u1", "p1", vec![NewDocument::new("https://a.io", content)])
            .await
            .unwrap();

        let chunks = chunks_of(&store, &documents[0].id).await;
        assert!(chunks.len() > 10);
        assert!(chunks.iter().all(|c| c.content.chars().count() <= 20 && c.embedding.len() == DIMS));
        assert_eq!(provider.embed_calls(), chunks.len());
        assert_eq!(provider.peak_embeds(), 10);
        assert_eq!(pipeline.read(&documents[0].id).await.unwrap().unwrap(), documents[0]);
    }

    #[tokio::test]
    async fn test_retrieve_chunks_respects_threshold() {
        let (_dir, _store, _provider, pipeline) = pipeline(FakeProvider::new(DIMS));
        pipeline
            .ingest(
                "u1",
                "p1",
                vec![
                    NewDocument::new("https://a.io/rust", "rust ownership borrowing lifetimes"),
                    NewDocument::new("https://a.io/garden", "tomatoes need sun and water"),
                    NewDocument::new("https://a.io/mixed", "rust ownership tomatoes sun water soil compost"),
                ],
            )
            .await
            .unwrap();

        for query in [
            "rust ownership borrowing lifetimes",
            "tomatoes need sun",
            "rust",
            "compost soil",
            "nothing relevant here",
        ] {
            let hits = pipeline.retrieve_chunks("u1", query, None).await.unwrap();
            assert!(hits.iter().all(|h| h.distance < 0.3), "query {:?} returned {:?}", query, hits);
            assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
            assert!(hits.iter().all(|h| h.chunk.embedding.is_empty() && !h.chunk.id.is_empty()));
        }

        let exact = pipeline.retrieve_chunks("u1", "rust ownership borrowing lifetimes", None).await.unwrap();
        assert_eq!(exact[0].chunk.content, "rust ownership borrowing lifetimes");
        assert!(pipeline.retrieve_chunks("u2", "rust ownership borrowing lifetimes", None).await.unwrap().is_empty());
        assert!(pipeline
            .retrieve_chunks("u1", "rust ownership borrowing lifetimes", Some("p2"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_documents_dedupes() {
        let config = PipelineConfig { chunk_size: 30, ..config() };
        let (_dir, _store, provider, pipeline) = pipeline_with(FakeProvider::new(DIMS), config);
        pipeline
            .ingest(
                "u1",
                "p1",
                vec![NewDocument::new("https://a.io", "alpha beta gamma\n\nalpha beta gamma\n\nalpha beta gamma")],
            )
            .await
            .unwrap();

        let documents = pipeline.retrieve_documents("u1", Some("p1"), "alpha beta gamma").await.unwrap();
        assert_eq!(documents.len(), 1);
        assert!(provider.structured_calls().is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_documents_falls_back_to_url() {
        let provider = FakeProvider::new(DIMS).with_structured("url_match", |request| {
            let urls = fenced(request, 0);
            let query = fenced(request, 1);
            let matched = urls.lines().find(|url| query.contains(url));
            json!({ "matchedUrl": matched })
        });
        let (_dir, _store, provider, pipeline) = pipeline(provider);
        pipeline
            .ingest(
                "u1",
                "p1",
                vec![
                    NewDocument::new("https://example.com/pricing", "Plans cost ten dollars monthly"),
                    NewDocument::new("https://example.com/about", "We are a small team"),
                ],
            )
            .await
            .unwrap();

        let documents = pipeline
            .retrieve_documents("u1", Some("p1"), "summarize https://example.com/pricing please")
            .await
            .unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].url, "https://example.com/pricing");
        assert_eq!(provider.structured_calls(), vec!["url_match"]);

        let none = pipeline.retrieve_documents("u1", Some("p1"), "volcano eruptions").await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_documents_without_urls_skips_provider() {
        let (_dir, _store, provider, pipeline) = pipeline(FakeProvider::new(DIMS));
        assert!(pipeline.retrieve_documents("u1", None, "anything").await.unwrap().is_empty());
        assert!(provider.structured_calls().is_empty());
    }

    #[tokio::test]
    async fn test_mutate_rebuilds_chunks() {
        let config = PipelineConfig { chunk_size: 25, ..config() };
        let (_dir, store, _provider, pipeline) = pipeline_with(rewrite_replacing("alpha", "omega"), config);
        let original = "alpha one two\n\nalpha three four\n\nalpha five six\n\nalpha seven eight";
        let documents = pipeline.ingest("u1", "p1", vec![NewDocument::new("https://a.io", original)]).await.unwrap();
        let before = chunks_of(&store, &documents[0].id).await;
        assert!(before.len() > 1);

        let updated = pipeline.mutate(&documents[0], "rename alpha").await.unwrap();
        assert!(!updated.content.contains("alpha"));

        let after = chunks_of(&store, &documents[0].id).await;
        assert!(!after.is_empty());
        assert!(after.iter().all(|c| c.content.contains("omega") && !c.content.contains("alpha")));
        let old_ids: HashSet<_> = before.iter().map(|c| c.id.clone()).collect();
        assert!(after.iter().all(|c| !old_ids.contains(&c.id)));
        assert_eq!(pipeline.read(&updated.id).await.unwrap().unwrap().content, updated.content);
    }

    #[tokio::test]
    async fn test_mutate_provider_failure_leaves_chunks() {
        let (_dir, store, _provider, pipeline) = pipeline(FakeProvider::new(DIMS));
        let documents = pipeline.ingest("u1", "p1", vec![NewDocument::new("https://a.io", "text")]).await.unwrap();

        let err = pipeline.mutate(&documents[0], "anything").await.unwrap_err();
        assert!(matches!(AgentError::classify(&err), Some(AgentError::ProviderFailure(_))));
        assert_eq!(chunks_of(&store, &documents[0].id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_mutate_is_batched() {
        let provider = rewrite_replacing("draft", "final").with_delay(Duration::from_millis(20));
        let (_dir, _store, provider, pipeline) = pipeline(provider);
        let inputs = (0..32)
            .map(|i| NewDocument::new(format!("https://a.io/{:02}", i), format!("draft number {}", i)))
            .collect();
        pipeline.ingest("u1", "p1", inputs).await.unwrap();
        pipeline
            .ingest("u1", "p2", vec![NewDocument::new("https://b.io", "draft elsewhere")])
            .await
            .unwrap();

        let fired = AtomicUsize::new(0);
        let report = pipeline
            .bulk_mutate(
                |progress| {
                    if let MutateProgress::Updated(document) = progress {
                        assert!(document.content.starts_with("final"));
                    }
                    fired.fetch_add(1, Ordering::SeqCst);
                },
                "u1",
                "p1",
                "finalize",
            )
            .await
            .unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 32);
        assert_eq!(report.updated.len(), 32);
        assert!(report.failed.is_empty());
        assert_eq!(provider.structured_calls().len(), 32);
        assert_eq!(provider.peak_structured(), 15);

        let untouched = pipeline.all("u1", Some("p2")).await.unwrap();
        assert_eq!(untouched[0].content, "draft elsewhere");
    }

    #[tokio::test]
    async fn test_bulk_mutate_reports_failures() {
        let (_dir, _store, _provider, pipeline) = pipeline(FakeProvider::new(DIMS));
        pipeline
            .ingest("u1", "p1", vec![NewDocument::new("https://a.io", "a"), NewDocument::new("https://b.io", "b")])
            .await
            .unwrap();

        let failed = AtomicUsize::new(0);
        let report = pipeline
            .bulk_mutate(
                |progress| {
                    if matches!(progress, MutateProgress::Failed { .. }) {
                        failed.fetch_add(1, Ordering::SeqCst);
                    }
                },
                "u1",
                "p1",
                "anything",
            )
            .await
            .unwrap();
        assert_eq!(failed.load(Ordering::SeqCst), 2);
        assert_eq!(report.failed.len(), 2);
    }

    #[tokio::test]
    async fn test_diff_returns_actions() {
        let provider = FakeProvider::new(DIMS).with_structured("document_diff", |request| {
            assert_eq!(fenced(request, 0), "1. one");
            assert_eq!(fenced(request, 1), "- one");
            json!({ "actions": ["Convert numbered lists to bullet lists"] })
        });
        let (_dir, _store, _provider, pipeline) = pipeline(provider);
        let actions = pipeline.diff("1. one", "- one").await.unwrap();
        assert_eq!(actions, vec!["Convert numbered lists to bullet lists"]);
    }

    #[tokio::test]
    async fn test_listing_and_lookup() {
        let (_dir, _store, _provider, pipeline) = pipeline(FakeProvider::new(DIMS));
        pipeline
            .ingest(
                "u1",
                "p1",
                vec![NewDocument::new("https://z.io", "z"), NewDocument::new("https://a.io/x?y=1", "a")],
            )
            .await
            .unwrap();
        pipeline.ingest("u1", "p2", vec![NewDocument::new("https://m.io", "m")]).await.unwrap();

        assert_eq!(pipeline.all("u1", Some("p1")).await.unwrap().len(), 2);
        assert_eq!(pipeline.all("u1", None).await.unwrap().len(), 3);
        let mut urls = pipeline.all_urls("u1", Some("p1")).await.unwrap();
        urls.sort();
        assert_eq!(urls, vec!["https://a.io/x?y=1", "https://z.io"]);

        let found = pipeline.by_url("u1", Some("p1"), "https://a.io/x?y=1").await.unwrap().unwrap();
        assert_eq!(found.content, "a");
        assert!(pipeline.by_url("u1", Some("p2"), "https://a.io/x?y=1").await.unwrap().is_none());
        assert!(pipeline.read("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_all_for_user() {
        let (_dir, store, _provider, pipeline) = pipeline(FakeProvider::new(DIMS));
        let mine = pipeline.ingest("u1", "p1", vec![NewDocument::new("https://a.io", "a")]).await.unwrap();
        pipeline.ingest("u1", "p2", vec![NewDocument::new("https://b.io", "b")]).await.unwrap();
        let theirs = pipeline.ingest("u2", "p1", vec![NewDocument::new("https://c.io", "c")]).await.unwrap();

        assert_eq!(pipeline.remove_all_for_user("u1").await.unwrap(), 2);
        assert!(pipeline.all("u1", None).await.unwrap().is_empty());
        assert!(chunks_of(&store, &mine[0].id).await.is_empty());
        assert_eq!(pipeline.all("u2", None).await.unwrap().len(), 1);
        assert_eq!(chunks_of(&store, &theirs[0].id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_mutate_pages_past_first_page() {
        let config = PipelineConfig { url_page_size: 4, mutate_batch_size: 3, ..config() };
        let (_dir, _store, _provider, pipeline) = pipeline_with(rewrite_replacing("draft", "final"), config);
        let inputs = (0..10)
            .map(|i| NewDocument::new(format!("https://a.io/{}", i), format!("draft {}", i)))
            .collect();
        pipeline.ingest("u1", "p1", inputs).await.unwrap();

        let fired = AtomicUsize::new(0);
        let report = pipeline
            .bulk_mutate(|_| { fired.fetch_add(1, Ordering::SeqCst); }, "u1", "p1", "finalize")
            .await
            .unwrap();

        assert_eq!(report.updated.len(), 10);
        assert_eq!(fired.load(Ordering::SeqCst), 10);
        let documents = pipeline.all("u1", Some("p1")).await.unwrap();
        assert_eq!(documents.len(), 10);
        assert!(documents.iter().all(|d| d.content.starts_with("final")));
        assert_eq!(pipeline.all_urls("u1", Some("p1")).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_all_is_ordered_by_decoded_url() {
        let config = PipelineConfig { url_page_size: 2, list_page_size: 3, ..config() };
        let (_dir, _store, _provider, pipeline) = pipeline_with(FakeProvider::new(DIMS), config);
        let urls = ["https://zeta.io", "https://alpha.io/b", "https://mid.io", "https://alpha.io/a", "https://beta.io"];
        let inputs = urls.iter().map(|url| NewDocument::new(*url, "text")).collect();
        pipeline.ingest("u1", "p1", inputs).await.unwrap();

        let listed: Vec<String> = pipeline
            .all("u1", Some("p1"))
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.url)
            .collect();
        assert_eq!(listed, vec!["https://alpha.io/a", "https://alpha.io/b", "https://beta.io"]);
    }

    #[tokio::test]
    async fn test_export_markdown_is_user_scoped() {
        let (_dir, _store, _provider, pipeline) = pipeline(FakeProvider::new(DIMS));
        let documents = pipeline
            .ingest("u1", "p1", vec![NewDocument::new("https://a.io/guides/setup", "# Setup\n\nsteps")])
            .await
            .unwrap();

        let export = pipeline.export_markdown("u1", &documents[0].id).await.unwrap();
        assert_eq!(export.file_name, "setup.md");
        assert_eq!(export.content, "# Setup\n\nsteps");

        let err = pipeline.export_markdown("u2", &documents[0].id).await.unwrap_err();
        assert!(crate::error::is_not_found(&err));
        assert!(crate::error::is_not_found(&pipeline.export_markdown("u1", "missing").await.unwrap_err()));
    }
}
