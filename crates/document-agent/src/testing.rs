//! Deterministic collaborators for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use crate::error::AgentError;
use crate::provider::{CrawledPage, Crawler, Provider, StructuredRequest, TextRequest};
use crate::store::SqliteStore;

type StructuredFn = Box<dyn Fn(&StructuredRequest) -> Value + Send + Sync>;
type TextFn = Box<dyn Fn(&TextRequest) -> String + Send + Sync>;

pub fn temp_store() -> (TempDir, Arc<SqliteStore>) {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("agent.db")).unwrap();
    (dir, Arc::new(store))
}

/// Bag-of-words embeddings: texts sharing words are close, identical texts have distance 0.
pub fn bag_of_words(text: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0.0; dimensions];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
    {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in word.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        vector[(hash % dimensions as u64) as usize] += 1.0;
    }
    vector
}

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeProvider {
    dimensions: usize,
    delay: Option<Duration>,
    structured: HashMap<&'static str, StructuredFn>,
    text: Option<TextFn>,
    fail_text: AtomicBool,
    fail_embed: AtomicBool,
    embed_calls: AtomicUsize,
    text_calls: AtomicUsize,
    structured_calls: Mutex<Vec<&'static str>>,
    embeds_in_flight: Gauge,
    structured_in_flight: Gauge,
}

impl FakeProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            delay: None,
            structured: HashMap::new(),
            text: None,
            fail_text: AtomicBool::new(false),
            fail_embed: AtomicBool::new(false),
            embed_calls: AtomicUsize::new(0),
            text_calls: AtomicUsize::new(0),
            structured_calls: Mutex::new(Vec::new()),
            embeds_in_flight: Gauge::default(),
            structured_in_flight: Gauge::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_structured(
        mut self,
        name: &'static str,
        reply: impl Fn(&StructuredRequest) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.structured.insert(name, Box::new(reply));
        self
    }

    pub fn with_text(mut self, reply: impl Fn(&TextRequest) -> String + Send + Sync + 'static) -> Self {
        self.text = Some(Box::new(reply));
        self
    }

    pub fn fail_text(&self, fail: bool) {
        self.fail_text.store(fail, Ordering::SeqCst);
    }

    pub fn fail_embed(&self, fail: bool) {
        self.fail_embed.store(fail, Ordering::SeqCst);
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    pub fn text_calls(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }

    pub fn structured_calls(&self) -> Vec<&'static str> {
        self.structured_calls.lock().unwrap().clone()
    }

    pub fn peak_embeds(&self) -> usize {
        self.embeds_in_flight.peak.load(Ordering::SeqCst)
    }

    pub fn peak_structured(&self) -> usize {
        self.structured_in_flight.peak.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.embeds_in_flight.enter();
        self.pause().await;
        self.embeds_in_flight.leave();
        if self.fail_embed.load(Ordering::SeqCst) {
            return Err(AgentError::provider("scripted embedding failure").into());
        }
        Ok(bag_of_words(text, self.dimensions))
    }

    async fn generate_text(&self, request: TextRequest) -> anyhow::Result<String> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_text.load(Ordering::SeqCst) {
            return Err(AgentError::provider("scripted failure").into());
        }
        Ok(match &self.text {
            Some(reply) => reply(&request),
            None => format!("answer: {}", request.last_user().unwrap_or_default()),
        })
    }

    async fn generate_structured(&self, request: StructuredRequest) -> anyhow::Result<Value> {
        let name = request.schema.name;
        self.structured_calls.lock().unwrap().push(name);
        self.structured_in_flight.enter();
        self.pause().await;
        self.structured_in_flight.leave();
        match self.structured.get(name) {
            Some(reply) => Ok(reply(&request)),
            None => Err(AgentError::provider(format!("no scripted reply for {}", name)).into()),
        }
    }
}

/// Pulls the text between the first pair of `"""` fences of the last user message.
pub fn fenced(request: &StructuredRequest, nth: usize) -> String {
    let content = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == crate::provider::Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default();
    content
        .split("\"\"\"")
        .nth(nth * 2 + 1)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

pub struct FakeCrawler {
    pub pages: Vec<CrawledPage>,
    pub calls: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeCrawler {
    pub fn new(pages: Vec<(&str, &str)>) -> Self {
        Self {
            pages: pages
                .into_iter()
                .map(|(url, content)| CrawledPage { url: url.to_string(), raw_content: content.to_string() })
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Crawler for FakeCrawler {
    async fn crawl(&self, url: &str, instructions: Option<&str>) -> anyhow::Result<Vec<CrawledPage>> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), instructions.map(str::to_string)));
        Ok(self.pages.clone())
    }
}
