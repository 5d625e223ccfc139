// document-agent/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::documents::PipelineConfig;
use crate::memory::MemoryConfig;
use crate::provider::ModelSet;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub database_path: PathBuf,
    pub provider_base_url: String,
    pub provider_api_key: String,
    pub large_chat_model: String,
    pub medium_chat_model: String,
    pub small_chat_model: String,
    pub embeddings_model: String,
    pub embeddings_dimensions: usize,
    pub default_ttl: i64,
    pub session_prefix: String,
    pub tavily_api_key: String,
    pub tavily_base_url: String,
    pub crawl_limit: u32,
    pub retrieval_distance_threshold: f32,
    pub semantic_cache_threshold: f32,
    pub chunk_size: usize,
    pub embed_batch_size: usize,
    pub mutate_batch_size: usize,
    pub max_tool_steps: usize,
    pub request_timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let provider_api_key = env::var("PROVIDER_API_KEY")
            .or_else(|_| env::var("OPENAI_API_KEY"))
            .unwrap_or_default();
        if provider_api_key.is_empty() {
            warn!("PROVIDER_API_KEY is not set; provider calls will be rejected upstream");
        }

        Ok(Self {
            api_host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            api_port: env::var("API_PORT")
                .or_else(|_| env::var("PORT"))
                .unwrap_or_else(|_| "8080".into())
                .parse()
                .context("API_PORT must be a port number")?,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./data/agent.db".into())
                .into(),
            provider_base_url: env::var("PROVIDER_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".into()),
            provider_api_key,
            large_chat_model: env::var("LARGE_CHAT_MODEL").unwrap_or_else(|_| "gpt-5".into()),
            medium_chat_model: env::var("MEDIUM_CHAT_MODEL").unwrap_or_else(|_| "gpt-5-mini".into()),
            small_chat_model: env::var("SMALL_CHAT_MODEL").unwrap_or_else(|_| "gpt-5-nano".into()),
            embeddings_model: env::var("EMBEDDINGS_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".into()),
            embeddings_dimensions: env::var("EMBEDDINGS_DIMENSIONS")
                .unwrap_or_else(|_| "1536".into())
                .parse()?,
            default_ttl: env::var("DEFAULT_TTL").unwrap_or_else(|_| "-1".into()).parse()?,
            session_prefix: env::var("SESSION_PREFIX").unwrap_or_else(|_| "session:".into()),
            tavily_api_key: env::var("TAVILY_API_KEY").unwrap_or_default(),
            tavily_base_url: env::var("TAVILY_BASE_URL")
                .unwrap_or_else(|_| "https://api.tavily.com".into()),
            crawl_limit: env::var("CRAWL_LIMIT").unwrap_or_else(|_| "3".into()).parse()?,
            retrieval_distance_threshold: env::var("RETRIEVAL_DISTANCE_THRESHOLD")
                .unwrap_or_else(|_| "0.3".into())
                .parse()?,
            semantic_cache_threshold: env::var("SEMANTIC_CACHE_THRESHOLD")
                .unwrap_or_else(|_| "0.15".into())
                .parse()?,
            chunk_size: env::var("CHUNK_SIZE").unwrap_or_else(|_| "1000".into()).parse()?,
            embed_batch_size: env::var("EMBED_BATCH_SIZE")
                .unwrap_or_else(|_| "10".into())
                .parse()?,
            mutate_batch_size: env::var("MUTATE_BATCH_SIZE")
                .unwrap_or_else(|_| "15".into())
                .parse()?,
            max_tool_steps: env::var("MAX_TOOL_STEPS").unwrap_or_else(|_| "10".into()).parse()?,
            request_timeout_seconds: env::var("REQUEST_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "600".into())
                .parse()?,
        })
    }

    pub fn models(&self) -> ModelSet {
        ModelSet {
            large: self.large_chat_model.clone(),
            medium: self.medium_chat_model.clone(),
            small: self.small_chat_model.clone(),
            embeddings: self.embeddings_model.clone(),
            dimensions: self.embeddings_dimensions,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            chunk_size: self.chunk_size,
            embed_batch_size: self.embed_batch_size.max(1),
            mutate_batch_size: self.mutate_batch_size.max(1),
            distance_threshold: self.retrieval_distance_threshold,
            embedding_dimensions: self.embeddings_dimensions,
            ..PipelineConfig::default()
        }
    }

    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            ttl_seconds: self.default_ttl,
            embedding_dimensions: self.embeddings_dimensions,
            semantic_cache_threshold: self.semantic_cache_threshold,
            ..MemoryConfig::default()
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Database: {}", self.database_path.display());
        info!("- Provider: {} (key {})", self.provider_base_url, mask(&self.provider_api_key));
        info!(
            "- Models: large={} medium={} small={}",
            self.large_chat_model, self.medium_chat_model, self.small_chat_model
        );
        info!("- Embeddings: {} ({} dims)", self.embeddings_model, self.embeddings_dimensions);
        info!("- Crawler: {} (key {}, limit {})", self.tavily_base_url, mask(&self.tavily_api_key), self.crawl_limit);
        info!("- Default TTL: {}s", self.default_ttl);
        info!("- Session Prefix: {}", self.session_prefix);
        info!(
            "- Retrieval: distance < {}, semantic cache < {}",
            self.retrieval_distance_threshold, self.semantic_cache_threshold
        );
        info!(
            "- Batches: chunk {} chars, embed {}, mutate {}",
            self.chunk_size, self.embed_batch_size, self.mutate_batch_size
        );
        info!("- Tool Steps: {}", self.max_tool_steps);
        info!("- Request Timeout: {}s", self.request_timeout_seconds);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid API address {}:{}", self.api_host, self.api_port))
    }
}

fn mask(secret: &str) -> &'static str {
    if secret.is_empty() {
        "unset"
    } else {
        "set"
    }
}
