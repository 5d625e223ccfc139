// document-agent/src/lib.rs

pub mod config;
pub mod documents;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod projects;
pub mod provider;
pub mod store;
pub mod telemetry;
pub mod utils;

#[cfg(feature = "cli")]
pub mod server;
#[cfg(feature = "cli")]
pub mod shared_state;

#[cfg(test)]
pub(crate) mod testing;

// Public API exports
pub use config::Config;
pub use documents::{Document, DocumentChunk, DocumentPipeline, MarkdownExport, NewDocument, PipelineConfig};
pub use error::AgentError;
pub use memory::{ConversationMemory, Memory, MemoryConfig, WorkingMemory};
pub use orchestrator::{Command, ConnectionRegistry, Orchestrator, ViewEvent, ViewKind};
pub use projects::{Project, ProjectStore};
pub use provider::{Crawler, OpenAiClient, Provider, TavilyCrawler};
pub use store::{SqliteStore, StoreAdapter};

#[cfg(feature = "cli")]
pub use server::run_server;
