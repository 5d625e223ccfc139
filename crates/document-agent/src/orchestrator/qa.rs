//! Question answering: semantic cache, then retrieval-augmented generation.
use std::sync::Arc;

use tracing::{debug, info};

use crate::documents::{DocumentPipeline, SearchDocumentsTool};
use crate::memory::tools::memory_tools;
use crate::memory::{ConversationMessage, MessageRole, WorkingMemory};
use crate::provider::{ModelTier, PromptMessage, Provider, TextRequest};

pub const NO_RESULTS: &str = "No relevant information found.";

const ANSWER_SYSTEM: &str = "You answer questions using the user's documents. \
Base the answer on the provided documents and the search_documents tool. \
Use the memory tools to recall or store insights that will help with future questions. \
If the documents do not contain the answer, say so.";

pub struct QaPipeline {
    provider: Arc<dyn Provider>,
    working: Arc<WorkingMemory>,
    documents: Arc<DocumentPipeline>,
}

impl QaPipeline {
    pub fn new(provider: Arc<dyn Provider>, working: Arc<WorkingMemory>, documents: Arc<DocumentPipeline>) -> Self {
        Self { provider, working, documents }
    }

    pub async fn answer(
        &self,
        user_id: &str,
        project_id: Option<&str>,
        question: &str,
        history: &[ConversationMessage],
    ) -> anyhow::Result<String> {
        if let Some(cached) = self.working.cached_answer(question).await? {
            info!(user_id, "Answered from semantic memory");
            return Ok(cached);
        }

        let documents = self.documents.retrieve_documents(user_id, project_id, question).await?;
        if documents.is_empty() {
            debug!(user_id, "No documents for question");
            return Ok(NO_RESULTS.to_string());
        }

        let context = documents
            .iter()
            .map(|d| format!("Source: {}\n\"\"\"\n{}\n\"\"\"", d.url, d.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let past = history.iter().map(|m| match m.role {
            MessageRole::User => PromptMessage::user(m.content.clone()),
            MessageRole::Assistant => PromptMessage::assistant(m.content.clone()),
        });

        let request = TextRequest::new(ModelTier::Large)
            .system(ANSWER_SYSTEM)
            .messages(past)
            .user(format!("Documents:\n{}\n\nQuestion:\n\"\"\"\n{}\n\"\"\"", context, question))
            .tool(Arc::new(SearchDocumentsTool::new(self.documents.clone(), user_id, project_id)))
            .tools(memory_tools(self.working.clone(), user_id));

        let answer = self.provider.generate_text(request).await?;
        self.working.add_semantic(question, &answer, Some(user_id)).await?;
        info!(user_id, "Answered from {} documents", documents.len());
        Ok(answer)
    }
}
