//! Per-connection command state machine over the memory and document layers.
//!
//! State lives in two session pointers (current project, current conversation).
//! Every command loads them, runs to completion, and persists them if changed.
pub mod command;
pub mod connection;
pub mod parser;
pub mod qa;
pub mod session;
pub mod view;

pub use command::{Command, ConfirmAction};
pub use connection::{Connection, ConnectionRegistry, EventSink, ViewKind};
pub use session::{SessionState, SessionStore};
pub use view::{DocumentView, NoticeLevel, ViewEvent};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::documents::{Document, DocumentPipeline, MarkdownExport, MutateProgress, NewDocument, PipelineConfig};
use crate::error::AgentError;
use crate::memory::{ConversationHandle, Memory, MemoryConfig, MessageRole};
use crate::metrics;
use crate::projects::ProjectStore;
use crate::provider::{Crawler, OpenAiClient, Provider, TavilyCrawler};
use crate::store::{SqliteStore, StoreAdapter};
use crate::utils::next_id;
use qa::QaPipeline;

pub const PLACEHOLDER: &str = "…";
pub const ANSWER_FAILED: &str = "An error occurred while processing your message.";
const HISTORY_LIMIT: usize = 20;

pub struct Orchestrator {
    provider: Arc<dyn Provider>,
    crawler: Arc<dyn Crawler>,
    memory: Memory,
    documents: Arc<DocumentPipeline>,
    projects: ProjectStore,
    sessions: SessionStore,
    qa: QaPipeline,
    registry: Arc<ConnectionRegistry>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        provider: Arc<dyn Provider>,
        crawler: Arc<dyn Crawler>,
        registry: Arc<ConnectionRegistry>,
        pipeline_config: PipelineConfig,
        memory_config: MemoryConfig,
        session_prefix: &str,
    ) -> Self {
        let memory = Memory::new(store.clone(), provider.clone(), memory_config);
        let documents = Arc::new(DocumentPipeline::new(store.clone(), provider.clone(), pipeline_config));
        let qa = QaPipeline::new(provider.clone(), memory.working.clone(), documents.clone());
        Self {
            projects: ProjectStore::new(store.clone()),
            sessions: SessionStore::new(store, session_prefix),
            provider,
            crawler,
            memory,
            documents,
            qa,
            registry,
        }
    }

    /// Wires the SQLite store and the HTTP provider and crawler from configuration.
    pub fn from_config(config: &Config, registry: Arc<ConnectionRegistry>) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_seconds);
        let store = Arc::new(SqliteStore::open(&config.database_path)?);
        let provider = Arc::new(
            OpenAiClient::new(&config.provider_base_url, &config.provider_api_key, config.models(), timeout)
                .with_max_tool_steps(config.max_tool_steps),
        );
        let crawler = Arc::new(TavilyCrawler::new(
            &config.tavily_base_url,
            &config.tavily_api_key,
            config.crawl_limit,
            timeout,
        ));
        Ok(Self::new(
            store,
            provider,
            crawler,
            registry,
            config.pipeline_config(),
            config.memory_config(),
            &config.session_prefix,
        ))
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Renders the initial view of a fresh connection.
    pub async fn initialize(&self, conn: &Connection) {
        let rendered = async {
            let mut state = self.sessions.load_or_create(&conn.session_id).await?;
            let before = state.clone();
            let result = self.render_initial(conn, &mut state).await;
            self.persist_if_changed(conn, &before, &state).await?;
            result
        }
        .await;
        if let Err(e) = rendered {
            error!("Failed to initialize connection {}: {:#}", conn.id, e);
            conn.emit(ViewEvent::notice(NoticeLevel::Error, "Could not load your session."));
        }
    }

    /// Markdown download of one of the session user's documents.
    pub async fn export_document(&self, session_id: &str, document_id: &str) -> anyhow::Result<MarkdownExport> {
        let state = self
            .sessions
            .load(session_id)
            .await?
            .ok_or_else(|| AgentError::not_found("session", session_id))?;
        self.documents.export_markdown(&state.user_id, document_id).await
    }

    /// Parses and handles one inbound frame. Malformed frames are reported, never fatal.
    pub async fn handle_frame(&self, conn: &Connection, frame: &str) {
        match serde_json::from_str::<Command>(frame) {
            Ok(command) => self.handle(conn, command).await,
            Err(e) => {
                warn!("Rejected frame on connection {}: {}", conn.id, e);
                metrics::inc_command("unknown", "validation_mismatch");
                conn.emit(ViewEvent::notice(NoticeLevel::Error, "Unrecognized command."));
            }
        }
    }

    /// Runs one command; failures are classified and reported, never propagated.
    pub async fn handle(&self, conn: &Connection, command: Command) {
        let name = command.name();
        debug!("Handling {} on connection {}", name, conn.id);

        let outcome = self.run(conn, command).await;
        let status = match outcome {
            Ok(()) => "ok",
            Err(e) => {
                let classified = AgentError::classify(&e);
                match classified {
                    Some(AgentError::NotFound { kind, id }) => {
                        warn!("{} failed: {} {} not found", name, kind, id);
                        conn.emit(ViewEvent::notice(NoticeLevel::Warning, format!("That {} no longer exists.", kind)));
                    }
                    Some(AgentError::ValidationMismatch { expected, actual }) => {
                        warn!("{} rejected: expected {}, got {}", name, expected, actual);
                    }
                    _ => {
                        error!("{} failed: {:#}", name, e);
                        conn.emit(ViewEvent::notice(NoticeLevel::Error, "Something went wrong. Please try again."));
                    }
                }
                classified.map(AgentError::label).unwrap_or("error")
            }
        };
        metrics::inc_command(name, status);
    }

    /// Loads the session pointers, dispatches, and persists the pointers if they changed.
    async fn run(&self, conn: &Connection, command: Command) -> anyhow::Result<()> {
        let mut state = self.sessions.load_or_create(&conn.session_id).await?;
        let before = state.clone();
        let result = self.dispatch(conn, &mut state, command).await;
        self.persist_if_changed(conn, &before, &state).await?;
        result
    }

    async fn persist_if_changed(
        &self,
        conn: &Connection,
        before: &SessionState,
        state: &SessionState,
    ) -> anyhow::Result<()> {
        if state != before {
            self.sessions.save(&conn.session_id, state).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, conn: &Connection, state: &mut SessionState, command: Command) -> anyhow::Result<()> {
        match command {
            Command::ProjectNew => self.project_new(conn, state).await,
            Command::ProjectSwitch { project_id } => self.project_switch(conn, state, &project_id).await,
            Command::ProjectStart { project_id, title, prompt } => {
                self.project_start(conn, state, &project_id, &title, &prompt).await
            }
            Command::ProjectClear => self.project_clear(conn, state).await,
            Command::DocumentOpen { document_id, editing } => {
                self.document_select(conn, state, &document_id, true, editing).await
            }
            Command::DocumentClose { document_id, editing } => {
                self.document_select(conn, state, &document_id, false, editing).await
            }
            Command::DocumentDiff { document_id, content } => {
                self.document_diff(conn, state, &document_id, &content).await
            }
            Command::DocumentConfirm { document_id, actions, action } => {
                self.document_confirm(conn, state, &document_id, actions, action).await
            }
            Command::ConversationMessage { message } => self.conversation_message(conn, state, &message).await,
            Command::ConversationNew => self.conversation_new(conn, state).await,
            Command::ConversationSwitch { conversation_id } => {
                self.conversation_switch(conn, state, &conversation_id).await
            }
            Command::ConversationClear => self.conversation_clear(conn, state).await,
            Command::UserNew => self.reissue_identity(conn, state).await,
            Command::UserReset => self.user_reset(conn, state).await,
        }
    }

    async fn render_initial(&self, conn: &Connection, state: &mut SessionState) -> anyhow::Result<()> {
        match conn.view {
            ViewKind::Projects => {
                let current = match &state.current_project_id {
                    Some(id) => self.projects.read(&state.user_id, id).await?,
                    None => None,
                };
                if current.is_none() {
                    state.current_project_id = None;
                }
                self.render_project_list(conn, state).await?;
                if let Some(project) = current {
                    self.render_project(conn, &state.user_id, project).await?;
                }
            }
            ViewKind::Chat => {
                if let Some(id) = state.current_conversation_id.clone() {
                    if !self.memory.conversations.exists(&state.user_id, &id).await? {
                        state.current_conversation_id = None;
                    }
                }
                self.render_chat_list(conn, state).await?;
                if let Some(id) = &state.current_conversation_id {
                    let handle = self.memory.conversations.resolve(&state.user_id, Some(id)).await?;
                    self.render_messages(conn, &handle).await?;
                }
            }
        }
        Ok(())
    }

    async fn render_project_list(&self, conn: &Connection, state: &SessionState) -> anyhow::Result<()> {
        conn.emit(ViewEvent::ProjectList {
            projects: self.projects.all(&state.user_id).await?,
            current_project_id: state.current_project_id.clone(),
        });
        Ok(())
    }

    async fn render_project(
        &self,
        conn: &Connection,
        user_id: &str,
        project: crate::projects::Project,
    ) -> anyhow::Result<()> {
        let documents = self.documents.all(user_id, Some(&project.project_id)).await?;
        if documents.is_empty() {
            conn.emit(ViewEvent::EmptyProject { project });
        } else {
            conn.emit(document_list(&project.project_id, &documents));
        }
        Ok(())
    }

    async fn project_new(&self, conn: &Connection, state: &mut SessionState) -> anyhow::Result<()> {
        let project = self.projects.create(&state.user_id).await?;
        state.current_project_id = Some(project.project_id.clone());
        self.render_project_list(conn, state).await?;
        conn.emit(ViewEvent::NewProjectForm { project });
        Ok(())
    }

    async fn project_switch(&self, conn: &Connection, state: &mut SessionState, project_id: &str) -> anyhow::Result<()> {
        if state.current_project_id.as_deref() == Some(project_id) {
            debug!(user_id = %state.user_id, "Project {} already selected", project_id);
            return Ok(());
        }
        let project = self
            .projects
            .read(&state.user_id, project_id)
            .await?
            .ok_or_else(|| AgentError::not_found("project", project_id))?;

        state.current_project_id = Some(project.project_id.clone());
        info!(user_id = %state.user_id, "Switched to project {}", project_id);
        self.render_project_list(conn, state).await?;
        self.render_project(conn, &state.user_id, project).await
    }

    async fn project_start(
        &self,
        conn: &Connection,
        state: &mut SessionState,
        project_id: &str,
        title: &str,
        prompt: &str,
    ) -> anyhow::Result<()> {
        if state.current_project_id.as_deref() != Some(project_id) {
            return Err(AgentError::ValidationMismatch {
                expected: format!("project {}", state.current_project_id.as_deref().unwrap_or("<none>")),
                actual: format!("project {}", project_id),
            }
            .into());
        }
        let user_id = state.user_id.clone();
        self.projects.update(&user_id, project_id, title, prompt).await?;

        if let Err(e) = self.populate_project(&user_id, project_id, prompt).await {
            error!(user_id = %user_id, "Populating project {} failed: {:#}", project_id, e);
            conn.emit(ViewEvent::notice(NoticeLevel::Warning, e.to_string()));
        }

        let documents = self.documents.all(&user_id, Some(project_id)).await?;
        conn.emit(document_list(project_id, &documents));
        self.render_project_list(conn, state).await?;

        match self.memory.preferences.find(&user_id).await {
            Ok(Some(preferences)) => conn.emit(ViewEvent::PreferenceSuggestion { preferences: preferences.answer }),
            Ok(None) => {}
            Err(e) => warn!(user_id = %user_id, "Preference lookup failed: {:#}", e),
        }
        Ok(())
    }

    /// Parses the prompt and ingests whatever it asks to crawl. The error text is client-facing.
    async fn populate_project(&self, user_id: &str, project_id: &str, prompt: &str) -> anyhow::Result<()> {
        let parsed = parser::parse_project_prompt(self.provider.as_ref(), prompt)
            .await
            .context("Could not read the project prompt.")?;
        let Some(url) = parsed.url else {
            return Ok(());
        };
        let pages = self
            .crawler
            .crawl(&url, parsed.instructions.as_deref())
            .await
            .with_context(|| format!("Could not crawl {}.", url))?;
        let inputs = pages
            .into_iter()
            .map(|page| NewDocument::new(page.url, page.raw_content))
            .collect();
        self.documents
            .ingest(user_id, project_id, inputs)
            .await
            .with_context(|| format!("Could not index the pages of {}.", url))?;
        Ok(())
    }

    async fn project_clear(&self, conn: &Connection, state: &mut SessionState) -> anyhow::Result<()> {
        let removed = self.documents.remove_all_for_user(&state.user_id).await?;
        self.projects.remove_all_for_user(&state.user_id).await?;
        state.current_project_id = None;
        info!(user_id = %state.user_id, "Cleared projects ({} documents)", removed);
        self.render_project_list(conn, state).await?;
        conn.emit(ViewEvent::notice(NoticeLevel::Info, "All projects were removed."));
        Ok(())
    }

    async fn owned_document(&self, state: &SessionState, document_id: &str) -> anyhow::Result<Option<Document>> {
        Ok(self
            .documents
            .read(document_id)
            .await?
            .filter(|d| d.user_id == state.user_id))
    }

    async fn document_select(
        &self,
        conn: &Connection,
        state: &mut SessionState,
        document_id: &str,
        selected: bool,
        editing: bool,
    ) -> anyhow::Result<()> {
        match self.owned_document(state, document_id).await? {
            Some(document) => {
                conn.emit(ViewEvent::Document { document: DocumentView::from(&document), selected, editing });
            }
            None => warn!(user_id = %state.user_id, "Document {} not found, ignoring", document_id),
        }
        Ok(())
    }

    async fn document_diff(
        &self,
        conn: &Connection,
        state: &mut SessionState,
        document_id: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        let document = self
            .owned_document(state, document_id)
            .await?
            .ok_or_else(|| AgentError::not_found("document", document_id))?;
        let actions = self.documents.diff(&document.content, content).await?;
        debug!(user_id = %state.user_id, "Diff of {} produced {} actions", document_id, actions.len());
        conn.emit(ViewEvent::ConfirmGate { visible: true, document_id: Some(document.id), actions });
        Ok(())
    }

    async fn document_confirm(
        &self,
        conn: &Connection,
        state: &mut SessionState,
        document_id: &str,
        actions: Vec<String>,
        action: ConfirmAction,
    ) -> anyhow::Result<()> {
        let document = self
            .owned_document(state, document_id)
            .await?
            .ok_or_else(|| AgentError::not_found("document", document_id))?;
        conn.emit(ViewEvent::hidden_gate());

        if action == ConfirmAction::Cancel || actions.is_empty() {
            conn.emit(ViewEvent::Document { document: DocumentView::from(&document), selected: false, editing: false });
            return Ok(());
        }

        let user_id = state.user_id.clone();
        self.memory.preferences.merge(&user_id, &actions).await?;
        let instruction = actions.join("\n");

        match action {
            ConfirmAction::Apply => {
                let updated = self.documents.mutate(&document, &instruction).await?;
                conn.emit(ViewEvent::Document { document: DocumentView::from(&updated), selected: true, editing: false });
            }
            ConfirmAction::ApplyAll => {
                let completed = AtomicUsize::new(0);
                let report = self
                    .documents
                    .bulk_mutate(
                        |progress| {
                            let completed = completed.fetch_add(1, Ordering::SeqCst) + 1;
                            match progress {
                                MutateProgress::Updated(updated) => {
                                    conn.emit(ViewEvent::Progress {
                                        document_id: updated.id.clone(),
                                        completed,
                                        failed: false,
                                    });
                                    conn.emit(ViewEvent::Document {
                                        document: DocumentView::from(updated),
                                        selected: updated.id == document.id,
                                        editing: false,
                                    });
                                }
                                MutateProgress::Failed { document, .. } => {
                                    conn.emit(ViewEvent::Progress {
                                        document_id: document.id.clone(),
                                        completed,
                                        failed: true,
                                    });
                                }
                            }
                        },
                        &user_id,
                        &document.project_id,
                        &instruction,
                    )
                    .await?;

                let summary = if report.failed.is_empty() {
                    format!("Updated {} documents.", report.updated.len())
                } else {
                    format!("Updated {} documents, {} failed.", report.updated.len(), report.failed.len())
                };
                conn.emit(ViewEvent::notice(NoticeLevel::Info, summary));
            }
            ConfirmAction::Cancel => {}
        }
        Ok(())
    }

    async fn conversation_message(&self, conn: &Connection, state: &mut SessionState, text: &str) -> anyhow::Result<()> {
        let conversations = &self.memory.conversations;
        let handle = conversations
            .resolve(&state.user_id, state.current_conversation_id.as_deref())
            .await?;
        if state.current_conversation_id.as_deref() != Some(handle.conversation_id.as_str()) {
            state.current_conversation_id = Some(handle.conversation_id.clone());
            self.render_chat_list(conn, state).await?;
        }

        let mut history = conversations.messages(&handle).await?;
        let skip = history.len().saturating_sub(HISTORY_LIMIT);
        history.drain(..skip);

        let asked = conversations.push(&handle, MessageRole::User, text).await?;
        conn.emit(ViewEvent::ChatMessage { id: asked.id, role: MessageRole::User, content: asked.content, replace_id: None });

        let pending_id = format!("bot-{}", next_id());
        conn.emit(ViewEvent::ChatMessage {
            id: pending_id.clone(),
            role: MessageRole::Assistant,
            content: PLACEHOLDER.to_string(),
            replace_id: None,
        });

        let answered = async {
            let answer = self
                .qa
                .answer(&state.user_id, state.current_project_id.as_deref(), text, &history)
                .await?;
            conversations.push(&handle, MessageRole::Assistant, &answer).await
        }
        .await;

        match answered {
            Ok(message) => conn.emit(ViewEvent::ChatMessage {
                id: message.id,
                role: MessageRole::Assistant,
                content: message.content,
                replace_id: Some(pending_id),
            }),
            Err(e) => {
                error!(user_id = %state.user_id, "Answering failed: {:#}", e);
                conn.emit(ViewEvent::ChatMessage {
                    id: format!("bot-{}", next_id()),
                    role: MessageRole::Assistant,
                    content: ANSWER_FAILED.to_string(),
                    replace_id: Some(pending_id),
                });
            }
        }
        Ok(())
    }

    async fn render_chat_list(&self, conn: &Connection, state: &SessionState) -> anyhow::Result<()> {
        conn.emit(ViewEvent::ChatList {
            conversations: self.memory.conversations.all_conversations(&state.user_id).await?,
            current_conversation_id: state.current_conversation_id.clone(),
        });
        Ok(())
    }

    async fn render_messages(&self, conn: &Connection, handle: &ConversationHandle) -> anyhow::Result<()> {
        conn.emit(ViewEvent::ClearMessages);
        for message in self.memory.conversations.messages(handle).await? {
            conn.emit(ViewEvent::ChatMessage { id: message.id, role: message.role, content: message.content, replace_id: None });
        }
        Ok(())
    }

    async fn conversation_new(&self, conn: &Connection, state: &mut SessionState) -> anyhow::Result<()> {
        let handle = self.memory.conversations.resolve(&state.user_id, None).await?;
        state.current_conversation_id = Some(handle.conversation_id.clone());
        self.render_chat_list(conn, state).await?;
        self.render_messages(conn, &handle).await
    }

    async fn conversation_switch(
        &self,
        conn: &Connection,
        state: &mut SessionState,
        conversation_id: &str,
    ) -> anyhow::Result<()> {
        if !self.memory.conversations.exists(&state.user_id, conversation_id).await? {
            return Err(AgentError::not_found("conversation", conversation_id).into());
        }
        let handle = self.memory.conversations.resolve(&state.user_id, Some(conversation_id)).await?;
        state.current_conversation_id = Some(handle.conversation_id.clone());
        self.render_chat_list(conn, state).await?;
        self.render_messages(conn, &handle).await
    }

    async fn conversation_clear(&self, conn: &Connection, state: &mut SessionState) -> anyhow::Result<()> {
        let Some(id) = state.current_conversation_id.clone() else {
            conn.emit(ViewEvent::ClearMessages);
            return Ok(());
        };
        let handle = self.memory.conversations.resolve(&state.user_id, Some(&id)).await?;
        if handle.conversation_id != id {
            state.current_conversation_id = Some(handle.conversation_id.clone());
        } else {
            self.memory.conversations.clear(&handle).await?;
        }
        self.render_chat_list(conn, state).await?;
        conn.emit(ViewEvent::ClearMessages);
        Ok(())
    }

    async fn reissue_identity(&self, conn: &Connection, state: &mut SessionState) -> anyhow::Result<()> {
        let previous = state.user_id.clone();
        *state = self.sessions.reissue(&conn.session_id).await?;
        info!(user_id = %state.user_id, "Session {} moved off user {}", conn.session_id, previous);
        self.registry.send_to(&conn.session_id, &ViewEvent::SessionReset, Some(conn.id));
        conn.emit(ViewEvent::SessionReset);
        Ok(())
    }

    async fn user_reset(&self, conn: &Connection, state: &mut SessionState) -> anyhow::Result<()> {
        let user_id = state.user_id.clone();
        self.memory.wipe_all(&user_id).await?;
        self.documents.remove_all_for_user(&user_id).await?;
        self.projects.remove_all_for_user(&user_id).await?;
        info!(user_id = %user_id, "Wiped all user data");
        self.reissue_identity(conn, state).await
    }
}

fn document_list(project_id: &str, documents: &[Document]) -> ViewEvent {
    ViewEvent::DocumentList {
        project_id: project_id.to_string(),
        documents: documents.iter().map(DocumentView::from).collect(),
    }
}
