//! Outbound view updates. Each event is a self-contained renderable fragment.
use serde::Serialize;

use crate::documents::Document;
use crate::memory::{ConversationPreview, MessageRole};
use crate::projects::Project;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Client-facing document with its URL decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentView {
    pub id: String,
    pub project_id: String,
    pub url: String,
    pub content: String,
}

impl From<&Document> for DocumentView {
    fn from(document: &Document) -> Self {
        Self {
            id: document.id.clone(),
            project_id: document.project_id.clone(),
            url: document.url.clone(),
            content: document.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "view", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ViewEvent {
    ProjectList {
        projects: Vec<Project>,
        current_project_id: Option<String>,
    },
    NewProjectForm {
        project: Project,
    },
    EmptyProject {
        project: Project,
    },
    DocumentList {
        project_id: String,
        documents: Vec<DocumentView>,
    },
    Document {
        document: DocumentView,
        selected: bool,
        editing: bool,
    },
    ConfirmGate {
        visible: bool,
        document_id: Option<String>,
        actions: Vec<String>,
    },
    Progress {
        document_id: String,
        completed: usize,
        failed: bool,
    },
    PreferenceSuggestion {
        preferences: String,
    },
    ChatList {
        conversations: Vec<ConversationPreview>,
        current_conversation_id: Option<String>,
    },
    ClearMessages,
    ChatMessage {
        id: String,
        role: MessageRole,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        replace_id: Option<String>,
    },
    Notice {
        level: NoticeLevel,
        message: String,
    },
    SessionReset,
}

impl ViewEvent {
    pub fn notice(level: NoticeLevel, message: impl Into<String>) -> Self {
        ViewEvent::Notice { level, message: message.into() }
    }

    pub fn hidden_gate() -> Self {
        ViewEvent::ConfirmGate { visible: false, document_id: None, actions: Vec::new() }
    }
}
