use serde::Deserialize;

/// How a confirmed diff is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmAction {
    ApplyAll,
    Apply,
    Cancel,
}

/// Inbound client command, tagged by `cmd`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all_fields = "camelCase")]
pub enum Command {
    #[serde(rename = "project.new")]
    ProjectNew,
    #[serde(rename = "project.switch")]
    ProjectSwitch { project_id: String },
    #[serde(rename = "project.start")]
    ProjectStart { project_id: String, title: String, prompt: String },
    #[serde(rename = "project.clear")]
    ProjectClear,
    #[serde(rename = "document.open")]
    DocumentOpen {
        document_id: String,
        #[serde(default)]
        editing: bool,
    },
    #[serde(rename = "document.close")]
    DocumentClose {
        document_id: String,
        #[serde(default)]
        editing: bool,
    },
    #[serde(rename = "document.diff")]
    DocumentDiff { document_id: String, content: String },
    #[serde(rename = "document.confirm")]
    DocumentConfirm {
        document_id: String,
        #[serde(default)]
        actions: Vec<String>,
        action: ConfirmAction,
    },
    #[serde(rename = "conversation.message")]
    ConversationMessage { message: String },
    #[serde(rename = "conversation.new")]
    ConversationNew,
    #[serde(rename = "conversation.switch")]
    ConversationSwitch { conversation_id: String },
    #[serde(rename = "conversation.clear")]
    ConversationClear,
    #[serde(rename = "user.new")]
    UserNew,
    #[serde(rename = "user.reset")]
    UserReset,
}

impl Command {
    /// Wire name, used as a metrics label.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ProjectNew => "project.new",
            Command::ProjectSwitch { .. } => "project.switch",
            Command::ProjectStart { .. } => "project.start",
            Command::ProjectClear => "project.clear",
            Command::DocumentOpen { .. } => "document.open",
            Command::DocumentClose { .. } => "document.close",
            Command::DocumentDiff { .. } => "document.diff",
            Command::DocumentConfirm { .. } => "document.confirm",
            Command::ConversationMessage { .. } => "conversation.message",
            Command::ConversationNew => "conversation.new",
            Command::ConversationSwitch { .. } => "conversation.switch",
            Command::ConversationClear => "conversation.clear",
            Command::UserNew => "user.new",
            Command::UserReset => "user.reset",
        }
    }
}
