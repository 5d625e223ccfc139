//! Durable per-session pointers: who the user is and what they have selected.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::{get_json, StoreAdapter, ROOT};
use crate::utils::next_id;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub user_id: String,
    #[serde(default)]
    pub current_project_id: Option<String>,
    #[serde(default)]
    pub current_conversation_id: Option<String>,
}

impl SessionState {
    fn fresh() -> Self {
        Self { user_id: next_id(), current_project_id: None, current_conversation_id: None }
    }
}

pub struct SessionStore {
    store: Arc<dyn StoreAdapter>,
    prefix: String,
}

impl SessionStore {
    pub fn new(store: Arc<dyn StoreAdapter>, prefix: impl Into<String>) -> Self {
        Self { store, prefix: prefix.into() }
    }

    fn key(&self, session_id: &str) -> String {
        format!("{}{}", self.prefix, session_id)
    }

    pub async fn load(&self, session_id: &str) -> anyhow::Result<Option<SessionState>> {
        get_json(self.store.as_ref(), &self.key(session_id)).await
    }

    /// Loads the session, establishing a new identity for an unknown one.
    pub async fn load_or_create(&self, session_id: &str) -> anyhow::Result<SessionState> {
        if let Some(state) = self.load(session_id).await? {
            return Ok(state);
        }
        let state = SessionState::fresh();
        self.save(session_id, &state).await?;
        info!(user_id = %state.user_id, "Established identity for session {}", session_id);
        Ok(state)
    }

    pub async fn save(&self, session_id: &str, state: &SessionState) -> anyhow::Result<()> {
        self.store.set(&self.key(session_id), ROOT, serde_json::to_value(state)?).await?;
        debug!(user_id = %state.user_id, "Saved session {}", session_id);
        Ok(())
    }

    pub async fn destroy(&self, session_id: &str) -> anyhow::Result<bool> {
        Ok(self.store.del(&[self.key(session_id)]).await? > 0)
    }

    /// Replaces the session's identity with a new user and no selections.
    pub async fn reissue(&self, session_id: &str) -> anyhow::Result<SessionState> {
        self.destroy(session_id).await?;
        self.load_or_create(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_store;

    #[tokio::test]
    async fn test_load_or_create_is_stable() {
        let (_dir, store) = temp_store();
        let sessions = SessionStore::new(store.clone(), "session:");

        let first = sessions.load_or_create("s1").await.unwrap();
        let again = sessions.load_or_create("s1").await.unwrap();
        assert_eq!(first, again);
        assert!(store.exists("session:s1").await.unwrap());
        assert_ne!(sessions.load_or_create("s2").await.unwrap().user_id, first.user_id);
    }

    #[tokio::test]
    async fn test_save_and_reissue() {
        let (_dir, store) = temp_store();
        let sessions = SessionStore::new(store, "session:");
        let mut state = sessions.load_or_create("s1").await.unwrap();
        state.current_project_id = Some("p1".into());
        sessions.save("s1", &state).await.unwrap();
        assert_eq!(sessions.load("s1").await.unwrap(), Some(state.clone()));

        let reissued = sessions.reissue("s1").await.unwrap();
        assert_ne!(reissued.user_id, state.user_id);
        assert!(reissued.current_project_id.is_none());

        assert!(sessions.destroy("s1").await.unwrap());
        assert!(sessions.load("s1").await.unwrap().is_none());
    }
}
