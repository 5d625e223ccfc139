//! Projects group a user's crawled documents under one prompt.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::{is_not_found, AgentError};
use crate::store::{delete_all_matching, get_json, IndexDefinition, SearchQuery, StoreAdapter, MAX_PAGE, ROOT};
use crate::utils::{next_id, now_millis};

const PROJECT_INDEX: &str = "idx-projects";
const PROJECT_PREFIX: &str = "projects:";
const DEFAULT_TITLE: &str = "New project";
const LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub project_id: String,
    pub user_id: String,
    pub title: String,
    pub prompt: String,
    pub created_at: i64,
}

fn project_key(project_id: &str) -> String {
    format!("{}{}", PROJECT_PREFIX, project_id)
}

pub struct ProjectStore {
    store: Arc<dyn StoreAdapter>,
    index: OnceCell<()>,
}

impl ProjectStore {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self { store, index: OnceCell::new() }
    }

    async fn ensure_index(&self) -> anyhow::Result<()> {
        self.index
            .get_or_try_init(|| async {
                self.store
                    .create_index(
                        &IndexDefinition::new(PROJECT_INDEX, PROJECT_PREFIX)
                            .tag("projectId")
                            .tag("userId")
                            .text("title")
                            .numeric("createdAt"),
                    )
                    .await
            })
            .await?;
        Ok(())
    }

    pub async fn create(&self, user_id: &str) -> anyhow::Result<Project> {
        self.ensure_index().await?;
        let project = Project {
            project_id: next_id(),
            user_id: user_id.to_string(),
            title: DEFAULT_TITLE.to_string(),
            prompt: String::new(),
            created_at: now_millis(),
        };
        self.store
            .set(&project_key(&project.project_id), ROOT, serde_json::to_value(&project)?)
            .await?;
        info!(user_id, "Created project {}", project.project_id);
        Ok(project)
    }

    /// Reads a project; another user's project reads as absent.
    pub async fn read(&self, user_id: &str, project_id: &str) -> anyhow::Result<Option<Project>> {
        let project: Option<Project> = get_json(self.store.as_ref(), &project_key(project_id)).await?;
        Ok(project.filter(|p| p.user_id == user_id))
    }

    pub async fn update(&self, user_id: &str, project_id: &str, title: &str, prompt: &str) -> anyhow::Result<Project> {
        let mut project = self
            .read(user_id, project_id)
            .await?
            .ok_or_else(|| AgentError::not_found("project", project_id))?;

        let key = project_key(project_id);
        for (path, value) in [("$.title", title), ("$.prompt", prompt)] {
            match self.store.set(&key, path, json!(value)).await {
                Err(e) if is_not_found(&e) => return Err(AgentError::not_found("project", project_id).into()),
                other => other?,
            }
        }
        project.title = title.to_string();
        project.prompt = prompt.to_string();
        Ok(project)
    }

    /// The user's projects, newest first.
    pub async fn all(&self, user_id: &str) -> anyhow::Result<Vec<Project>> {
        self.ensure_index().await?;
        let query = SearchQuery::all()
            .tag("userId", user_id)
            .sort_by("createdAt", true)
            .page(0, LIST_LIMIT);
        Ok(self.store.search(PROJECT_INDEX, &query).await?.parse_all())
    }

    pub async fn remove_all_for_user(&self, user_id: &str) -> anyhow::Result<usize> {
        self.ensure_index().await?;
        let removed = delete_all_matching(
            self.store.as_ref(),
            PROJECT_INDEX,
            SearchQuery::all().tag("userId", user_id).returning(&["userId"]),
            MAX_PAGE,
            50,
        )
        .await?;
        info!(user_id, "Removed {} projects", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_store;

    #[tokio::test]
    async fn test_create_read_update() {
        let (_dir, store) = temp_store();
        let projects = ProjectStore::new(store);

        let created = projects.create("u1").await.unwrap();
        assert_eq!(created.title, DEFAULT_TITLE);
        assert!(created.prompt.is_empty());

        let updated = projects
            .update("u1", &created.project_id, "Docs", "crawl https://a.io")
            .await
            .unwrap();
        assert_eq!(projects.read("u1", &created.project_id).await.unwrap(), Some(updated.clone()));
        assert_eq!(updated.prompt, "crawl https://a.io");
        assert!(projects.read("u2", &created.project_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_project() {
        let (_dir, store) = temp_store();
        let projects = ProjectStore::new(store);
        let err = projects.update("u1", "nope", "t", "p").await.unwrap_err();
        assert!(is_not_found(&err));
    }

    #[tokio::test]
    async fn test_all_and_remove() {
        let (_dir, store) = temp_store();
        let projects = ProjectStore::new(store);
        let first = projects.create("u1").await.unwrap();
        let second = projects.create("u1").await.unwrap();
        projects.create("u2").await.unwrap();

        let ids: Vec<String> = projects.all("u1").await.unwrap().into_iter().map(|p| p.project_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.project_id) && ids.contains(&second.project_id));

        assert_eq!(projects.remove_all_for_user("u1").await.unwrap(), 2);
        assert!(projects.all("u1").await.unwrap().is_empty());
        assert_eq!(projects.all("u2").await.unwrap().len(), 1);
    }
}
