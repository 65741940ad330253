//! In-process store used by tests and local development.
//!
//! Semantics mirror [`super::PgStore`]: the conditional advance is atomic
//! (one lock guards all maps) and `updated_at` strictly increases on every
//! mutation even when the wall clock does not.

use super::{AdvanceOutcome, Store};
use crate::models::{
    AgentLog, AgentName, Dataset, LogLevel, Message, MessageRole, Metadata, NewDataset,
    NewProject, NewTrainedModel, Project, ProjectStatus, TrainedModel, User,
};
use crate::{ForgeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    users_by_external_id: HashMap<String, Uuid>,
    projects: HashMap<Uuid, Project>,
    datasets: HashMap<Uuid, Dataset>,
    models: HashMap<Uuid, TrainedModel>,
    logs: Vec<AgentLog>,
    messages: Vec<Message>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

/// Strictly-after timestamp: the wall clock, unless the row was already
/// stamped at or past it.
fn bump(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > prev {
        now
    } else {
        prev + ChronoDuration::microseconds(1)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_user(&self, external_auth_id: &str, email: Option<&str>) -> Result<User> {
        let mut inner = self.inner.write().await;
        if let Some(id) = inner.users_by_external_id.get(external_auth_id).copied() {
            let user = inner
                .users
                .get_mut(&id)
                .ok_or_else(|| ForgeError::NotFound(format!("user {id}")))?;
            if let Some(email) = email {
                user.email = Some(email.to_string());
            }
            return Ok(user.clone());
        }
        let user = User {
            id: Uuid::new_v4(),
            external_auth_id: external_auth_id.to_string(),
            email: email.map(str::to_owned),
            is_admin: false,
            created_at: Utc::now(),
        };
        inner
            .users_by_external_id
            .insert(external_auth_id.to_string(), user.id);
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user_by_external_id(&self, external_auth_id: &str) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users_by_external_id
            .get(external_auth_id)
            .and_then(|id| inner.users.get(id))
            .cloned())
    }

    async fn insert_project(&self, new: NewProject) -> Result<Project> {
        let mut inner = self.inner.write().await;
        if inner.projects.contains_key(&new.id) {
            return Err(ForgeError::Conflict(format!(
                "project {} already exists",
                new.id
            )));
        }
        let now = Utc::now();
        let project = Project {
            id: new.id,
            user_id: new.user_id,
            name: new.name,
            task_type: new.task_type,
            framework: new.framework,
            dataset_source: new.dataset_source,
            search_keywords: new.search_keywords,
            status: new.status,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        inner.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        Ok(self.inner.read().await.projects.get(&id).cloned())
    }

    async fn get_projects_by_status(
        &self,
        status: ProjectStatus,
        limit: u32,
    ) -> Result<Vec<Project>> {
        let inner = self.inner.read().await;
        let mut projects: Vec<Project> = inner
            .projects
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        projects.sort_by_key(|p| p.updated_at);
        projects.truncate(limit as usize);
        Ok(projects)
    }

    async fn get_projects_by_user(&self, user_id: Uuid) -> Result<Vec<Project>> {
        let inner = self.inner.read().await;
        let mut projects: Vec<Project> = inner
            .projects
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    async fn update_project_metadata(&self, project_id: Uuid, patch: Metadata) -> Result<()> {
        let mut inner = self.inner.write().await;
        let project = inner
            .projects
            .get_mut(&project_id)
            .ok_or_else(|| ForgeError::NotFound(format!("project {project_id}")))?;
        for (k, v) in patch {
            project.metadata.insert(k, v);
        }
        project.updated_at = bump(project.updated_at);
        Ok(())
    }

    async fn advance_status(
        &self,
        project_id: Uuid,
        from: ProjectStatus,
        to: ProjectStatus,
        metadata_patch: Metadata,
    ) -> Result<AdvanceOutcome> {
        if !from.can_advance_to(to) {
            return Err(ForgeError::Conflict(format!(
                "illegal status transition {from} -> {to}"
            )));
        }
        let mut inner = self.inner.write().await;
        let Some(project) = inner.projects.get_mut(&project_id) else {
            return Ok(AdvanceOutcome::NoSuchProject);
        };
        if project.status != from {
            return Ok(AdvanceOutcome::NotClaimed);
        }
        project.status = to;
        for (k, v) in metadata_patch {
            project.metadata.insert(k, v);
        }
        project.updated_at = bump(project.updated_at);
        Ok(AdvanceOutcome::Claimed)
    }

    async fn insert_dataset(&self, new: NewDataset) -> Result<Dataset> {
        let mut inner = self.inner.write().await;
        if inner.datasets.contains_key(&new.project_id) {
            return Err(ForgeError::Conflict(format!(
                "dataset for project {} already exists",
                new.project_id
            )));
        }
        let dataset = Dataset {
            id: Uuid::new_v4(),
            project_id: new.project_id,
            name: new.name,
            object_uri: new.object_uri,
            size: new.size,
            source: new.source,
            created_at: Utc::now(),
        };
        inner.datasets.insert(new.project_id, dataset.clone());
        Ok(dataset)
    }

    async fn get_dataset_by_project(&self, project_id: Uuid) -> Result<Option<Dataset>> {
        Ok(self.inner.read().await.datasets.get(&project_id).cloned())
    }

    async fn insert_model(&self, new: NewTrainedModel) -> Result<TrainedModel> {
        let mut inner = self.inner.write().await;
        if inner.models.contains_key(&new.project_id) {
            return Err(ForgeError::Conflict(format!(
                "model for project {} already exists",
                new.project_id
            )));
        }
        let model = TrainedModel {
            id: Uuid::new_v4(),
            project_id: new.project_id,
            name: new.name,
            framework: new.framework,
            object_uri: new.object_uri,
            accuracy: None,
            metadata: new.metadata,
            created_at: Utc::now(),
        };
        inner.models.insert(new.project_id, model.clone());
        Ok(model)
    }

    async fn get_model_by_project(&self, project_id: Uuid) -> Result<Option<TrainedModel>> {
        Ok(self.inner.read().await.models.get(&project_id).cloned())
    }

    async fn update_model_evaluation(
        &self,
        model_id: Uuid,
        accuracy: f64,
        metadata_patch: Metadata,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let model = inner
            .models
            .values_mut()
            .find(|m| m.id == model_id)
            .ok_or_else(|| ForgeError::NotFound(format!("model {model_id}")))?;
        model.accuracy = Some(accuracy);
        for (k, v) in metadata_patch {
            model.metadata.insert(k, v);
        }
        Ok(())
    }

    async fn append_log(
        &self,
        project_id: Option<Uuid>,
        agent: AgentName,
        level: LogLevel,
        message: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.logs.push(AgentLog {
            id: Uuid::new_v4(),
            project_id,
            agent_name: agent,
            message: message.to_string(),
            log_level: level,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn get_logs_by_project(&self, project_id: Uuid, limit: u32) -> Result<Vec<AgentLog>> {
        let inner = self.inner.read().await;
        let mut logs: Vec<AgentLog> = inner
            .logs
            .iter()
            .filter(|l| l.project_id == Some(project_id))
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.created_at);
        if logs.len() > limit as usize {
            let skip = logs.len() - limit as usize;
            logs.drain(..skip);
        }
        Ok(logs)
    }

    async fn write_message(
        &self,
        user_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        let mut inner = self.inner.write().await;
        let message = Message {
            id: Uuid::new_v4(),
            user_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn get_messages_by_user(&self, user_id: Uuid, limit: u32) -> Result<Vec<Message>> {
        let inner = self.inner.read().await;
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        if messages.len() > limit as usize {
            let skip = messages.len() - limit as usize;
            messages.drain(..skip);
        }
        Ok(messages)
    }

    async fn count_projects_by_status(&self) -> Result<HashMap<ProjectStatus, u64>> {
        let inner = self.inner.read().await;
        let mut counts = HashMap::new();
        for project in inner.projects.values() {
            *counts.entry(project.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn list_users(&self, limit: u32) -> Result<Vec<User>> {
        let inner = self.inner.read().await;
        let mut users: Vec<User> = inner.users.values().cloned().collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        users.truncate(limit as usize);
        Ok(users)
    }

    async fn list_projects(&self, limit: u32) -> Result<Vec<Project>> {
        let inner = self.inner.read().await;
        let mut projects: Vec<Project> = inner.projects.values().cloned().collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        projects.truncate(limit as usize);
        Ok(projects)
    }

    async fn list_recent_logs(&self, limit: u32) -> Result<Vec<AgentLog>> {
        let inner = self.inner.read().await;
        let mut logs: Vec<AgentLog> = inner.logs.clone();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        logs.truncate(limit as usize);
        Ok(logs)
    }
}

/// Mark a user as admin; used by admin tooling and tests.
impl MemoryStore {
    pub async fn set_admin(&self, user_id: Uuid, is_admin: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or_else(|| ForgeError::NotFound(format!("user {user_id}")))?;
        user.is_admin = is_admin;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatasetSourceKind, Framework, TaskType};
    use serde_json::json;
    use std::sync::Arc;

    fn new_project(status: ProjectStatus) -> NewProject {
        NewProject {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "flower classifier".to_string(),
            task_type: TaskType::ImageClassification,
            framework: Framework::Pytorch,
            dataset_source: DatasetSourceKind::Kaggle,
            search_keywords: vec!["flower".to_string()],
            status,
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn advance_status_claims_exactly_once() {
        let store = MemoryStore::new();
        let project = store
            .insert_project(new_project(ProjectStatus::PendingDataset))
            .await
            .unwrap();

        let first = store
            .advance_status(
                project.id,
                ProjectStatus::PendingDataset,
                ProjectStatus::PendingTraining,
                Metadata::new(),
            )
            .await
            .unwrap();
        let second = store
            .advance_status(
                project.id,
                ProjectStatus::PendingDataset,
                ProjectStatus::PendingTraining,
                Metadata::new(),
            )
            .await
            .unwrap();

        assert_eq!(first, AdvanceOutcome::Claimed);
        assert_eq!(second, AdvanceOutcome::NotClaimed);
        let reloaded = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ProjectStatus::PendingTraining);
    }

    #[tokio::test]
    async fn advance_status_under_concurrent_attempts() {
        let store = Arc::new(MemoryStore::new());
        let project = store
            .insert_project(new_project(ProjectStatus::PendingDataset))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = project.id;
            handles.push(tokio::spawn(async move {
                store
                    .advance_status(
                        id,
                        ProjectStatus::PendingDataset,
                        ProjectStatus::PendingTraining,
                        Metadata::new(),
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap() == AdvanceOutcome::Claimed {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1, "exactly one worker may claim the transition");
    }

    #[tokio::test]
    async fn advance_status_rejects_illegal_transitions() {
        let store = MemoryStore::new();
        let project = store
            .insert_project(new_project(ProjectStatus::PendingDataset))
            .await
            .unwrap();
        let result = store
            .advance_status(
                project.id,
                ProjectStatus::PendingDataset,
                ProjectStatus::Completed,
                Metadata::new(),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn advance_status_reports_missing_projects() {
        let store = MemoryStore::new();
        let outcome = store
            .advance_status(
                Uuid::new_v4(),
                ProjectStatus::PendingDataset,
                ProjectStatus::PendingTraining,
                Metadata::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, AdvanceOutcome::NoSuchProject);
    }

    #[tokio::test]
    async fn updated_at_strictly_increases() {
        let store = MemoryStore::new();
        let project = store
            .insert_project(new_project(ProjectStatus::PendingDataset))
            .await
            .unwrap();

        let mut prev = project.updated_at;
        for _ in 0..5 {
            let mut patch = Metadata::new();
            patch.insert("k".to_string(), json!(1));
            store.update_project_metadata(project.id, patch).await.unwrap();
            let current = store
                .get_project(project.id)
                .await
                .unwrap()
                .unwrap()
                .updated_at;
            assert!(current > prev, "updated_at must strictly increase");
            prev = current;
        }
    }

    #[tokio::test]
    async fn metadata_patch_applies_with_the_claim() {
        let store = MemoryStore::new();
        let project = store
            .insert_project(new_project(ProjectStatus::PendingTraining))
            .await
            .unwrap();

        let mut patch = Metadata::new();
        patch.insert("num_classes".to_string(), json!(5));
        store
            .advance_status(
                project.id,
                ProjectStatus::PendingTraining,
                ProjectStatus::PendingEvaluation,
                patch,
            )
            .await
            .unwrap();

        let reloaded = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(reloaded.num_classes(), Some(5));
    }

    #[tokio::test]
    async fn one_dataset_row_per_project() {
        let store = MemoryStore::new();
        let project = store
            .insert_project(new_project(ProjectStatus::PendingDataset))
            .await
            .unwrap();
        let row = NewDataset {
            project_id: project.id,
            name: "flowers".to_string(),
            object_uri: "file://modelforge/raw/flowers.zip".to_string(),
            size: "1.2 MB".to_string(),
            source: DatasetSourceKind::Kaggle,
        };
        store.insert_dataset(row.clone()).await.unwrap();
        assert!(store.insert_dataset(row).await.is_err());
    }

    #[tokio::test]
    async fn upsert_user_is_idempotent() {
        let store = MemoryStore::new();
        let a = store.upsert_user("auth0|alice", None).await.unwrap();
        let b = store
            .upsert_user("auth0|alice", Some("alice@example.com"))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.email.as_deref(), Some("alice@example.com"));
    }
}
