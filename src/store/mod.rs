//! Typed access to the shared relational store.
//!
//! All cross-agent state passes through the [`Store`] trait. The single
//! coordination primitive is [`Store::advance_status`], a conditional update
//! that succeeds only when the row is still in the expected status; it
//! substitutes for distributed locking.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::models::{
    AgentLog, AgentName, Dataset, LogLevel, Message, MessageRole, Metadata, NewDataset,
    NewProject, NewTrainedModel, Project, ProjectStatus, TrainedModel, User,
};
use crate::{ForgeError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

/// Result of a conditional status advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The row was in the expected status and has been advanced.
    Claimed,
    /// The row exists but another worker already moved it on.
    NotClaimed,
    NoSuchProject,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_user(&self, external_auth_id: &str, email: Option<&str>) -> Result<User>;
    async fn get_user_by_external_id(&self, external_auth_id: &str) -> Result<Option<User>>;

    async fn insert_project(&self, new: NewProject) -> Result<Project>;
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>>;
    /// Projects in `status`, oldest `updated_at` first.
    async fn get_projects_by_status(
        &self,
        status: ProjectStatus,
        limit: u32,
    ) -> Result<Vec<Project>>;
    async fn get_projects_by_user(&self, user_id: Uuid) -> Result<Vec<Project>>;
    /// Merge `patch` into the project metadata without touching the status.
    async fn update_project_metadata(&self, project_id: Uuid, patch: Metadata) -> Result<()>;

    /// Conditionally advance the status, merging `metadata_patch` in the same
    /// write. Succeeds only when the current status equals `from`. This is
    /// the sole primitive used to take work.
    async fn advance_status(
        &self,
        project_id: Uuid,
        from: ProjectStatus,
        to: ProjectStatus,
        metadata_patch: Metadata,
    ) -> Result<AdvanceOutcome>;

    async fn insert_dataset(&self, new: NewDataset) -> Result<Dataset>;
    async fn get_dataset_by_project(&self, project_id: Uuid) -> Result<Option<Dataset>>;

    async fn insert_model(&self, new: NewTrainedModel) -> Result<TrainedModel>;
    async fn get_model_by_project(&self, project_id: Uuid) -> Result<Option<TrainedModel>>;
    /// Record the evaluation outcome on an existing model row.
    async fn update_model_evaluation(
        &self,
        model_id: Uuid,
        accuracy: f64,
        metadata_patch: Metadata,
    ) -> Result<()>;

    async fn append_log(
        &self,
        project_id: Option<Uuid>,
        agent: AgentName,
        level: LogLevel,
        message: &str,
    ) -> Result<()>;
    async fn get_logs_by_project(&self, project_id: Uuid, limit: u32) -> Result<Vec<AgentLog>>;

    async fn write_message(
        &self,
        user_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<Message>;
    async fn get_messages_by_user(&self, user_id: Uuid, limit: u32) -> Result<Vec<Message>>;

    // Admin aggregation
    async fn count_projects_by_status(&self) -> Result<HashMap<ProjectStatus, u64>>;
    async fn list_users(&self, limit: u32) -> Result<Vec<User>>;
    async fn list_projects(&self, limit: u32) -> Result<Vec<Project>>;
    async fn list_recent_logs(&self, limit: u32) -> Result<Vec<AgentLog>>;
}

/// Base delay between attempts for store retries.
pub const STORE_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Retry `op` on transient errors, up to `attempts` tries, sleeping
/// `backoff * attempt` between tries (linear backoff). `conflict`,
/// `not_found`, and `permanent` errors are never retried.
pub async fn retry_transient<T, F, Fut>(attempts: u32, backoff: Duration, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last: Option<ForgeError> = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(
                    "transient store failure (attempt {attempt}/{attempts}): {e}, retrying"
                );
                tokio::time::sleep(backoff * attempt).await;
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or(ForgeError::Transient {
        detail: "retry budget exhausted".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retry_transient_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = retry_transient(3, Duration::from_millis(1), move || {
            let calls = calls2.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ForgeError::Transient {
                        detail: "flaky".into(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_transient_never_retries_conflicts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<u32> = retry_transient(3, Duration::from_millis(1), move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ForgeError::Conflict("row moved on".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_transient_gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<u32> = retry_transient(3, Duration::from_millis(1), move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ForgeError::Transient {
                    detail: "still down".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
