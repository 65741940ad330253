//! Worker agents and the workflow failure policy they share.
//!
//! Each agent owns exactly one non-terminal project status and is the only
//! writer of a row while it holds that status. A workflow is the ordered
//! sequence of steps between two status transitions; it either advances the
//! row or maps its failure onto the error taxonomy here.

pub mod dataset;
pub mod evaluation;
pub mod training;

pub use dataset::DatasetAgent;
pub use evaluation::EvaluationAgent;
pub use training::TrainingAgent;

use crate::models::{AgentName, ErrorInfo, LogLevel, MessageRole, Metadata, Project, ProjectStatus};
use crate::store::{retry_transient, Store, STORE_RETRY_BACKOFF};
use crate::{ErrorKind, ForgeError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// A workflow error tagged with the step it happened in; the step name ends
/// up in `metadata.error.step`.
#[derive(Debug)]
pub struct StepError {
    pub step: &'static str,
    pub error: ForgeError,
}

pub type StepResult<T> = std::result::Result<T, StepError>;

/// Tag a plain result with the workflow step that produced it.
pub trait StepContext<T> {
    fn step(self, step: &'static str) -> StepResult<T>;
}

impl<T> StepContext<T> for Result<T> {
    fn step(self, step: &'static str) -> StepResult<T> {
        self.map_err(|error| StepError { step, error })
    }
}

#[async_trait]
pub trait WorkerAgent: Send + Sync + 'static {
    fn name(&self) -> AgentName;
    /// The status this agent owns; the poll loop fetches rows in it.
    fn owned_status(&self) -> ProjectStatus;
    fn store(&self) -> Arc<dyn Store>;
    /// Deadline for one full workflow run.
    fn step_timeout(&self) -> Duration;
    /// The workflow body. Artifacts must be written before the status
    /// transition that advertises them.
    async fn process(&self, project: Project) -> StepResult<()>;
}

/// Run one workflow under the shared failure policy.
///
/// - success: info log, `Ok`.
/// - `conflict`: another worker advanced the row; info log, `Ok` without
///   touching the project.
/// - `integrity`: the artifact exists but the final advance failed; warning
///   log plus a user message, and the project is deliberately NOT failed.
/// - anything else: error log and a conditional transition to `failed` with
///   `metadata.error = {kind, detail, step}`.
pub async fn run_workflow(agent: &dyn WorkerAgent, project: Project) -> Result<()> {
    let store = agent.store();
    let project_id = project.id;
    let user_id = project.user_id;
    let owned = agent.owned_status();
    info!(
        "{} agent picked up project {project_id} ({})",
        agent.name(),
        project.name
    );

    let outcome = match tokio::time::timeout(agent.step_timeout(), agent.process(project)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(StepError {
            step: "deadline",
            error: ForgeError::Timeout {
                step: "workflow".to_string(),
            },
        }),
    };

    let StepError { step, error } = match outcome {
        Ok(()) => {
            info!("{} agent finished project {project_id}", agent.name());
            return Ok(());
        }
        Err(e) => e,
    };

    match error.kind() {
        ErrorKind::Conflict => {
            let _ = store
                .append_log(
                    Some(project_id),
                    agent.name(),
                    LogLevel::Info,
                    &format!("another worker advanced project during {step}; nothing to do"),
                )
                .await;
            info!(
                "{} agent lost the claim race for project {project_id} at {step}",
                agent.name()
            );
            Ok(())
        }
        ErrorKind::Integrity => {
            warn!(
                "{} agent hit integrity case for project {project_id} at {step}: {error}",
                agent.name()
            );
            let _ = store
                .append_log(
                    Some(project_id),
                    agent.name(),
                    LogLevel::Warning,
                    &format!("status update failed after artifact write ({step}): {error}"),
                )
                .await;
            let _ = store
                .write_message(
                    user_id,
                    MessageRole::Assistant,
                    "Your project produced its artifact but the pipeline could not record \
                     progress; an operator needs to take a look before it continues.",
                )
                .await;
            Err(error)
        }
        kind => {
            error!(
                "{} agent failed project {project_id} at {step}: {error}",
                agent.name()
            );
            let _ = store
                .append_log(
                    Some(project_id),
                    agent.name(),
                    LogLevel::Error,
                    &format!("workflow failed at {step}: {error}"),
                )
                .await;

            let info = ErrorInfo {
                kind: kind.as_str().to_string(),
                detail: error.to_string(),
                step: step.to_string(),
            };
            let mut patch = Metadata::new();
            patch.insert("error".to_string(), info.to_value());

            let advance = retry_transient(3, STORE_RETRY_BACKOFF, || {
                let patch = patch.clone();
                let store = store.clone();
                async move {
                    store
                        .advance_status(project_id, owned, ProjectStatus::Failed, patch)
                        .await
                }
            })
            .await;
            if let Err(e) = advance {
                error!("could not mark project {project_id} failed: {e}");
            }
            Err(error)
        }
    }
}

/// Advance helper shared by the workflow tails: conditional update retried
/// on transient store failures, with `NotClaimed` surfaced as `conflict`.
pub async fn advance_with_retries(
    store: &Arc<dyn Store>,
    project_id: uuid::Uuid,
    from: ProjectStatus,
    to: ProjectStatus,
    patch: Metadata,
    attempts: u32,
) -> Result<()> {
    use crate::store::AdvanceOutcome;

    let outcome = retry_transient(attempts, STORE_RETRY_BACKOFF, || {
        let patch = patch.clone();
        let store = store.clone();
        async move { store.advance_status(project_id, from, to, patch).await }
    })
    .await?;

    match outcome {
        AdvanceOutcome::Claimed => Ok(()),
        AdvanceOutcome::NotClaimed => Err(ForgeError::Conflict(format!(
            "project {project_id} is no longer in {from}"
        ))),
        AdvanceOutcome::NoSuchProject => {
            Err(ForgeError::NotFound(format!("project {project_id}")))
        }
    }
}
