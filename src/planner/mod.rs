//! Planner agent: one user utterance in, one project row out.

mod plan;

pub use plan::{derive_title, parse_size_hint, Plan, DEFAULT_MAX_DATASET_SIZE_GB};

use crate::models::{
    AgentName, LogLevel, MessageRole, Metadata, NewProject, ProjectStatus,
};
use crate::store::Store;
use crate::{llm::LlmClient, ForgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const PLAN_SYSTEM_PROMPT: &str = r#"You turn a user's request for an image-classification model into a strict JSON object. Respond with a single JSON object and nothing else. Recognized fields:

- "name": short project title, 3-80 characters
- "task_type": "image_classification"
- "framework": "pytorch"
- "dataset_source": "kaggle"
- "search_keywords": 1-8 short lowercase strings describing the dataset to find
- "preferred_model": one of "resnet18", "resnet34", "resnet50", "mobilenet_v2", "efficientnet_b0"
- "target_metric": "accuracy"
- "target_value": number between 0.0 and 1.0
- "max_dataset_size_gb": positive number

Omit any field you are unsure about; defaults are applied downstream. Never add fields outside this list."#;

const SCHEMA_REMINDER_PREFIX: &str =
    "Return ONLY a JSON object matching the schema. No prose, no markdown, no explanations.\n\n";

#[derive(Debug, Clone, Deserialize)]
pub struct PlanRequest {
    pub user_external_id: String,
    pub utterance: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanOutcome {
    pub project_id: Uuid,
    pub plan: Plan,
    /// Human-readable confirmation, also written as the assistant message.
    pub message: String,
}

pub struct PlannerAgent {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
}

impl PlannerAgent {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn LlmClient>) -> Self {
        Self { store, llm }
    }

    /// Convert one free-text utterance into a project with
    /// `status = pending_dataset`, an assistant message, and agent logs.
    pub async fn handle_message(&self, request: PlanRequest) -> Result<PlanOutcome> {
        let utterance = request.utterance.trim();
        if utterance.is_empty() {
            return Err(ForgeError::InputEmpty);
        }

        let user = self
            .store
            .upsert_user(&request.user_external_id, None)
            .await?;

        let plan = self.plan_from_utterance(utterance).await?;

        let mut metadata = Metadata::new();
        metadata.insert(
            "preferred_model".to_string(),
            json!(plan.preferred_model.to_string()),
        );
        metadata.insert("target_metric".to_string(), json!(plan.target_metric));
        metadata.insert("target_value".to_string(), json!(plan.target_value));
        metadata.insert(
            "max_dataset_size_gb".to_string(),
            json!(plan.max_dataset_size_gb),
        );
        if let Some(session_id) = &request.session_id {
            metadata.insert("session_id".to_string(), json!(session_id));
        }

        let mut new_project = NewProject {
            id: Uuid::new_v4(),
            user_id: user.id,
            name: plan.name.clone(),
            task_type: plan.task_type,
            framework: plan.framework,
            dataset_source: plan.dataset_source,
            search_keywords: plan.search_keywords.clone(),
            status: ProjectStatus::PendingDataset,
            metadata,
        };

        let project = match self.store.insert_project(new_project.clone()).await {
            Ok(project) => project,
            Err(e) if e.kind() == crate::ErrorKind::Conflict => {
                // Freak id collision: take a fresh id and try once more.
                warn!("project id collision on insert, retrying with a fresh id: {e}");
                new_project.id = Uuid::new_v4();
                self.store.insert_project(new_project).await?
            }
            Err(e) => return Err(e),
        };

        self.store
            .append_log(
                Some(project.id),
                AgentName::Planner,
                LogLevel::Info,
                &format!(
                    "created project \"{}\" targeting {} >= {:.2}, dataset cap {} GB",
                    project.name, plan.target_metric, plan.target_value, plan.max_dataset_size_gb
                ),
            )
            .await?;

        let message = format!(
            "Project \"{}\" is underway. I will look for a {} dataset on {} \
             (up to {} GB), then fine-tune a {} model aiming for {} of {:.0}%. \
             You will be notified as each stage completes.",
            project.name,
            plan.search_keywords.join(", "),
            plan.dataset_source,
            plan.max_dataset_size_gb,
            plan.preferred_model,
            plan.target_metric,
            plan.target_value * 100.0
        );
        self.store
            .write_message(user.id, MessageRole::Assistant, &message)
            .await?;

        info!("planner created project {} for user {}", project.id, user.id);
        Ok(PlanOutcome {
            project_id: project.id,
            plan,
            message,
        })
    }

    /// Call the LLM, validating strictly; one retry with a schema reminder
    /// before giving up with `plan_invalid`.
    async fn plan_from_utterance(&self, utterance: &str) -> Result<Plan> {
        let first = self.llm.complete(PLAN_SYSTEM_PROMPT, utterance).await?;
        match Plan::from_llm_output(&first, utterance) {
            Ok(plan) => Ok(plan),
            Err(first_err) => {
                warn!("plan output failed validation ({first_err}), retrying with reminder");
                let reminded = format!("{SCHEMA_REMINDER_PREFIX}{PLAN_SYSTEM_PROMPT}");
                let second = self.llm.complete(&reminded, utterance).await?;
                match Plan::from_llm_output(&second, utterance) {
                    Ok(plan) => Ok(plan),
                    Err(second_err) => {
                        self.store
                            .append_log(
                                None,
                                AgentName::Planner,
                                LogLevel::Warning,
                                &format!("unusable plan output after retry: {second}"),
                            )
                            .await?;
                        Err(second_err)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmClient;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted LLM: pops canned responses in order.
    struct ScriptedLlm {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| ForgeError::Dependency {
                    service: "llm".to_string(),
                    detail: "script exhausted".to_string(),
                })
        }
    }

    fn planner_with(
        responses: Vec<&str>,
    ) -> (PlannerAgent, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let llm = Arc::new(ScriptedLlm::new(responses));
        (PlannerAgent::new(store.clone(), llm), store)
    }

    fn request(utterance: &str) -> PlanRequest {
        PlanRequest {
            user_external_id: "auth0|alice".to_string(),
            utterance: utterance.to_string(),
            session_id: None,
        }
    }

    #[tokio::test]
    async fn happy_path_creates_pending_dataset_project() {
        let (planner, store) = planner_with(vec![
            r#"{"name":"Flower classifier","search_keywords":["flower","classifier"]}"#,
        ]);

        let outcome = planner
            .handle_message(request(
                "Train a flower classifier with dataset not more than 1GB",
            ))
            .await
            .unwrap();

        assert_eq!(outcome.plan.max_dataset_size_gb, 1.0);
        assert_eq!(
            outcome.plan.search_keywords,
            vec!["flower".to_string(), "classifier".to_string()]
        );

        let project = store.get_project(outcome.project_id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::PendingDataset);
        assert_eq!(project.max_dataset_size_gb(), Some(1.0));
        assert_eq!(project.meta_str("preferred_model"), Some("resnet18"));

        let user = store
            .get_user_by_external_id("auth0|alice")
            .await
            .unwrap()
            .unwrap();
        let messages = store.get_messages_by_user(user.id, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::Assistant);

        let logs = store.get_logs_by_project(project.id, 10).await.unwrap();
        assert!(!logs.is_empty());
    }

    #[tokio::test]
    async fn invalid_output_is_retried_once_with_reminder() {
        let (planner, _store) = planner_with(vec![
            "I think you want a flower model!",
            r#"{"name":"Flower classifier","search_keywords":["flower"]}"#,
        ]);

        let outcome = planner
            .handle_message(request("train a flower classifier"))
            .await
            .unwrap();
        assert_eq!(outcome.plan.name, "Flower classifier");
    }

    #[tokio::test]
    async fn twice_invalid_output_fails_plan_invalid() {
        let (planner, store) = planner_with(vec!["nope", "still nope"]);

        let err = planner
            .handle_message(request("train a flower classifier"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PlanInvalid);

        // Raw output logged at warning for diagnosis.
        let logs = store.list_recent_logs(10).await.unwrap();
        assert!(logs
            .iter()
            .any(|l| l.log_level == LogLevel::Warning && l.message.contains("still nope")));
    }

    #[tokio::test]
    async fn empty_utterance_is_rejected_without_llm_call() {
        let (planner, _store) = planner_with(vec![]);
        let err = planner.handle_message(request("   ")).await.unwrap_err();
        assert_eq!(err.code(), "input_empty");
    }

    #[tokio::test]
    async fn non_image_task_is_still_inserted() {
        let (planner, store) = planner_with(vec![
            r#"{"name":"Sentiment model","task_type":"text_classification","search_keywords":["sentiment"]}"#,
        ]);

        let outcome = planner
            .handle_message(request("classify text sentiment"))
            .await
            .unwrap();
        let project = store.get_project(outcome.project_id).await.unwrap().unwrap();
        assert_eq!(project.task_type, crate::models::TaskType::Other);
        assert_eq!(project.status, ProjectStatus::PendingDataset);
    }
}
