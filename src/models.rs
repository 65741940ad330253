use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use uuid::Uuid;

/// JSON object used for project and model metadata patches.
pub type Metadata = Map<String, Value>;

/// Lifecycle status of a project.
///
/// Statuses advance strictly left to right; `failed` is reachable from any
/// non-terminal status. Each non-terminal status past `draft` is owned by
/// exactly one agent, which is the only writer of the row until it advances
/// or fails the status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    PendingDataset,
    PendingTraining,
    PendingEvaluation,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectStatus::Completed | ProjectStatus::Failed)
    }

    /// The next status in the linear pipeline, if any.
    pub fn successor(&self) -> Option<ProjectStatus> {
        match self {
            ProjectStatus::Draft => Some(ProjectStatus::PendingDataset),
            ProjectStatus::PendingDataset => Some(ProjectStatus::PendingTraining),
            ProjectStatus::PendingTraining => Some(ProjectStatus::PendingEvaluation),
            ProjectStatus::PendingEvaluation => Some(ProjectStatus::Completed),
            ProjectStatus::Completed | ProjectStatus::Failed => None,
        }
    }

    /// Whether a transition from `self` to `to` is legal: one step forward
    /// along the pipeline, or any non-terminal status to `failed`.
    pub fn can_advance_to(&self, to: ProjectStatus) -> bool {
        if to == ProjectStatus::Failed {
            return !self.is_terminal();
        }
        self.successor() == Some(to)
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectStatus::Draft => "draft",
            ProjectStatus::PendingDataset => "pending_dataset",
            ProjectStatus::PendingTraining => "pending_training",
            ProjectStatus::PendingEvaluation => "pending_evaluation",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ProjectStatus::Draft),
            "pending_dataset" => Ok(ProjectStatus::PendingDataset),
            "pending_training" => Ok(ProjectStatus::PendingTraining),
            "pending_evaluation" => Ok(ProjectStatus::PendingEvaluation),
            "completed" => Ok(ProjectStatus::Completed),
            "failed" => Ok(ProjectStatus::Failed),
            _ => Err(format!("unknown project status: {s}")),
        }
    }
}

/// Kind of ML task a project asks for. Only image classification is handled
/// by the downstream agents in v1; anything else is inserted by the planner
/// and rejected when the owning agent first touches it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    ImageClassification,
    #[serde(other)]
    Other,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::ImageClassification => f.write_str("image_classification"),
            TaskType::Other => f.write_str("other"),
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image_classification" => Ok(TaskType::ImageClassification),
            _ => Ok(TaskType::Other),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    #[default]
    Pytorch,
    Tensorflow,
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Framework::Pytorch => f.write_str("pytorch"),
            Framework::Tensorflow => f.write_str("tensorflow"),
        }
    }
}

impl FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pytorch" => Ok(Framework::Pytorch),
            "tensorflow" => Ok(Framework::Tensorflow),
            _ => Err(format!("unknown framework: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatasetSourceKind {
    #[default]
    Kaggle,
    Huggingface,
    #[serde(other)]
    Other,
}

impl std::fmt::Display for DatasetSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetSourceKind::Kaggle => f.write_str("kaggle"),
            DatasetSourceKind::Huggingface => f.write_str("huggingface"),
            DatasetSourceKind::Other => f.write_str("other"),
        }
    }
}

impl FromStr for DatasetSourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kaggle" => Ok(DatasetSourceKind::Kaggle),
            "huggingface" => Ok(DatasetSourceKind::Huggingface),
            _ => Ok(DatasetSourceKind::Other),
        }
    }
}

/// Supported classifier architectures for transfer learning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelArchitecture {
    #[default]
    Resnet18,
    Resnet34,
    Resnet50,
    MobilenetV2,
    EfficientnetB0,
}

impl ModelArchitecture {
    pub const ALL: [ModelArchitecture; 5] = [
        ModelArchitecture::Resnet18,
        ModelArchitecture::Resnet34,
        ModelArchitecture::Resnet50,
        ModelArchitecture::MobilenetV2,
        ModelArchitecture::EfficientnetB0,
    ];
}

impl std::fmt::Display for ModelArchitecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelArchitecture::Resnet18 => "resnet18",
            ModelArchitecture::Resnet34 => "resnet34",
            ModelArchitecture::Resnet50 => "resnet50",
            ModelArchitecture::MobilenetV2 => "mobilenet_v2",
            ModelArchitecture::EfficientnetB0 => "efficientnet_b0",
        };
        f.write_str(s)
    }
}

impl FromStr for ModelArchitecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resnet18" => Ok(ModelArchitecture::Resnet18),
            "resnet34" => Ok(ModelArchitecture::Resnet34),
            "resnet50" => Ok(ModelArchitecture::Resnet50),
            "mobilenet_v2" => Ok(ModelArchitecture::MobilenetV2),
            "efficientnet_b0" => Ok(ModelArchitecture::EfficientnetB0),
            _ => Err(format!("unknown model architecture: {s}")),
        }
    }
}

/// Names of the services that write agent logs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentName {
    Planner,
    Dataset,
    Training,
    Evaluation,
    Gateway,
}

impl std::fmt::Display for AgentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentName::Planner => "planner",
            AgentName::Dataset => "dataset",
            AgentName::Training => "training",
            AgentName::Evaluation => "evaluation",
            AgentName::Gateway => "gateway",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planner" => Ok(AgentName::Planner),
            "dataset" => Ok(AgentName::Dataset),
            "training" => Ok(AgentName::Training),
            "evaluation" => Ok(AgentName::Evaluation),
            "gateway" => Ok(AgentName::Gateway),
            _ => Err(format!("unknown agent name: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => f.write_str("info"),
            LogLevel::Warning => f.write_str("warning"),
            LogLevel::Error => f.write_str("error"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("unknown log level: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => f.write_str("user"),
            MessageRole::Assistant => f.write_str("assistant"),
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            _ => Err(format!("unknown message role: {s}")),
        }
    }
}

/// A person interacting with the system, keyed by the external auth id the
/// gateway receives. Created on first observation; never deleted by agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub external_auth_id: String,
    pub email: Option<String>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

/// One model-building project, the unit of work the agents cooperate on.
///
/// Created by the planner with `status = pending_dataset`; mutated only by
/// the agent owning the current status; never destroyed by agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub task_type: TaskType,
    pub framework: Framework,
    pub dataset_source: DatasetSourceKind,
    pub search_keywords: Vec<String>,
    pub status: ProjectStatus,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Object-path-safe slug of the project name.
    pub fn slug(&self) -> String {
        crate::slug::slugify_truncate(&self.name)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(|v| v.as_f64())
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(|v| v.as_u64())
    }

    pub fn preferred_model(&self) -> ModelArchitecture {
        self.meta_str("preferred_model")
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    pub fn max_dataset_size_gb(&self) -> Option<f64> {
        self.meta_f64("max_dataset_size_gb")
    }

    pub fn bundle_uri(&self) -> Option<&str> {
        self.meta_str("bundle_uri")
    }

    pub fn num_classes(&self) -> Option<usize> {
        self.meta_u64("num_classes").map(|n| n as usize)
    }

    /// Ordered class names recorded by the training agent.
    pub fn class_names(&self) -> Option<Vec<String>> {
        let arr = self.metadata.get("class_names")?.as_array()?;
        Some(
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
        )
    }
}

/// Fields the planner supplies when inserting a project. The id is chosen by
/// the caller so an insert conflict can be retried with a fresh one.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub task_type: TaskType,
    pub framework: Framework,
    pub dataset_source: DatasetSourceKind,
    pub search_keywords: Vec<String>,
    pub status: ProjectStatus,
    pub metadata: Metadata,
}

/// The archive the dataset agent acquired for a project. Exactly one row per
/// project once the project has moved past `pending_dataset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub object_uri: String,
    pub size: String,
    pub source: DatasetSourceKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDataset {
    pub project_id: Uuid,
    pub name: String,
    pub object_uri: String,
    pub size: String,
    pub source: DatasetSourceKind,
}

/// The weights artifact produced by the training agent. `accuracy` and the
/// evaluation report are filled in later by the evaluation agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub framework: Framework,
    pub object_uri: String,
    pub accuracy: Option<f64>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTrainedModel {
    pub project_id: Uuid,
    pub name: String,
    pub framework: Framework,
    pub object_uri: String,
    pub metadata: Metadata,
}

/// Append-only operational log row. `project_id` is null only for service
/// startup events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLog {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    pub agent_name: AgentName,
    pub message: String,
    pub log_level: LogLevel,
    pub created_at: DateTime<Utc>,
}

/// A chat-surface message. Written by the planner and the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub user_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Structured failure description stored under `metadata.error` when a
/// workflow fails a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub detail: String,
    pub step: String,
}

impl ErrorInfo {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
