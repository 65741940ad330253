use crate::{ForgeError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub objects: ObjectsConfig,
    pub llm: LlmConfig,
    pub polling: PollingConfig,
    pub dataset: DatasetConfig,
    pub training: TrainingConfig,
    pub server: ServerConfig,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Postgres connection string, or the literal `memory` for the
    /// in-process store used by tests and local development.
    pub database_url: String,
}

impl StoreConfig {
    pub fn is_memory(&self) -> bool {
        self.database_url == "memory"
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObjectBackendKind {
    Local,
    S3,
}

impl FromStr for ObjectBackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(ObjectBackendKind::Local),
            "s3" => Ok(ObjectBackendKind::S3),
            _ => Err(format!("unknown object store backend: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectsConfig {
    pub backend: ObjectBackendKind,
    /// Root directory for the local backend; each allowed bucket becomes a
    /// subdirectory.
    pub root: PathBuf,
    /// Bucket allow-list. URIs referencing any other bucket are rejected.
    pub buckets: Vec<String>,
    /// Bucket the agents write artifacts into.
    pub default_bucket: String,
    pub download_retries: u32,
    pub upload_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub poll_interval_seconds: u64,
    pub dataset_batch_limit: u32,
    pub training_batch_limit: u32,
    pub evaluation_batch_limit: u32,
    pub advance_status_retries: u32,
    /// Per-workflow deadline; exceeding it fails the project with `timeout`.
    pub step_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Hard ceiling applied on top of whatever the plan requests.
    pub max_dataset_size_gb: f64,
    /// Search endpoint of the dataset source provider.
    pub provider_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub default_epochs: usize,
    pub default_learning_rate: f64,
    /// Directory holding `<arch>.safetensors` checkpoints to warm-start from.
    pub pretrained_weights_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub gateway_port: u16,
    pub planner_port: u16,
    pub dataset_port: u16,
    pub training_port: u16,
    pub evaluation_port: u16,
    pub allowed_origins: Vec<String>,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("invalid value for {key}, using default");
                default
            }
        },
        Err(_) => default,
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::debug!("loaded .env file from {:?}", path),
            Err(_) => tracing::debug!("no .env file found"),
        }

        let llm_api_key = env::var("LLM_API_KEY").map_err(|_| {
            ForgeError::Configuration("LLM_API_KEY environment variable is required".to_string())
        })?;
        if llm_api_key.trim().is_empty() {
            return Err(ForgeError::Configuration(
                "LLM_API_KEY cannot be empty".to_string(),
            ));
        }

        let llm = LlmConfig {
            base_url: env_or("LLM_BASE_URL", "https://api.openai.com"),
            api_key: llm_api_key,
            model: env_or("LLM_MODEL", "gpt-4o-mini"),
            max_tokens: env_parse("LLM_MAX_TOKENS", 1024u32),
            temperature: env_parse("LLM_TEMPERATURE", 0.2f32),
        };
        if !(0.0..=2.0).contains(&llm.temperature) {
            return Err(ForgeError::Configuration(format!(
                "LLM_TEMPERATURE must be within [0, 2], got {}",
                llm.temperature
            )));
        }

        let store = StoreConfig {
            database_url: env_or("DATABASE_URL", "memory"),
        };

        let backend: ObjectBackendKind = env_or("OBJECT_STORE_BACKEND", "local")
            .parse()
            .map_err(ForgeError::Configuration)?;
        let buckets: Vec<String> = env_or("OBJECT_STORE_BUCKETS", "modelforge")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if buckets.is_empty() {
            return Err(ForgeError::Configuration(
                "OBJECT_STORE_BUCKETS must name at least one bucket".to_string(),
            ));
        }
        let objects = ObjectsConfig {
            backend,
            root: PathBuf::from(env_or("OBJECT_STORE_ROOT", "./object-store")),
            default_bucket: buckets[0].clone(),
            buckets,
            download_retries: env_parse("DOWNLOAD_RETRIES", 5u32),
            upload_retries: env_parse("UPLOAD_RETRIES", 5u32),
        };

        let polling = PollingConfig {
            poll_interval_seconds: env_parse("POLL_INTERVAL_SECONDS", 10u64).max(1),
            dataset_batch_limit: env_parse("DATASET_BATCH_LIMIT", 4u32).max(1),
            // One training at a time per process unless explicitly raised.
            training_batch_limit: env_parse("TRAINING_BATCH_LIMIT", 1u32).max(1),
            evaluation_batch_limit: env_parse("EVALUATION_BATCH_LIMIT", 4u32).max(1),
            advance_status_retries: env_parse("ADVANCE_STATUS_RETRIES", 3u32),
            step_timeout_seconds: env_parse("STEP_TIMEOUT_SECONDS", 3600u64).max(1),
        };

        let dataset = DatasetConfig {
            max_dataset_size_gb: env_parse("MAX_DATASET_SIZE_GB", 50.0f64),
            provider_base_url: env_or("DATASET_PROVIDER_BASE_URL", "http://127.0.0.1:8090"),
        };
        if dataset.max_dataset_size_gb <= 0.0 {
            return Err(ForgeError::Configuration(
                "MAX_DATASET_SIZE_GB must be positive".to_string(),
            ));
        }

        let training = TrainingConfig {
            batch_size: env_parse("BATCH_SIZE", 32usize).max(1),
            default_epochs: env_parse("DEFAULT_EPOCHS", 10usize).max(1),
            default_learning_rate: env_parse("DEFAULT_LEARNING_RATE", 1e-3f64),
            pretrained_weights_dir: env::var("PRETRAINED_WEIGHTS_DIR").ok().map(PathBuf::from),
        };
        if training.default_learning_rate <= 0.0 {
            return Err(ForgeError::Configuration(
                "DEFAULT_LEARNING_RATE must be positive".to_string(),
            ));
        }

        let allowed_origins = env_or("ALLOWED_ORIGINS", "http://localhost:3000")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let server = ServerConfig {
            host: env_or("API_HOST", "127.0.0.1"),
            gateway_port: env_parse("GATEWAY_PORT", 8000u16),
            planner_port: env_parse("PLANNER_PORT", 8001u16),
            dataset_port: env_parse("DATASET_PORT", 8002u16),
            training_port: env_parse("TRAINING_PORT", 8003u16),
            evaluation_port: env_parse("EVALUATION_PORT", 8004u16),
            allowed_origins,
        };

        Ok(Config {
            store,
            objects,
            llm,
            polling,
            dataset,
            training,
            server,
            log_level: env_or("LOG_LEVEL", "info"),
        })
    }
}
