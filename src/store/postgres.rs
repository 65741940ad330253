//! Postgres-backed [`Store`] implementation.
//!
//! The conditional advance is a single `UPDATE … WHERE status = $from`;
//! `rows_affected` distinguishes a claim from a lost race. Metadata patches
//! merge server-side with the `||` JSONB operator so the status flip and the
//! patch land in one write.

use super::{AdvanceOutcome, Store};
use crate::models::{
    AgentLog, AgentName, Dataset, LogLevel, Message, MessageRole, Metadata, NewDataset,
    NewProject, NewTrainedModel, Project, ProjectStatus, TrainedModel, User,
};
use crate::{ForgeError, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use uuid::Uuid;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| ForgeError::Configuration(format!("migration failed: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: String, column: &str) -> Result<T> {
    raw.parse()
        .map_err(|e| ForgeError::Configuration(format!("corrupt {column} column: {e}")))
}

fn keywords_from_value(value: Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

fn metadata_from_value(value: Value) -> Metadata {
    match value {
        Value::Object(map) => map,
        _ => Metadata::new(),
    }
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        external_auth_id: row.try_get("external_auth_id")?,
        email: row.try_get("email")?,
        is_admin: row.try_get("is_admin")?,
        created_at: row.try_get("created_at")?,
    })
}

fn project_from_row(row: &PgRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        task_type: parse_enum(row.try_get::<String, _>("task_type")?, "task_type")?,
        framework: parse_enum(row.try_get::<String, _>("framework")?, "framework")?,
        dataset_source: parse_enum(
            row.try_get::<String, _>("dataset_source")?,
            "dataset_source",
        )?,
        search_keywords: keywords_from_value(row.try_get::<Value, _>("search_keywords")?),
        status: parse_enum(row.try_get::<String, _>("status")?, "status")?,
        metadata: metadata_from_value(row.try_get::<Value, _>("metadata")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn dataset_from_row(row: &PgRow) -> Result<Dataset> {
    Ok(Dataset {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        object_uri: row.try_get("object_uri")?,
        size: row.try_get("size")?,
        source: parse_enum(row.try_get::<String, _>("source")?, "source")?,
        created_at: row.try_get("created_at")?,
    })
}

fn model_from_row(row: &PgRow) -> Result<TrainedModel> {
    Ok(TrainedModel {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        framework: parse_enum(row.try_get::<String, _>("framework")?, "framework")?,
        object_uri: row.try_get("object_uri")?,
        accuracy: row.try_get("accuracy")?,
        metadata: metadata_from_value(row.try_get::<Value, _>("metadata")?),
        created_at: row.try_get("created_at")?,
    })
}

fn log_from_row(row: &PgRow) -> Result<AgentLog> {
    Ok(AgentLog {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        agent_name: parse_enum(row.try_get::<String, _>("agent_name")?, "agent_name")?,
        message: row.try_get("message")?,
        log_level: parse_enum(row.try_get::<String, _>("log_level")?, "log_level")?,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        role: parse_enum(row.try_get::<String, _>("role")?, "role")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_user(&self, external_auth_id: &str, email: Option<&str>) -> Result<User> {
        let row = sqlx::query(
            "INSERT INTO users (id, external_auth_id, email) VALUES ($1, $2, $3) \
             ON CONFLICT (external_auth_id) \
             DO UPDATE SET email = COALESCE(EXCLUDED.email, users.email) \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(external_auth_id)
        .bind(email)
        .fetch_one(&self.pool)
        .await?;
        user_from_row(&row)
    }

    async fn get_user_by_external_id(&self, external_auth_id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE external_auth_id = $1")
            .bind(external_auth_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn insert_project(&self, new: NewProject) -> Result<Project> {
        let row = sqlx::query(
            "INSERT INTO projects \
             (id, user_id, name, task_type, framework, dataset_source, search_keywords, status, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING *",
        )
        .bind(new.id)
        .bind(new.user_id)
        .bind(&new.name)
        .bind(new.task_type.to_string())
        .bind(new.framework.to_string())
        .bind(new.dataset_source.to_string())
        .bind(Value::from(new.search_keywords.clone()))
        .bind(new.status.to_string())
        .bind(Value::Object(new.metadata.clone()))
        .fetch_one(&self.pool)
        .await?;
        project_from_row(&row)
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(project_from_row).transpose()
    }

    async fn get_projects_by_status(
        &self,
        status: ProjectStatus,
        limit: u32,
    ) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT * FROM projects WHERE status = $1 ORDER BY updated_at ASC LIMIT $2",
        )
        .bind(status.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(project_from_row).collect()
    }

    async fn get_projects_by_user(&self, user_id: Uuid) -> Result<Vec<Project>> {
        let rows =
            sqlx::query("SELECT * FROM projects WHERE user_id = $1 ORDER BY created_at DESC")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(project_from_row).collect()
    }

    async fn update_project_metadata(&self, project_id: Uuid, patch: Metadata) -> Result<()> {
        let result = sqlx::query(
            "UPDATE projects SET metadata = metadata || $2, \
             updated_at = GREATEST(now(), updated_at + interval '1 microsecond') \
             WHERE id = $1",
        )
        .bind(project_id)
        .bind(Value::Object(patch))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::NotFound(format!("project {project_id}")));
        }
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
        let result = sqlx::query(
            "UPDATE projects SET status = $3, metadata = metadata || $4, \
             updated_at = GREATEST(now(), updated_at + interval '1 microsecond') \
             WHERE id = $1 AND status = $2",
        )
        .bind(project_id)
        .bind(from.to_string())
        .bind(to.to_string())
        .bind(Value::Object(metadata_patch))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(AdvanceOutcome::Claimed);
        }
        let exists = sqlx::query("SELECT 1 FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(if exists.is_some() {
            AdvanceOutcome::NotClaimed
        } else {
            AdvanceOutcome::NoSuchProject
        })
    }

    async fn insert_dataset(&self, new: NewDataset) -> Result<Dataset> {
        let row = sqlx::query(
            "INSERT INTO datasets (id, project_id, name, object_uri, size, source) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(new.project_id)
        .bind(&new.name)
        .bind(&new.object_uri)
        .bind(&new.size)
        .bind(new.source.to_string())
        .fetch_one(&self.pool)
        .await?;
        dataset_from_row(&row)
    }

    async fn get_dataset_by_project(&self, project_id: Uuid) -> Result<Option<Dataset>> {
        let row = sqlx::query("SELECT * FROM datasets WHERE project_id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dataset_from_row).transpose()
    }

    async fn insert_model(&self, new: NewTrainedModel) -> Result<TrainedModel> {
        let row = sqlx::query(
            "INSERT INTO models (id, project_id, name, framework, object_uri, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(new.project_id)
        .bind(&new.name)
        .bind(new.framework.to_string())
        .bind(&new.object_uri)
        .bind(Value::Object(new.metadata.clone()))
        .fetch_one(&self.pool)
        .await?;
        model_from_row(&row)
    }

    async fn get_model_by_project(&self, project_id: Uuid) -> Result<Option<TrainedModel>> {
        let row = sqlx::query("SELECT * FROM models WHERE project_id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(model_from_row).transpose()
    }

    async fn update_model_evaluation(
        &self,
        model_id: Uuid,
        accuracy: f64,
        metadata_patch: Metadata,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE models SET accuracy = $2, metadata = metadata || $3 WHERE id = $1",
        )
        .bind(model_id)
        .bind(accuracy)
        .bind(Value::Object(metadata_patch))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ForgeError::NotFound(format!("model {model_id}")));
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
        sqlx::query(
            "INSERT INTO agent_logs (id, project_id, agent_name, message, log_level) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(agent.to_string())
        .bind(message)
        .bind(level.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_logs_by_project(&self, project_id: Uuid, limit: u32) -> Result<Vec<AgentLog>> {
        let rows = sqlx::query(
            "SELECT * FROM (\
               SELECT * FROM agent_logs WHERE project_id = $1 \
               ORDER BY created_at DESC LIMIT $2\
             ) recent ORDER BY created_at ASC",
        )
        .bind(project_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn write_message(
        &self,
        user_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        let row = sqlx::query(
            "INSERT INTO messages (id, user_id, role, content) \
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(role.to_string())
        .bind(content)
        .fetch_one(&self.pool)
        .await?;
        message_from_row(&row)
    }

    async fn get_messages_by_user(&self, user_id: Uuid, limit: u32) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM (\
               SELECT * FROM messages WHERE user_id = $1 \
               ORDER BY created_at DESC LIMIT $2\
             ) recent ORDER BY created_at ASC",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn count_projects_by_status(&self) -> Result<HashMap<ProjectStatus, u64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM projects GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = HashMap::new();
        for row in rows {
            let status: ProjectStatus =
                parse_enum(row.try_get::<String, _>("status")?, "status")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(status, n as u64);
        }
        Ok(counts)
    }

    async fn list_users(&self, limit: u32) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY created_at DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn list_projects(&self, limit: u32) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(project_from_row).collect()
    }

    async fn list_recent_logs(&self, limit: u32) -> Result<Vec<AgentLog>> {
        let rows = sqlx::query("SELECT * FROM agent_logs ORDER BY created_at DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(log_from_row).collect()
    }
}
