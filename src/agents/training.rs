//! Training agent: owns `pending_training`.

use super::{advance_with_retries, StepContext, StepResult, WorkerAgent};
use crate::archive::extract_archive;
use crate::config::TrainingConfig;
use crate::models::{
    AgentName, LogLevel, MessageRole, Metadata, NewTrainedModel, Project, ProjectStatus,
};
use crate::objects::{ObjectStoreClient, ObjectUri};
use crate::store::Store;
use crate::training::{self, discover_layout, DatasetLayout, TrainSpec};
use crate::workdir::Workdir;
use crate::{ForgeError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct TrainingAgent {
    store: Arc<dyn Store>,
    objects: Arc<ObjectStoreClient>,
    config: TrainingConfig,
    advance_retries: u32,
    step_timeout: Duration,
}

impl TrainingAgent {
    pub fn new(
        store: Arc<dyn Store>,
        objects: Arc<ObjectStoreClient>,
        config: TrainingConfig,
        advance_retries: u32,
        step_timeout: Duration,
    ) -> Self {
        Self {
            store,
            objects,
            config,
            advance_retries,
            step_timeout,
        }
    }

    fn train_spec(&self, project: &Project, num_classes: usize) -> TrainSpec {
        let arch = project.preferred_model();
        let mut batch_size = self.config.batch_size;
        if !training::accelerator_available() {
            // CPU fallback: halve the default batch to stay within memory.
            batch_size = (batch_size / 2).max(1);
        }
        TrainSpec {
            arch,
            num_classes,
            epochs: project
                .meta_u64("epochs")
                .map(|e| e as usize)
                .unwrap_or(self.config.default_epochs)
                .max(1),
            learning_rate: project
                .meta_f64("learning_rate")
                .unwrap_or(self.config.default_learning_rate),
            batch_size,
            pretrained_weights: self
                .config
                .pretrained_weights_dir
                .as_ref()
                .map(|dir| dir.join(format!("{arch}.safetensors"))),
        }
    }

    /// Download and unpack the project's archive, returning the validated
    /// layout.
    async fn prepare_dataset(&self, project: &Project, workdir: &Workdir) -> StepResult<DatasetLayout> {
        let dataset = self
            .store
            .get_dataset_by_project(project.id)
            .await
            .step("load")?
            .ok_or_else(|| ForgeError::NotFound(format!("dataset row for project {}", project.id)))
            .step("load")?;

        let uri = ObjectUri::parse(&dataset.object_uri).step("load")?;
        let archive_name = match uri.extension() {
            Some(ext) => format!("archive.{ext}"),
            None => "archive.zip".to_string(),
        };
        let archive_path = workdir.join(&archive_name);
        self.objects
            .download(&uri, &archive_path)
            .await
            .step("download_archive")?;

        let extracted = workdir.join("dataset");
        let layout = {
            let archive_path = archive_path.clone();
            let extracted = extracted.clone();
            tokio::task::spawn_blocking(move || -> Result<DatasetLayout> {
                extract_archive(&archive_path, &extracted)?;
                discover_layout(&extracted)
            })
            .await
            .map_err(|e| ForgeError::Internal(anyhow::anyhow!("extraction task failed: {e}")))
            .step("extract")?
            .step("validate_layout")?
        };
        Ok(layout)
    }

    async fn run_training(
        &self,
        project: &Project,
        layout: DatasetLayout,
        weights_path: PathBuf,
    ) -> Result<training::TrainOutcome> {
        let spec = self.train_spec(project, layout.num_classes());
        info!(
            "project {}: training {} on {} classes ({} train / {} val images), {} epochs",
            project.id,
            spec.arch,
            spec.num_classes,
            layout.train.len(),
            layout.val.len(),
            spec.epochs
        );

        let handle = tokio::runtime::Handle::current();
        let store = self.store.clone();
        let project_id = project.id;
        tokio::task::spawn_blocking(move || {
            training::train_classifier(&layout, &spec, &weights_path, |stats| {
                let val = stats
                    .val_loss
                    .map(|v| format!("{v:.4}"))
                    .unwrap_or_else(|| "n/a".to_string());
                let message = format!(
                    "epoch {}/{}: train loss {:.4}, val loss {val}",
                    stats.epoch, stats.epochs, stats.train_loss
                );
                let _ = handle.block_on(store.append_log(
                    Some(project_id),
                    AgentName::Training,
                    LogLevel::Info,
                    &message,
                ));
            })
        })
        .await
        .map_err(|e| ForgeError::Internal(anyhow::anyhow!("training task panicked: {e}")))?
    }
}

#[async_trait]
impl WorkerAgent for TrainingAgent {
    fn name(&self) -> AgentName {
        AgentName::Training
    }

    fn owned_status(&self) -> ProjectStatus {
        ProjectStatus::PendingTraining
    }

    fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    async fn process(&self, project: Project) -> StepResult<()> {
        // A Model row left behind by an earlier run means training finished
        // and only the advance remains.
        let existing = self
            .store
            .get_model_by_project(project.id)
            .await
            .step("load")?;
        if existing.is_none() {
            let workdir = Workdir::create("training", project.id).step("workdir")?;
            let layout = self.prepare_dataset(&project, &workdir).await?;

            let mut patch = Metadata::new();
            patch.insert("num_classes".to_string(), json!(layout.num_classes()));
            patch.insert("class_names".to_string(), json!(layout.class_names));
            self.store
                .update_project_metadata(project.id, patch)
                .await
                .step("record_classes")?;

            let weights_path = workdir.join("model.safetensors");
            let outcome = self
                .run_training(&project, layout, weights_path.clone())
                .await
                .step("train")?;

            let uri = self
                .objects
                .artifact_uri(&format!("models/{}_model.safetensors", project.slug()))
                .step("upload_weights")?;
            self.objects
                .upload(&weights_path, &uri)
                .await
                .step("upload_weights")?;

            let mut model_metadata = Metadata::new();
            model_metadata.insert("epochs".to_string(), json!(outcome.epochs));
            model_metadata.insert("final_loss".to_string(), json!(outcome.final_loss));
            if let Some(val_loss) = outcome.final_val_loss {
                model_metadata.insert("final_val_loss".to_string(), json!(val_loss));
            }
            model_metadata.insert(
                "training_seconds".to_string(),
                json!(outcome.training_seconds),
            );
            self.store
                .insert_model(NewTrainedModel {
                    project_id: project.id,
                    name: format!("{} ({})", project.name, project.preferred_model()),
                    framework: project.framework,
                    object_uri: uri.to_string(),
                    metadata: model_metadata,
                })
                .await
                .step("record_model")?;
        } else {
            info!(
                "project {}: model row already present, re-attempting status advance",
                project.id
            );
        }

        advance_with_retries(
            &self.store,
            project.id,
            ProjectStatus::PendingTraining,
            ProjectStatus::PendingEvaluation,
            Metadata::new(),
            self.advance_retries,
        )
        .await
        .step("advance_status")?;

        let message = format!(
            "Training for \"{}\" is complete; evaluation is underway.",
            project.name
        );
        if let Err(e) = self
            .store
            .write_message(project.user_id, MessageRole::Assistant, &message)
            .await
        {
            warn!("project {}: could not write user message: {e}", project.id);
        }

        Ok(())
    }
}
