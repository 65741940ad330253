//! Evaluation agent: owns `pending_evaluation`.

use super::{advance_with_retries, StepContext, StepResult, WorkerAgent};
use crate::archive::extract_archive;
use crate::bundle::assemble_bundle;
use crate::models::{
    AgentName, LogLevel, MessageRole, Metadata, Project, ProjectStatus, TrainedModel,
};
use crate::objects::{ObjectStoreClient, ObjectUri};
use crate::store::Store;
use crate::training::{self, discover_layout, DatasetLayout, EvaluationReport};
use crate::workdir::Workdir;
use crate::{ForgeError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct EvaluationAgent {
    store: Arc<dyn Store>,
    objects: Arc<ObjectStoreClient>,
    batch_size: usize,
    advance_retries: u32,
    step_timeout: Duration,
}

impl EvaluationAgent {
    pub fn new(
        store: Arc<dyn Store>,
        objects: Arc<ObjectStoreClient>,
        batch_size: usize,
        advance_retries: u32,
        step_timeout: Duration,
    ) -> Self {
        Self {
            store,
            objects,
            batch_size,
            advance_retries,
            step_timeout,
        }
    }

    async fn fetch_inputs(
        &self,
        project: &Project,
        workdir: &Workdir,
    ) -> StepResult<(TrainedModel, DatasetLayout, PathBuf)> {
        let dataset = self
            .store
            .get_dataset_by_project(project.id)
            .await
            .step("load")?
            .ok_or_else(|| ForgeError::NotFound(format!("dataset row for project {}", project.id)))
            .step("load")?;
        let model = self
            .store
            .get_model_by_project(project.id)
            .await
            .step("load")?
            .ok_or_else(|| ForgeError::NotFound(format!("model row for project {}", project.id)))
            .step("load")?;

        let archive_uri = ObjectUri::parse(&dataset.object_uri).step("load")?;
        let archive_name = match archive_uri.extension() {
            Some(ext) => format!("archive.{ext}"),
            None => "archive.zip".to_string(),
        };
        let archive_path = workdir.join(&archive_name);
        self.objects
            .download(&archive_uri, &archive_path)
            .await
            .step("download_archive")?;

        let weights_uri = ObjectUri::parse(&model.object_uri).step("load")?;
        let weights_path = workdir.join("model.safetensors");
        self.objects
            .download(&weights_uri, &weights_path)
            .await
            .step("download_weights")?;

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

        Ok((model, layout, weights_path))
    }

    async fn score(
        &self,
        project: &Project,
        layout: &DatasetLayout,
        weights_path: PathBuf,
    ) -> Result<EvaluationReport> {
        // The class order recorded at training time is authoritative for the
        // model's output indices.
        let class_names = project
            .class_names()
            .unwrap_or_else(|| layout.class_names.clone());

        if layout.test.is_empty() {
            warn!(
                "project {}: no test/ split, scoring against val/ instead",
                project.id
            );
            self.store
                .append_log(
                    Some(project.id),
                    AgentName::Evaluation,
                    LogLevel::Warning,
                    "no test split available; scoring against the validation split",
                )
                .await?;
        }
        let samples = layout
            .scoring_split()
            .ok_or_else(|| ForgeError::BadDatasetLayout {
                detail: "neither test nor val split has any samples".to_string(),
            })?
            .to_vec();

        let arch = project.preferred_model();
        let batch_size = self.batch_size;
        tokio::task::spawn_blocking(move || {
            training::evaluate_classifier(arch, &class_names, &weights_path, &samples, batch_size)
        })
        .await
        .map_err(|e| ForgeError::Internal(anyhow::anyhow!("evaluation task panicked: {e}")))?
    }
}

#[async_trait]
impl WorkerAgent for EvaluationAgent {
    fn name(&self) -> AgentName {
        AgentName::Evaluation
    }

    fn owned_status(&self) -> ProjectStatus {
        ProjectStatus::PendingEvaluation
    }

    fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    async fn process(&self, project: Project) -> StepResult<()> {
        // A bundle URI in metadata means a previous run got all the way to
        // the advance; skip straight there.
        if project.bundle_uri().is_none() {
            let workdir = Workdir::create("evaluation", project.id).step("workdir")?;
            let (model, layout, weights_path) = self.fetch_inputs(&project, &workdir).await?;

            let report = self
                .score(&project, &layout, weights_path.clone())
                .await
                .step("score")?;
            info!(
                "project {}: accuracy {:.4}, macro F1 {:.4}",
                project.id, report.accuracy, report.macro_f1
            );

            let report_value = serde_json::to_value(&report)
                .map_err(ForgeError::from)
                .step("record_evaluation")?;
            let mut model_patch = Metadata::new();
            model_patch.insert("eval".to_string(), report_value);
            self.store
                .update_model_evaluation(model.id, report.accuracy, model_patch)
                .await
                .step("record_evaluation")?;
            self.store
                .append_log(
                    Some(project.id),
                    AgentName::Evaluation,
                    LogLevel::Info,
                    &format!(
                        "scored model: accuracy {:.4}, macro precision {:.4}, \
                         macro recall {:.4}, macro F1 {:.4}",
                        report.accuracy,
                        report.macro_precision,
                        report.macro_recall,
                        report.macro_f1
                    ),
                )
                .await
                .step("record_evaluation")?;

            let class_names = project
                .class_names()
                .unwrap_or_else(|| layout.class_names.clone());
            let arch = project.preferred_model();
            let project_name = project.name.clone();
            let bundle_dir = workdir.path().to_path_buf();
            let zip_path = tokio::task::spawn_blocking(move || {
                assemble_bundle(&bundle_dir, &weights_path, &class_names, arch, &project_name)
            })
            .await
            .map_err(|e| ForgeError::Internal(anyhow::anyhow!("bundle task failed: {e}")))
            .step("bundle")?
            .step("bundle")?;

            let bundle_uri = self
                .objects
                .artifact_uri(&format!("bundles/{}.zip", project.slug()))
                .step("upload_bundle")?;
            self.objects
                .upload(&zip_path, &bundle_uri)
                .await
                .step("upload_bundle")?;

            // Bundle URI lands in metadata before the status flip advertises
            // the project as completed.
            let mut patch = Metadata::new();
            patch.insert("bundle_uri".to_string(), json!(bundle_uri.to_string()));
            patch.insert("accuracy".to_string(), json!(report.accuracy));
            self.store
                .update_project_metadata(project.id, patch)
                .await
                .step("record_bundle")?;
        } else {
            info!(
                "project {}: bundle already recorded, re-attempting status advance",
                project.id
            );
        }

        advance_with_retries(
            &self.store,
            project.id,
            ProjectStatus::PendingEvaluation,
            ProjectStatus::Completed,
            Metadata::new(),
            self.advance_retries,
        )
        .await
        .step("advance_status")?;

        let accuracy = self
            .store
            .get_model_by_project(project.id)
            .await
            .ok()
            .flatten()
            .and_then(|m| m.accuracy)
            .unwrap_or(0.0);
        let message = format!(
            "Your model for \"{}\" is ready: top-1 accuracy {:.1}%. \
             Download the bundle from your project page.",
            project.name,
            accuracy * 100.0
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
