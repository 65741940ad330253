//! Dataset agent: owns `pending_dataset`.

use super::{advance_with_retries, StepContext, StepResult, WorkerAgent};
use crate::dataset_source::{rank_candidates, DatasetCandidate, DatasetProvider};
use crate::models::{
    AgentName, Dataset, LogLevel, MessageRole, Metadata, NewDataset, Project, ProjectStatus,
};
use crate::objects::{human_size, ObjectStoreClient};
use crate::store::Store;
use crate::workdir::Workdir;
use crate::{ErrorKind, ForgeError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Bytes per (decimal) gigabyte, matching the MB/GB arithmetic the planner
/// uses for size phrases.
const BYTES_PER_GB: f64 = 1_000_000_000.0;

pub struct DatasetAgent {
    store: Arc<dyn Store>,
    objects: Arc<ObjectStoreClient>,
    provider: Arc<dyn DatasetProvider>,
    /// Hard ceiling on top of whatever the plan requests.
    max_dataset_size_gb: f64,
    advance_retries: u32,
    step_timeout: Duration,
}

impl DatasetAgent {
    pub fn new(
        store: Arc<dyn Store>,
        objects: Arc<ObjectStoreClient>,
        provider: Arc<dyn DatasetProvider>,
        max_dataset_size_gb: f64,
        advance_retries: u32,
        step_timeout: Duration,
    ) -> Self {
        Self {
            store,
            objects,
            provider,
            max_dataset_size_gb,
            advance_retries,
            step_timeout,
        }
    }

    fn size_cap_bytes(&self, project: &Project) -> u64 {
        let requested = project
            .max_dataset_size_gb()
            .unwrap_or(self.max_dataset_size_gb);
        let capped = requested.min(self.max_dataset_size_gb);
        (capped * BYTES_PER_GB) as u64
    }

    async fn pick_candidate(&self, project: &Project, cap_bytes: u64) -> Result<DatasetCandidate> {
        let candidates = self.provider.search(&project.search_keywords).await?;
        let total = candidates.len();
        let mut ranked = rank_candidates(candidates, &project.search_keywords, cap_bytes);
        if ranked.is_empty() {
            return Err(ForgeError::NoCandidate {
                detail: format!(
                    "{total} search hit(s) for [{}], none within {}",
                    project.search_keywords.join(", "),
                    human_size(cap_bytes)
                ),
            });
        }
        Ok(ranked.remove(0))
    }

    /// Acquire the archive and record the Dataset row. Split out so the
    /// resume path can skip it entirely.
    async fn acquire_dataset(&self, project: &Project) -> StepResult<Dataset> {
        let cap_bytes = self.size_cap_bytes(project);
        let candidate = self.pick_candidate(project, cap_bytes).await.step("search")?;
        info!(
            "project {}: selected dataset \"{}\" ({})",
            project.id,
            candidate.name,
            human_size(candidate.size_bytes)
        );
        self.store
            .append_log(
                Some(project.id),
                AgentName::Dataset,
                LogLevel::Info,
                &format!(
                    "selected dataset \"{}\" ({}) from {}",
                    candidate.name,
                    human_size(candidate.size_bytes),
                    project.dataset_source
                ),
            )
            .await
            .step("search")?;

        let workdir = Workdir::create("dataset", project.id).step("download")?;
        let archive_name = format!("dataset.{}", candidate.format);
        let archive_path = workdir.join(&archive_name);
        let downloaded = self
            .provider
            .fetch(&candidate, &archive_path)
            .await
            .step("download")?;
        if downloaded == 0 {
            return Err(ForgeError::Dependency {
                service: "dataset_source".to_string(),
                detail: format!("downloaded archive for \"{}\" is empty", candidate.name),
            })
            .step("download");
        }

        let uri = self
            .objects
            .artifact_uri(&format!("raw/{}.{}", project.slug(), candidate.format))
            .step("upload")?;
        self.objects
            .upload(&archive_path, &uri)
            .await
            .step("upload")?;

        let dataset = self
            .store
            .insert_dataset(NewDataset {
                project_id: project.id,
                name: candidate.name.clone(),
                object_uri: uri.to_string(),
                size: human_size(downloaded),
                source: project.dataset_source,
            })
            .await
            .step("record_dataset")?;

        Ok(dataset)
    }
}

#[async_trait]
impl WorkerAgent for DatasetAgent {
    fn name(&self) -> AgentName {
        AgentName::Dataset
    }

    fn owned_status(&self) -> ProjectStatus {
        ProjectStatus::PendingDataset
    }

    fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    async fn process(&self, project: Project) -> StepResult<()> {
        // Resume rule: a Dataset row left behind by an earlier run means the
        // artifact work is done and only the status advance remains.
        let existing = self
            .store
            .get_dataset_by_project(project.id)
            .await
            .step("load")?;
        let dataset = match existing {
            Some(dataset) => {
                info!(
                    "project {}: dataset row already present, re-attempting status advance",
                    project.id
                );
                dataset
            }
            None => self.acquire_dataset(&project).await?,
        };

        // Artifact first, status flip second. A permanent failure here with
        // the row already written is the integrity case, not a project
        // failure.
        let advance = advance_with_retries(
            &self.store,
            project.id,
            ProjectStatus::PendingDataset,
            ProjectStatus::PendingTraining,
            Metadata::new(),
            self.advance_retries,
        )
        .await;
        if let Err(e) = advance {
            return match e.kind() {
                ErrorKind::Conflict | ErrorKind::NotFound => Err(e).step("advance_status"),
                _ => Err(ForgeError::Integrity {
                    detail: format!("dataset row {} exists but advance failed: {e}", dataset.id),
                })
                .step("advance_status"),
            };
        }

        let message = format!(
            "Found a dataset for \"{}\": {} ({}). Training starts next.",
            project.name, dataset.name, dataset.size
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::run_workflow;
    use crate::config::{ObjectBackendKind, ObjectsConfig};
    use crate::models::{DatasetSourceKind, Framework, NewProject, TaskType};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::path::Path;
    use uuid::Uuid;

    struct StubProvider {
        candidates: Vec<DatasetCandidate>,
    }

    #[async_trait]
    impl DatasetProvider for StubProvider {
        async fn search(&self, _keywords: &[String]) -> Result<Vec<DatasetCandidate>> {
            Ok(self.candidates.clone())
        }

        async fn fetch(&self, _candidate: &DatasetCandidate, dest: &Path) -> Result<u64> {
            // Minimal valid zip produced on the fly.
            let file = std::fs::File::create(dest)?;
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("train/rose/a.jpg", options)?;
            std::io::Write::write_all(&mut writer, b"fake")?;
            writer.finish()?;
            Ok(std::fs::metadata(dest)?.len())
        }
    }

    fn objects_client(dir: &tempfile::TempDir) -> Arc<ObjectStoreClient> {
        Arc::new(
            ObjectStoreClient::new(&ObjectsConfig {
                backend: ObjectBackendKind::Local,
                root: dir.path().to_path_buf(),
                buckets: vec!["modelforge".to_string()],
                default_bucket: "modelforge".to_string(),
                download_retries: 2,
                upload_retries: 2,
            })
            .unwrap(),
        )
    }

    async fn seeded_project(store: &Arc<MemoryStore>, size_cap_gb: f64) -> Project {
        let mut metadata = Metadata::new();
        metadata.insert("max_dataset_size_gb".to_string(), json!(size_cap_gb));
        store
            .insert_project(NewProject {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                name: "flower classifier".to_string(),
                task_type: TaskType::ImageClassification,
                framework: Framework::Pytorch,
                dataset_source: DatasetSourceKind::Kaggle,
                search_keywords: vec!["flower".to_string()],
                status: ProjectStatus::PendingDataset,
                metadata,
            })
            .await
            .unwrap()
    }

    fn agent_with(
        store: Arc<MemoryStore>,
        objects: Arc<ObjectStoreClient>,
        candidates: Vec<DatasetCandidate>,
    ) -> DatasetAgent {
        DatasetAgent::new(
            store,
            objects,
            Arc::new(StubProvider { candidates }),
            50.0,
            3,
            Duration::from_secs(60),
        )
    }

    fn candidate(name: &str, size_bytes: u64) -> DatasetCandidate {
        DatasetCandidate {
            name: name.to_string(),
            download_url: format!("stub://{name}"),
            size_bytes,
            popularity: 1.0,
            description: String::new(),
            format: "zip".to_string(),
        }
    }

    #[tokio::test]
    async fn happy_path_records_dataset_and_advances() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let objects = objects_client(&dir);
        let project = seeded_project(&store, 1.0).await;
        let agent = agent_with(
            store.clone(),
            objects.clone(),
            vec![candidate("flower photos", 5_000_000)],
        );

        run_workflow(&agent, project.clone()).await.unwrap();

        let reloaded = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ProjectStatus::PendingTraining);

        let dataset = store
            .get_dataset_by_project(project.id)
            .await
            .unwrap()
            .expect("dataset row must exist");
        assert_eq!(dataset.name, "flower photos");

        // Stored URI resolves at the moment of write.
        let uri = crate::objects::ObjectUri::parse(&dataset.object_uri).unwrap();
        assert!(objects.head(&uri).await.unwrap().unwrap_or(0) > 0);

        let messages = store
            .get_messages_by_user(project.user_id, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn size_cap_filters_every_candidate() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let project = seeded_project(&store, 0.5).await;
        // 0.6 GB candidate against a 0.5 GB plan cap
        let agent = agent_with(
            store.clone(),
            objects_client(&dir),
            vec![candidate("flower photos", 600_000_000)],
        );

        let err = run_workflow(&agent, project.clone()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCandidate);

        let reloaded = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ProjectStatus::Failed);
        assert_eq!(reloaded.metadata["error"]["kind"], "no_candidate");
        assert!(store
            .get_dataset_by_project(project.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn empty_search_results_fail_with_no_candidate() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let project = seeded_project(&store, 1.0).await;
        let agent = agent_with(store.clone(), objects_client(&dir), vec![]);

        let err = run_workflow(&agent, project.clone()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCandidate);
    }

    #[tokio::test]
    async fn resume_skips_search_and_download_when_dataset_exists() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let project = seeded_project(&store, 1.0).await;
        store
            .insert_dataset(NewDataset {
                project_id: project.id,
                name: "already there".to_string(),
                object_uri: "file://modelforge/raw/already.zip".to_string(),
                size: "1.0 MB".to_string(),
                source: DatasetSourceKind::Kaggle,
            })
            .await
            .unwrap();

        // A provider that would fail loudly if consulted.
        struct PanickyProvider;
        #[async_trait]
        impl DatasetProvider for PanickyProvider {
            async fn search(&self, _k: &[String]) -> Result<Vec<DatasetCandidate>> {
                panic!("search must not run when a dataset row exists");
            }
            async fn fetch(&self, _c: &DatasetCandidate, _d: &Path) -> Result<u64> {
                panic!("fetch must not run when a dataset row exists");
            }
        }

        let agent = DatasetAgent::new(
            store.clone(),
            objects_client(&dir),
            Arc::new(PanickyProvider),
            50.0,
            3,
            Duration::from_secs(60),
        );

        run_workflow(&agent, project.clone()).await.unwrap();
        let reloaded = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ProjectStatus::PendingTraining);
    }
}
