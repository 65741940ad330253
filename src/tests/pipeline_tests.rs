use super::test_helpers::{
    local_objects, ArchiveProvider, CannedLlm, FaultInjectingStore,
};
use crate::agents::{run_workflow, DatasetAgent, EvaluationAgent, TrainingAgent};
use crate::config::TrainingConfig;
use crate::models::{LogLevel, ProjectStatus};
use crate::objects::ObjectUri;
use crate::planner::{PlanRequest, PlannerAgent};
use crate::store::{MemoryStore, Store};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const STEP_TIMEOUT: Duration = Duration::from_secs(600);

fn dataset_agent(
    store: Arc<dyn Store>,
    objects: Arc<crate::objects::ObjectStoreClient>,
    provider: Arc<ArchiveProvider>,
) -> DatasetAgent {
    DatasetAgent::new(store, objects, provider, 50.0, 3, STEP_TIMEOUT)
}

fn training_agent(
    store: Arc<dyn Store>,
    objects: Arc<crate::objects::ObjectStoreClient>,
) -> TrainingAgent {
    TrainingAgent::new(
        store,
        objects,
        TrainingConfig {
            batch_size: 4,
            default_epochs: 1,
            default_learning_rate: 1e-3,
            pretrained_weights_dir: None,
        },
        3,
        STEP_TIMEOUT,
    )
}

fn evaluation_agent(
    store: Arc<dyn Store>,
    objects: Arc<crate::objects::ObjectStoreClient>,
) -> EvaluationAgent {
    EvaluationAgent::new(store, objects, 4, 3, STEP_TIMEOUT)
}

/// The full happy path: one utterance ends as a completed project with a
/// downloadable bundle, and the observed status sequence is exactly the
/// pipeline order.
#[tokio::test(flavor = "multi_thread")]
async fn utterance_to_completed_project() {
    let objects_dir = tempfile::TempDir::new().unwrap();
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn Store> = store.clone();
    let objects = local_objects(&objects_dir);

    // Plan
    let planner = PlannerAgent::new(store_dyn.clone(), Arc::new(CannedLlm));
    let outcome = planner
        .handle_message(PlanRequest {
            user_external_id: "auth0|alice".to_string(),
            utterance: "Train a flower classifier with dataset not more than 1GB".to_string(),
            session_id: None,
        })
        .await
        .unwrap();
    assert_eq!(outcome.plan.max_dataset_size_gb, 1.0);
    assert_eq!(
        outcome.plan.search_keywords,
        vec!["flower".to_string(), "classifier".to_string()]
    );

    let mut observed = Vec::new();
    let project = store.get_project(outcome.project_id).await.unwrap().unwrap();
    observed.push(project.status);

    // Dataset
    let provider = Arc::new(ArchiveProvider::flowers());
    run_workflow(
        &dataset_agent(store_dyn.clone(), objects.clone(), provider.clone()),
        project.clone(),
    )
    .await
    .unwrap();
    let project = store.get_project(project.id).await.unwrap().unwrap();
    observed.push(project.status);

    // Training
    run_workflow(
        &training_agent(store_dyn.clone(), objects.clone()),
        project.clone(),
    )
    .await
    .unwrap();
    let project = store.get_project(project.id).await.unwrap().unwrap();
    observed.push(project.status);

    // Evaluation
    run_workflow(
        &evaluation_agent(store_dyn.clone(), objects.clone()),
        project.clone(),
    )
    .await
    .unwrap();
    let project = store.get_project(project.id).await.unwrap().unwrap();
    observed.push(project.status);

    assert_eq!(
        observed,
        vec![
            ProjectStatus::PendingDataset,
            ProjectStatus::PendingTraining,
            ProjectStatus::PendingEvaluation,
            ProjectStatus::Completed,
        ]
    );

    // Artifacts all resolve, and the bundle labels cover both classes.
    let dataset = store
        .get_dataset_by_project(project.id)
        .await
        .unwrap()
        .unwrap();
    let model = store.get_model_by_project(project.id).await.unwrap().unwrap();
    for uri in [
        dataset.object_uri.as_str(),
        model.object_uri.as_str(),
        project.bundle_uri().unwrap(),
    ] {
        let parsed = ObjectUri::parse(uri).unwrap();
        assert!(
            objects.head(&parsed).await.unwrap().unwrap_or(0) > 0,
            "stored URI {uri} must resolve"
        );
    }
    assert!(model.accuracy.is_some());

    let bundle = ObjectUri::parse(project.bundle_uri().unwrap()).unwrap();
    let fetched = objects_dir.path().join("bundle.zip");
    objects.download(&bundle, &fetched).await.unwrap();
    let mut archive = zip::ZipArchive::new(std::fs::File::open(&fetched).unwrap()).unwrap();
    let mut labels = String::new();
    std::io::Read::read_to_string(&mut archive.by_name("labels.json").unwrap(), &mut labels)
        .unwrap();
    let labels: Vec<String> = serde_json::from_str(&labels).unwrap();
    assert!(labels.len() >= 2);
    assert_eq!(labels.len(), project.num_classes().unwrap());

    // The whole pipeline downloaded the archive from the provider once.
    assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
}

/// An empty search result fails the project with `no_candidate`.
#[tokio::test]
async fn empty_search_fails_with_no_candidate() {
    let objects_dir = tempfile::TempDir::new().unwrap();
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn Store> = store.clone();
    let objects = local_objects(&objects_dir);

    let planner = PlannerAgent::new(store_dyn.clone(), Arc::new(CannedLlm));
    let outcome = planner
        .handle_message(PlanRequest {
            user_external_id: "auth0|alice".to_string(),
            utterance: "Train a classifier for rare-extinct-species-X".to_string(),
            session_id: None,
        })
        .await
        .unwrap();
    let project = store.get_project(outcome.project_id).await.unwrap().unwrap();

    let agent = dataset_agent(store_dyn, objects, Arc::new(ArchiveProvider::empty()));
    run_workflow(&agent, project.clone()).await.unwrap_err();

    let project = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
    assert_eq!(project.metadata["error"]["kind"], "no_candidate");
}

/// Two dataset workers race the same row; exactly one advances, the other
/// exits without modifying the project and logs at info.
#[tokio::test(flavor = "multi_thread")]
async fn claim_race_has_exactly_one_winner() {
    let objects_dir = tempfile::TempDir::new().unwrap();
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn Store> = store.clone();
    let objects = local_objects(&objects_dir);

    let planner = PlannerAgent::new(store_dyn.clone(), Arc::new(CannedLlm));
    let outcome = planner
        .handle_message(PlanRequest {
            user_external_id: "auth0|alice".to_string(),
            utterance: "Train a flower classifier".to_string(),
            session_id: None,
        })
        .await
        .unwrap();
    let project = store.get_project(outcome.project_id).await.unwrap().unwrap();

    // Two independent agent instances, as two processes would be.
    let agent_a = Arc::new(dataset_agent(
        store_dyn.clone(),
        objects.clone(),
        Arc::new(ArchiveProvider::flowers()),
    ));
    let agent_b = Arc::new(dataset_agent(
        store_dyn.clone(),
        objects.clone(),
        Arc::new(ArchiveProvider::flowers()),
    ));

    let (ra, rb) = tokio::join!(
        {
            let project = project.clone();
            let agent = agent_a.clone();
            async move { run_workflow(agent.as_ref(), project).await }
        },
        {
            let project = project.clone();
            let agent = agent_b.clone();
            async move { run_workflow(agent.as_ref(), project).await }
        }
    );

    // Both exits are clean: the loser's conflict is swallowed by the
    // failure policy after an info log.
    assert!(ra.is_ok());
    assert!(rb.is_ok());

    let reloaded = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, ProjectStatus::PendingTraining);
    assert!(store
        .get_dataset_by_project(project.id)
        .await
        .unwrap()
        .is_some());
}

/// The integrity case: a permanent store fault on the final advance, after
/// the Dataset row is recorded, must leave the project in `pending_dataset`
/// with a warning log; a re-run advances it without touching the provider
/// again.
#[tokio::test(flavor = "multi_thread")]
async fn smart_failure_preserves_dataset_and_resumes() {
    let objects_dir = tempfile::TempDir::new().unwrap();
    let inner = Arc::new(MemoryStore::new());
    let faulty = Arc::new(FaultInjectingStore::new(inner.clone()));
    let store_dyn: Arc<dyn Store> = faulty.clone();
    let objects = local_objects(&objects_dir);

    let planner = PlannerAgent::new(store_dyn.clone(), Arc::new(CannedLlm));
    let outcome = planner
        .handle_message(PlanRequest {
            user_external_id: "auth0|alice".to_string(),
            utterance: "Train a flower classifier".to_string(),
            session_id: None,
        })
        .await
        .unwrap();
    let project = inner.get_project(outcome.project_id).await.unwrap().unwrap();

    let provider = Arc::new(ArchiveProvider::flowers());
    let agent = dataset_agent(store_dyn.clone(), objects.clone(), provider.clone());

    // First run: artifact work succeeds, the advance hits the injected fault.
    faulty.fail_advance.store(true, Ordering::SeqCst);
    let err = run_workflow(&agent, project.clone()).await.unwrap_err();
    assert_eq!(err.kind(), crate::ErrorKind::Integrity);

    let stuck = inner.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(stuck.status, ProjectStatus::PendingDataset);
    assert!(inner
        .get_dataset_by_project(project.id)
        .await
        .unwrap()
        .is_some());
    let logs = inner.get_logs_by_project(project.id, 50).await.unwrap();
    assert!(logs.iter().any(|l| {
        l.log_level == LogLevel::Warning && l.message.contains("status update failed")
    }));
    assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);

    // Second run: the fault is gone; the pre-existing Dataset row short-
    // circuits search/download and only the advance re-runs.
    faulty.fail_advance.store(false, Ordering::SeqCst);
    run_workflow(&agent, stuck).await.unwrap();

    let recovered = inner.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, ProjectStatus::PendingTraining);
    assert_eq!(provider.fetches.load(Ordering::SeqCst), 1, "no re-download");
}

/// A failed project stays failed; no observer ever sees a backward
/// transition.
#[tokio::test]
async fn failed_projects_are_terminal() {
    let objects_dir = tempfile::TempDir::new().unwrap();
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn Store> = store.clone();
    let objects = local_objects(&objects_dir);

    let planner = PlannerAgent::new(store_dyn.clone(), Arc::new(CannedLlm));
    let outcome = planner
        .handle_message(PlanRequest {
            user_external_id: "auth0|alice".to_string(),
            utterance: "Train a flower classifier".to_string(),
            session_id: None,
        })
        .await
        .unwrap();
    let project = store.get_project(outcome.project_id).await.unwrap().unwrap();

    let agent = dataset_agent(store_dyn, objects, Arc::new(ArchiveProvider::empty()));
    run_workflow(&agent, project.clone()).await.unwrap_err();

    // A late worker still holding the old row loses the conditional update.
    let outcome = store
        .advance_status(
            project.id,
            ProjectStatus::PendingDataset,
            ProjectStatus::PendingTraining,
            crate::models::Metadata::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome, crate::store::AdvanceOutcome::NotClaimed);
    let reloaded = store.get_project(project.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, ProjectStatus::Failed);
}
