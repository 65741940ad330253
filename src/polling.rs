//! Shared poll-and-claim runtime for the dataset, training, and evaluation
//! agents.
//!
//! Each tick fetches candidate projects in the agent's owned status (oldest
//! `updated_at` first), skips ids already in flight, and runs the workflow
//! bodies sequentially. The in-flight set prevents duplicate processing
//! within the process; cross-process duplication is resolved by the
//! conditional status advance, not here.

use crate::agents::{run_workflow, WorkerAgent};
use crate::models::{AgentName, LogLevel};
use crate::{ForgeError, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct PollingStatus {
    pub is_running: bool,
    pub poll_interval: u64,
    pub processed_projects_count: u64,
}

pub struct PollingRuntime {
    agent: Arc<dyn WorkerAgent>,
    poll_interval: Duration,
    batch_limit: u32,
    in_flight: Mutex<HashSet<Uuid>>,
    processed: AtomicU64,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollingRuntime {
    pub fn new(agent: Arc<dyn WorkerAgent>, poll_interval: Duration, batch_limit: u32) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            agent,
            poll_interval,
            batch_limit: batch_limit.max(1),
            in_flight: Mutex::new(HashSet::new()),
            processed: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown,
            handle: Mutex::new(None),
        }
    }

    pub fn status(&self) -> PollingStatus {
        PollingStatus {
            is_running: self.running.load(Ordering::SeqCst),
            poll_interval: self.poll_interval.as_secs(),
            processed_projects_count: self.processed.load(Ordering::SeqCst),
        }
    }

    /// Start the poll loop. Idempotent: a second start while running is a
    /// no-op.
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        // send_replace: a plain send fails with no live receivers, which
        // would leave a stale stop signal behind after a stop/start cycle.
        self.shutdown.send_replace(false);

        let agent_name = self.agent.name();
        info!(
            "{agent_name} polling started (interval {}s, batch limit {})",
            self.poll_interval.as_secs(),
            self.batch_limit
        );
        let _ = self
            .agent
            .store()
            .append_log(
                None,
                agent_name,
                LogLevel::Info,
                &format!(
                    "polling started (interval {}s, batch limit {})",
                    self.poll_interval.as_secs(),
                    self.batch_limit
                ),
            )
            .await;

        let this = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.tick().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("{} polling stopped", this.agent.name());
        });
        *self.handle.lock().await = Some(task);
    }

    /// Stop the poll loop, letting any workflow in the current tick finish.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        if let Some(task) = self.handle.lock().await.take() {
            if let Err(e) = task.await {
                error!("{} poll loop join failed: {e}", self.agent.name());
            }
        }
    }

    async fn tick(&self) {
        let candidates = match self
            .agent
            .store()
            .get_projects_by_status(self.agent.owned_status(), self.batch_limit * 2)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("{} poll fetch failed: {e}", self.agent.name());
                return;
            }
        };

        let mut taken = 0u32;
        for project in candidates {
            if taken >= self.batch_limit {
                break;
            }
            match self.process_one(project.id).await {
                Ok(()) => taken += 1,
                Err(e) if e.kind() == crate::ErrorKind::Conflict => {
                    // Already in flight (e.g. a manual trigger); skip.
                }
                Err(_) => taken += 1,
            }
        }
    }

    /// Run the workflow for one project, guarded by the in-flight set. Used
    /// by both the poll loop and manual HTTP triggers.
    pub async fn process_one(&self, project_id: Uuid) -> Result<()> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(project_id) {
                return Err(ForgeError::Conflict(format!(
                    "project {project_id} is already being processed"
                )));
            }
        }

        let result = async {
            let project = self
                .agent
                .store()
                .get_project(project_id)
                .await?
                .ok_or_else(|| ForgeError::NotFound(format!("project {project_id}")))?;
            if project.status != self.agent.owned_status() {
                return Err(ForgeError::Conflict(format!(
                    "project {project_id} is in {}, not {}",
                    project.status,
                    self.agent.owned_status()
                )));
            }
            run_workflow(self.agent.as_ref(), project).await
        }
        .await;

        self.in_flight.lock().await.remove(&project_id);
        self.processed.fetch_add(1, Ordering::SeqCst);
        result
    }

    pub fn agent_name(&self) -> AgentName {
        self.agent.name()
    }
}
