use anyhow::Result;
use clap::{Parser, ValueEnum};
use modelforge::agents::{DatasetAgent, EvaluationAgent, TrainingAgent, WorkerAgent};
use modelforge::config::Config;
use modelforge::dataset_source::HttpDatasetProvider;
use modelforge::gateway::Gateway;
use modelforge::llm::HttpLlmClient;
use modelforge::objects::ObjectStoreClient;
use modelforge::planner::PlannerAgent;
use modelforge::polling::PollingRuntime;
use modelforge::service::{planner_router, AgentService};
use modelforge::store::{MemoryStore, PgStore, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Service {
    /// Run every service in one process (local development)
    All,
    Gateway,
    Planner,
    Dataset,
    Training,
    Evaluation,
}

#[derive(Debug, Parser)]
#[command(name = "modelforge", about = "AutoML pipeline orchestrator")]
struct Args {
    /// Which service this process runs
    #[arg(long, value_enum, default_value = "all")]
    service: Service,
}

fn wants(selected: Service, service: Service) -> bool {
    selected == Service::All || selected == service
}

async fn serve(name: &'static str, router: axum::Router, host: String, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    info!("{name} listening on {host}:{port}");
    axum::serve(listener, router).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!("starting ModelForge ({:?})", args.service);

    let store: Arc<dyn Store> = if config.store.is_memory() {
        info!("using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(PgStore::connect(&config.store.database_url).await?)
    };
    let objects = Arc::new(ObjectStoreClient::new(&config.objects)?);
    let step_timeout = Duration::from_secs(config.polling.step_timeout_seconds);
    let poll_interval = Duration::from_secs(config.polling.poll_interval_seconds);

    let planner = Arc::new(PlannerAgent::new(
        store.clone(),
        Arc::new(HttpLlmClient::new(config.llm.clone())?),
    ));

    let mut servers = JoinSet::new();
    let mut runtimes: Vec<Arc<PollingRuntime>> = Vec::new();
    let host = config.server.host.clone();

    if wants(args.service, Service::Gateway) {
        let gateway = Gateway::new(
            store.clone(),
            objects.clone(),
            planner.clone(),
            host.clone(),
            config.server.gateway_port,
            config.server.allowed_origins.clone(),
        );
        servers.spawn(async move { gateway.run().await.map_err(anyhow::Error::from) });
    }

    if wants(args.service, Service::Planner) {
        let router = planner_router(planner.clone());
        let host = host.clone();
        let port = config.server.planner_port;
        servers.spawn(async move { serve("planner", router, host, port).await });
    }

    let mut worker = |agent: Arc<dyn WorkerAgent>, batch_limit: u32, port: u16| {
        let runtime = Arc::new(PollingRuntime::new(agent, poll_interval, batch_limit));
        runtimes.push(runtime.clone());
        let router = AgentService::new(store.clone(), runtime).router();
        let host = host.clone();
        servers.spawn(async move { serve("agent", router, host, port).await });
    };

    if wants(args.service, Service::Dataset) {
        let provider = Arc::new(HttpDatasetProvider::new(&config.dataset.provider_base_url)?);
        worker(
            Arc::new(DatasetAgent::new(
                store.clone(),
                objects.clone(),
                provider,
                config.dataset.max_dataset_size_gb,
                config.polling.advance_status_retries,
                step_timeout,
            )),
            config.polling.dataset_batch_limit,
            config.server.dataset_port,
        );
    }

    if wants(args.service, Service::Training) {
        worker(
            Arc::new(TrainingAgent::new(
                store.clone(),
                objects.clone(),
                config.training.clone(),
                config.polling.advance_status_retries,
                step_timeout,
            )),
            config.polling.training_batch_limit,
            config.server.training_port,
        );
    }

    if wants(args.service, Service::Evaluation) {
        worker(
            Arc::new(EvaluationAgent::new(
                store.clone(),
                objects.clone(),
                config.training.batch_size,
                config.polling.advance_status_retries,
                step_timeout,
            )),
            config.polling.evaluation_batch_limit,
            config.server.evaluation_port,
        );
    }

    for runtime in &runtimes {
        runtime.clone().start().await;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, draining poll loops");
        }
        Some(result) = servers.join_next() => {
            match result {
                Ok(Ok(())) => error!("a service exited unexpectedly"),
                Ok(Err(e)) => error!("a service failed: {e}"),
                Err(e) => error!("a service panicked: {e}"),
            }
        }
    }

    // Bounded drain: each runtime finishes its current workflow then stops.
    for runtime in &runtimes {
        runtime.stop().await;
    }
    servers.shutdown().await;
    info!("ModelForge stopped");

    Ok(())
}
