//! LLM Gateway Server エントリポイント

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use llmgw::adapters::AdapterSet;
use llmgw::affinity::SessionAffinityTable;
use llmgw::balancer::Balancer;
use llmgw::config::{self, GatewayConfig};
use llmgw::dispatch::Dispatcher;
use llmgw::health::HealthMonitor;
use llmgw::history::HistoryRecorder;
use llmgw::registry::RunnerRegistry;
use llmgw::repo::{
    ConfigurationRepository, EndpointRepository, HistoryRepository,
    InMemoryConfigurationRepository, InMemoryEndpointRepository, InMemoryHistoryRepository,
    InMemoryRunnerRepository, RunnerRepository,
};
use llmgw::{logging, server, AppState};

/// Multi-tenant gateway for pools of Ollama/OpenAI-compatible LLM endpoints
#[derive(Debug, Parser)]
#[command(name = "llmgw", version)]
struct Args {
    /// YAML seed file with the initial endpoints and runners
    #[arg(long, env = "LLMGW_SEED_FILE")]
    seed: Option<PathBuf>,

    /// Listen address
    #[arg(long, env = "LLMGW_LISTEN_ADDR")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let args = Args::parse();

    let mut config = GatewayConfig::from_env();
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    let seed = match &args.seed {
        Some(path) => config::load_seed(path)?,
        None => {
            tracing::warn!("no seed file given, starting with an empty registry");
            Default::default()
        }
    };
    tracing::info!(
        endpoints = seed.endpoints.len(),
        runners = seed.runners.len(),
        configurations = seed.configurations.len(),
        "loaded registry seed"
    );

    let endpoint_repo: Arc<dyn EndpointRepository> =
        Arc::new(InMemoryEndpointRepository::with_endpoints(seed.endpoints));
    let runner_repo: Arc<dyn RunnerRepository> =
        Arc::new(InMemoryRunnerRepository::with_runners(seed.runners));
    let config_repo: Arc<dyn ConfigurationRepository> = Arc::new(
        InMemoryConfigurationRepository::with_configurations(seed.configurations),
    );
    let history_repo: Arc<dyn HistoryRepository> = Arc::new(InMemoryHistoryRepository::new());

    let http_client = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?;

    let registry = RunnerRegistry::new(runner_repo, Arc::clone(&endpoint_repo), config_repo);

    let monitor = Arc::new(HealthMonitor::new(http_client.clone()));
    monitor.bootstrap(endpoint_repo.list_all().await?).await;

    let recorder = HistoryRecorder::new(history_repo, config.history);
    recorder.spawn_sweeper();

    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        Arc::clone(&monitor),
        Balancer::new(),
        SessionAffinityTable::new(),
        AdapterSet::new(http_client.clone()),
        recorder,
    ));

    let state = AppState {
        dispatcher,
        monitor,
        registry,
        http_client,
    };

    server::run(state, &config.listen_addr).await?;
    Ok(())
}
