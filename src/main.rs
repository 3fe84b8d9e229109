use sentinel::abi::{AbiRepository, ExplorerAbiCache};
use sentinel::config::{Config, NodeConfig, RoleKind};
use sentinel::health::{CycleHealthMonitor, FleetHealthMonitor};
use sentinel::node::{
    AlloyChainClient, DockerCli, EndpointSettings, ManagedProcess, NodeEndpoint, NodeRole,
    ProcessManager,
};
use sentinel::reader::{Fleet, QuorumReader};
use sentinel::rules::{RuleContext, RuleEngine, StandardRuleFactory};
use sentinel::signals::{HttpSignalSink, SignalSink, TracingSignalSink};
use sentinel::tx::{JsonlQueueSink, TransactionSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "sentinel.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config_path = PathBuf::from(
        std::env::var("SENTINEL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    let mut config = load_config(&config_path)?;

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("sentinel v{} starting", env!("CARGO_PKG_VERSION"));

    // --- Node Fleet ---
    let fleet = build_fleet(&config).await?;
    info!(endpoints = fleet.len(), "node fleet configured");

    let reader = Arc::new(
        QuorumReader::new(fleet.clone()).with_fork_url(config.upstream.fork_url.clone()),
    );

    // --- Signals ---
    let signals: Arc<dyn SignalSink> = if config.cycle.heartbeat_url.is_empty() {
        info!("no heartbeat URL configured, signals are log-only");
        Arc::new(TracingSignalSink)
    } else {
        Arc::new(HttpSignalSink::new(config.cycle.heartbeat_url.clone())?)
    };
    let monitor = CycleHealthMonitor::new(FleetHealthMonitor::new(fleet.clone()), signals);

    // --- ABI Cache ---
    let abis: Arc<dyn AbiRepository> = Arc::new(ExplorerAbiCache::from_config(&config.abi)?);
    let context = RuleContext::new(reader.clone(), abis);

    // --- Transaction Queue ---
    let sink = JsonlQueueSink::new(&config.cycle.queue_path);
    info!(path = %config.cycle.queue_path, "queueing transactions to file");

    // --- Main Cycle Loop ---
    let mut interval = tokio::time::interval(Duration::from_secs(config.cycle.interval_secs.max(1)));
    info!(
        interval_secs = config.cycle.interval_secs,
        rules = config.rules.len(),
        "entering cycle loop - press Ctrl+C to stop"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }

        config = reload_config(&config_path, config, &reader).await;
        run_cycle(&config, &monitor, &context, &sink).await;
    }

    info!("sentinel stopped");
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        Ok(Config::load(path)?)
    } else {
        info!(path = %path.display(), "no config file found, using env-only config");
        Ok(Config::from_env()?)
    }
}

/// Re-read the config file. A broken file keeps the last good config. A
/// changed fork URL re-points the managed nodes, or is held for the lazy
/// fleet start if no read has happened yet.
async fn reload_config(path: &Path, current: Config, reader: &QuorumReader) -> Config {
    if !path.exists() {
        return current;
    }
    let fresh = match Config::load(path) {
        Ok(fresh) => fresh,
        Err(e) => {
            warn!(error = %e, "config reload failed, keeping last good config");
            return current;
        }
    };

    if fresh.upstream.fork_url != current.upstream.fork_url && !fresh.upstream.fork_url.is_empty() {
        info!(fork_url = %fresh.upstream.fork_url, "fork URL changed");
        reader.repoint_fork(&fresh.upstream.fork_url).await;
    }
    fresh
}

async fn run_cycle(
    config: &Config,
    monitor: &CycleHealthMonitor,
    context: &RuleContext,
    sink: &dyn TransactionSink,
) {
    let start = monitor.start_of_cycle_sequence().await;

    let factory = Arc::new(StandardRuleFactory::new(
        context.clone(),
        config.cycle.fan_out_concurrency,
    ));
    let mut engine = RuleEngine::new(factory);
    engine.load_rules(&config.rules);
    let report = engine.evaluate_and_collect().await;

    let mut accepted = 0usize;
    let mut rejected = 0usize;
    for tx in &report.transactions {
        match sink.accept(tx).await {
            Ok(()) => accepted += 1,
            Err(e) => {
                error!(dedup_key = %tx.dedup_key, context = %tx.context, error = %e, "transaction rejected by sink");
                rejected += 1;
            }
        }
    }
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        idle = report.idle,
        accepted,
        rejected,
        "cycle summary"
    );

    monitor.end_of_cycle_sequence(start).await;
}

async fn build_fleet(config: &Config) -> anyhow::Result<Fleet> {
    let settings = EndpointSettings::from(&config.endpoint);
    let docker: Arc<dyn ProcessManager> = Arc::new(DockerCli::default());

    let mut endpoints = Vec::with_capacity(config.nodes.len());
    for node in &config.nodes {
        let client = AlloyChainClient::connect(&node.rpc_url, &node.reset_method).await?;
        let role = node_role(node, &docker)?;
        info!(endpoint = %node.name, url = %node.rpc_url, role = %role, "endpoint configured");
        endpoints.push(Arc::new(NodeEndpoint::new(
            node.name.clone(),
            Arc::new(client),
            role,
            settings.clone(),
        )));
    }
    Ok(Fleet::new(endpoints)?)
}

fn node_role(node: &NodeConfig, docker: &Arc<dyn ProcessManager>) -> anyhow::Result<NodeRole> {
    match node.role {
        RoleKind::Unmanaged => Ok(NodeRole::Unmanaged),
        RoleKind::Managed => {
            let Some(container) = &node.container else {
                anyhow::bail!("node {} is managed but has no container config", node.name);
            };
            Ok(NodeRole::Managed(ManagedProcess {
                container: container.name.clone().unwrap_or_else(|| node.name.clone()),
                image: container.image.clone(),
                ports: container.ports.clone(),
                args: container.args.clone(),
                manager: docker.clone(),
            }))
        }
    }
}
