use anyhow::bail;
use clap::{Parser, Subcommand};
use pkg_balancer::NodePolicy;
use pkg_constants::balancer::{DEFAULT_EXCLUDED_WORKLOADS, DEFAULT_MAX_PODS_PER_NODE};
use pkg_constants::paths::{DEFAULT_DATA_DIR, DEFAULT_REBALANCER_CONFIG};
use pkg_controllers::cluster::StoreCluster;
use pkg_controllers::informer::WorkloadInformer;
use pkg_controllers::queue::event_queue;
use pkg_controllers::rebalancer::{RebalanceController, RebalancerConfig};
use pkg_metrics::MetricsRegistry;
use pkg_state::client::StateStore;
use pkg_types::config::{RebalancerConfigFile, load_config_file};
use pkg_types::deployment::WorkloadRef;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "k3rs-rebalancer", about = "k3rs pod density rebalancer")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, global = true, default_value = DEFAULT_REBALANCER_CONFIG)]
    config: String,

    /// Directory for SlateDB state storage
    #[arg(long, global = true)]
    data_dir: Option<String>,

    /// Maximum pods of one workload per node
    #[arg(long, global = true)]
    max_pods_per_node: Option<u32>,

    /// Workload name that is never rebalanced (repeatable)
    #[arg(long = "exclude-workload", global = true)]
    exclude_workloads: Vec<String>,

    /// Node that never receives migrated pods (repeatable)
    #[arg(long = "exclude-node", global = true)]
    exclude_nodes: Vec<String>,

    /// Abort a single rebalance pass after this many seconds
    #[arg(long, global = true)]
    pass_timeout_secs: Option<u64>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch workloads and rebalance until interrupted (default)
    Run,
    /// Print the plan for one workload without applying it
    Plan {
        namespace: String,
        name: String,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Effective settings after merging CLI args, config file and defaults.
#[derive(Debug, Clone, PartialEq)]
struct Settings {
    data_dir: String,
    max_pods_per_node: u32,
    excluded_workloads: Vec<String>,
    excluded_nodes: Vec<String>,
    exclude_control_plane: bool,
    pass_timeout: Option<Duration>,
    log_json: bool,
}

impl Settings {
    // Merge: CLI args > config file > defaults
    fn resolve(cli: &Cli, file_cfg: RebalancerConfigFile) -> anyhow::Result<Self> {
        let max_pods_per_node = cli
            .max_pods_per_node
            .or(file_cfg.max_pods_per_node)
            .unwrap_or(DEFAULT_MAX_PODS_PER_NODE);
        if max_pods_per_node == 0 {
            bail!("max-pods-per-node must be at least 1");
        }

        let excluded_workloads = if cli.exclude_workloads.is_empty() {
            file_cfg.excluded_workloads.unwrap_or_else(|| {
                DEFAULT_EXCLUDED_WORKLOADS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            })
        } else {
            cli.exclude_workloads.clone()
        };
        let excluded_nodes = if cli.exclude_nodes.is_empty() {
            file_cfg.excluded_nodes.unwrap_or_default()
        } else {
            cli.exclude_nodes.clone()
        };

        Ok(Self {
            data_dir: cli
                .data_dir
                .clone()
                .or(file_cfg.data_dir)
                .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            max_pods_per_node,
            excluded_workloads,
            excluded_nodes,
            exclude_control_plane: file_cfg.exclude_control_plane.unwrap_or(true),
            pass_timeout: cli
                .pass_timeout_secs
                .or(file_cfg.pass_timeout_secs)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            log_json: cli.log_json || file_cfg.log_json.unwrap_or(false),
        })
    }

    fn rebalancer_config(&self) -> RebalancerConfig {
        RebalancerConfig {
            max_pods_per_node: self.max_pods_per_node,
            node_policy: NodePolicy {
                excluded_nodes: self.excluded_nodes.iter().cloned().collect(),
                exclude_control_plane: self.exclude_control_plane,
            },
            pass_timeout: self.pass_timeout,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: RebalancerConfigFile = load_config_file(&cli.config)?;
    let settings = Settings::resolve(&cli, file_cfg)?;
    init_tracing(settings.log_json);
    info!("Config file: {}", cli.config);

    match cli.command {
        Some(Commands::Plan {
            namespace,
            name,
            json,
        }) => plan(&settings, WorkloadRef::new(namespace, name), json).await,
        Some(Commands::Run) | None => run(settings).await,
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    info!("Starting k3rs-rebalancer");
    info!("  Data dir:           {}", settings.data_dir);
    info!("  Max pods per node:  {}", settings.max_pods_per_node);
    info!("  Excluded workloads: {:?}", settings.excluded_workloads);
    info!("  Excluded nodes:     {:?}", settings.excluded_nodes);
    info!("  Pass timeout:       {:?}", settings.pass_timeout);

    let store = StateStore::new(&settings.data_dir).await?;
    let metrics = Arc::new(MetricsRegistry::new());
    let cluster = Arc::new(StoreCluster::new(store.clone()));

    let (queue, events) = event_queue(settings.excluded_workloads.iter().cloned());
    let (informer, synced) = WorkloadInformer::new(store.clone(), queue);
    let controller = RebalanceController::new(
        cluster.clone(),
        cluster,
        settings.rebalancer_config(),
        metrics.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut informer_handle = informer.start(shutdown_rx.clone());
    let worker_handle = controller.start(events, synced, shutdown_rx);

    let stopped = wait_for_stop(&mut informer_handle, tokio::signal::ctrl_c()).await;
    let _ = shutdown_tx.send(true);

    if stopped.is_ok() {
        match informer_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("informer failed during shutdown: {:#}", e),
            Err(e) => error!("informer task panicked: {}", e),
        }
    }
    if let Err(e) = worker_handle.await {
        error!("worker task panicked: {}", e);
    }

    info!("Final metrics:\n{}", metrics.render());
    store.close().await?;
    info!("k3rs-rebalancer stopped");
    stopped
}

/// Block until Ctrl-C or until the informer exits on its own.
///
/// Without the workload watch nothing feeds the worker, so an informer exit
/// that was not requested is returned as an error.
async fn wait_for_stop<S>(
    informer: &mut JoinHandle<anyhow::Result<()>>,
    signal: S,
) -> anyhow::Result<()>
where
    S: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        res = signal => {
            res?;
            info!("Shutdown signal received, stopping");
            Ok(())
        }
        joined = informer => match joined {
            Ok(Ok(())) => bail!("workload watch ended unexpectedly"),
            Ok(Err(e)) => Err(e.context("workload watch failed")),
            Err(e) => bail!("informer task panicked: {}", e),
        },
    }
}

async fn plan(settings: &Settings, workload: WorkloadRef, json: bool) -> anyhow::Result<()> {
    let store = StateStore::new(&settings.data_dir).await?;
    let cluster = Arc::new(StoreCluster::new(store.clone()));
    let controller = RebalanceController::new(
        cluster.clone(),
        cluster,
        settings.rebalancer_config(),
        Arc::new(MetricsRegistry::new()),
    );

    let result = controller.plan(&workload).await;
    store.close().await?;
    let Some((deploy, plan)) = result? else {
        bail!("workload {} not found", workload);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!(
        "Workload {} (replicas={}, max-pods-per-node={})",
        workload, deploy.spec.replicas, settings.max_pods_per_node
    );
    for (node, count) in &plan.counts {
        println!("  {:<24} {}", node, count);
    }
    if plan.unassigned > 0 {
        println!("  {:<24} {}", "<unassigned>", plan.unassigned);
    }
    if plan.is_noop() {
        println!("Balanced, nothing to do");
    } else {
        for action in &plan.actions {
            println!("- {}", action);
        }
    }
    if plan.excess > 0 {
        println!(
            "{} pods have no room; {} more node(s) would avoid shrinking",
            plan.excess, plan.additional_nodes_needed
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["k3rs-rebalancer"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_defaults_without_file() {
        let settings = Settings::resolve(&parse(&[]), RebalancerConfigFile::default()).unwrap();
        assert_eq!(settings.max_pods_per_node, 3);
        assert_eq!(settings.excluded_workloads, vec!["coredns".to_string()]);
        assert!(settings.excluded_nodes.is_empty());
        assert!(settings.exclude_control_plane);
        assert_eq!(settings.pass_timeout, None);
        assert_eq!(settings.data_dir, DEFAULT_DATA_DIR);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file_cfg = RebalancerConfigFile {
            max_pods_per_node: Some(5),
            excluded_workloads: Some(vec!["metrics-server".to_string()]),
            excluded_nodes: Some(vec!["edge-1".to_string()]),
            pass_timeout_secs: Some(10),
            exclude_control_plane: Some(false),
            ..Default::default()
        };
        let cli = parse(&[
            "--max-pods-per-node",
            "2",
            "--exclude-workload",
            "web",
            "--exclude-workload",
            "api",
            "plan",
            "default",
            "web",
        ]);
        let settings = Settings::resolve(&cli, file_cfg).unwrap();
        assert_eq!(settings.max_pods_per_node, 2);
        assert_eq!(settings.excluded_workloads, vec!["web", "api"]);
        assert_eq!(settings.excluded_nodes, vec!["edge-1"]);
        assert_eq!(settings.pass_timeout, Some(Duration::from_secs(10)));
        assert!(!settings.exclude_control_plane);
        assert!(matches!(cli.command, Some(Commands::Plan { .. })));
    }

    #[tokio::test]
    async fn test_failed_watch_stops_the_process() {
        let mut informer: JoinHandle<anyhow::Result<()>> =
            tokio::spawn(async { Err(anyhow::anyhow!("failed to list deployments")) });
        let err = wait_for_stop(&mut informer, std::future::pending())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("failed to list deployments"));

        let mut ended: JoinHandle<anyhow::Result<()>> = tokio::spawn(async { Ok(()) });
        assert!(
            wait_for_stop(&mut ended, std::future::pending())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_signal_stops_cleanly() {
        let mut informer: JoinHandle<anyhow::Result<()>> =
            tokio::spawn(std::future::pending());
        let stopped = wait_for_stop(&mut informer, async { Ok(()) }).await;
        assert!(stopped.is_ok());
        informer.abort();
    }

    #[test]
    fn test_zero_cap_is_rejected() {
        let err = Settings::resolve(&parse(&["--max-pods-per-node", "0"]), Default::default());
        assert!(err.is_err());

        let file_cfg = RebalancerConfigFile {
            max_pods_per_node: Some(0),
            ..Default::default()
        };
        assert!(Settings::resolve(&parse(&[]), file_cfg).is_err());
    }
}
