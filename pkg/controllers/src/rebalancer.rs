use anyhow::Context;
use pkg_balancer::{BalanceAction, BalancePlan, Balancer, NodePolicy, Snapshot};
use pkg_metrics::MetricsRegistry;
use pkg_types::deployment::{Deployment, WorkloadRef};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterReader, MutationSink};
use crate::informer::SyncSignal;
use crate::queue::EventReceiver;

pub const PASSES_TOTAL: &str = "rebalancer_passes_total";
pub const PASS_FAILURES_TOTAL: &str = "rebalancer_pass_failures_total";
pub const MIGRATIONS_TOTAL: &str = "rebalancer_migrations_total";
pub const MIGRATION_FAILURES_TOTAL: &str = "rebalancer_migration_failures_total";
pub const SHRINKS_TOTAL: &str = "rebalancer_shrinks_total";
pub const SHRINK_FAILURES_TOTAL: &str = "rebalancer_shrink_failures_total";
pub const EXCESS_PODS_TOTAL: &str = "rebalancer_excess_pods_total";
pub const ADDITIONAL_NODES_NEEDED: &str = "rebalancer_additional_nodes_needed";
pub const QUEUE_DEPTH: &str = "rebalancer_queue_depth";

/// Tunables for [`RebalanceController`].
#[derive(Debug, Clone)]
pub struct RebalancerConfig {
    pub max_pods_per_node: u32,
    pub node_policy: NodePolicy,
    /// Upper bound on one pass; `None` lets a pass run to completion.
    pub pass_timeout: Option<Duration>,
}

/// What one pass actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutcome {
    pub migrated: u32,
    pub migration_failures: u32,
    /// Replica count written by a successful shrink.
    pub shrunk_to: Option<u32>,
    pub shrink_failed: bool,
    pub excess: u32,
    pub additional_nodes_needed: u32,
}

/// Single worker that drains the event queue and enforces the per-node
/// pod density cap for each workload it dequeues.
pub struct RebalanceController {
    reader: Arc<dyn ClusterReader>,
    sink: Arc<dyn MutationSink>,
    balancer: Balancer,
    policy: NodePolicy,
    pass_timeout: Option<Duration>,
    metrics: Arc<MetricsRegistry>,
}

impl RebalanceController {
    pub fn new(
        reader: Arc<dyn ClusterReader>,
        sink: Arc<dyn MutationSink>,
        config: RebalancerConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        register_metrics(&metrics);
        Self {
            reader,
            sink,
            balancer: Balancer::new(config.max_pods_per_node),
            policy: config.node_policy,
            pass_timeout: config.pass_timeout,
            metrics,
        }
    }

    /// Start the worker loop as a background task.
    pub fn start(
        self,
        events: EventReceiver,
        synced: SyncSignal,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let controller = Arc::new(self);
        tokio::spawn(async move { controller.run(events, synced, shutdown).await })
    }

    /// Wait for the initial sync, then reconcile queued workloads one at a
    /// time until `shutdown` flips to true.
    pub async fn run(
        self: Arc<Self>,
        mut events: EventReceiver,
        mut synced: SyncSignal,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "RebalanceController started (max_pods_per_node={}, timeout={:?})",
            self.balancer.max_pods_per_node(),
            self.pass_timeout
        );

        if !synced.is_synced() {
            info!("RebalanceController waiting for initial workload sync");
            tokio::select! {
                ok = synced.wait() => {
                    if !ok {
                        warn!("Workload watch ended before initial sync, stopping");
                        return;
                    }
                }
                _ = shutdown.changed() => {
                    info!("RebalanceController stopped before sync");
                    return;
                }
            }
        }

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let workload = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = events.dequeue() => match next {
                    Some(workload) => workload,
                    None => {
                        info!("Event queue closed");
                        break;
                    }
                },
            };
            self.metrics.gauge_set(QUEUE_DEPTH, events.len() as i64);
            self.process(workload).await;
        }
        info!("RebalanceController stopped");
    }

    /// Run one pass in its own task so a panic or timeout stays contained.
    async fn process(self: &Arc<Self>, workload: WorkloadRef) {
        self.metrics.counter_inc(PASSES_TOTAL);

        let controller = Arc::clone(self);
        let target = workload.clone();
        let mut pass = tokio::spawn(async move { controller.reconcile(&target).await });

        let joined = match self.pass_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut pass).await {
                Ok(joined) => joined,
                Err(_) => {
                    pass.abort();
                    warn!(
                        "Rebalance pass for {} timed out after {}s",
                        workload,
                        limit.as_secs()
                    );
                    self.metrics.counter_inc(PASS_FAILURES_TOTAL);
                    return;
                }
            },
            None => pass.await,
        };

        match joined {
            Ok(Ok(outcome)) => {
                if outcome != PassOutcome::default() {
                    info!(
                        workload = %workload,
                        migrated = outcome.migrated,
                        migration_failures = outcome.migration_failures,
                        shrunk_to = ?outcome.shrunk_to,
                        excess = outcome.excess,
                        "Rebalance pass complete"
                    );
                }
            }
            Ok(Err(e)) => {
                warn!("Rebalance pass for {} failed: {:#}", workload, e);
                self.metrics.counter_inc(PASS_FAILURES_TOTAL);
            }
            Err(e) => {
                error!("Rebalance pass for {} panicked: {}", workload, e);
                self.metrics.counter_inc(PASS_FAILURES_TOTAL);
            }
        }
    }

    /// Read a fresh snapshot of `workload` and compute its plan.
    ///
    /// Returns `None` if the workload no longer exists.
    pub async fn plan(
        &self,
        workload: &WorkloadRef,
    ) -> anyhow::Result<Option<(Deployment, BalancePlan)>> {
        let Some(deploy) = self
            .reader
            .get_workload(workload)
            .await
            .with_context(|| format!("failed to read workload {}", workload))?
        else {
            return Ok(None);
        };

        let nodes = self
            .reader
            .list_nodes()
            .await
            .context("failed to list nodes")?;
        let pods = self
            .reader
            .list_pods(&deploy.namespace, &deploy.pod_selector())
            .await
            .with_context(|| format!("failed to list pods of {}", workload))?;

        let snapshot = Snapshot::from_cluster(&deploy, &nodes, &pods, &self.policy);
        let plan = self.balancer.balance(&snapshot);
        Ok(Some((deploy, plan)))
    }

    /// One reconciliation pass: snapshot, plan, apply.
    pub async fn reconcile(&self, workload: &WorkloadRef) -> anyhow::Result<PassOutcome> {
        let Some((deploy, plan)) = self.plan(workload).await? else {
            debug!("Workload {} no longer exists, skipping", workload);
            return Ok(PassOutcome::default());
        };
        if plan.is_noop() {
            if plan.excess > 0 {
                debug!(
                    "Workload {}: replicas already lowered, {} surplus pods awaiting removal",
                    workload, plan.excess
                );
            } else {
                debug!("Workload {} is balanced", workload);
            }
            return Ok(PassOutcome::default());
        }
        Ok(self.apply(&deploy, &plan).await)
    }

    /// Apply every action in order. A failed write is logged and skipped.
    async fn apply(&self, deploy: &Deployment, plan: &BalancePlan) -> PassOutcome {
        let workload = deploy.workload_ref();
        let mut outcome = PassOutcome {
            excess: plan.excess,
            additional_nodes_needed: plan.additional_nodes_needed,
            ..PassOutcome::default()
        };

        for action in &plan.actions {
            match action {
                BalanceAction::Migrate {
                    namespace,
                    pod,
                    from,
                    to,
                } => match self.sink.patch_pod_node(namespace, pod, to).await {
                    Ok(()) => {
                        info!("Workload {}: migrated pod {} {} → {}", workload, pod, from, to);
                        outcome.migrated += 1;
                        self.metrics.counter_inc(MIGRATIONS_TOTAL);
                    }
                    Err(e) => {
                        warn!(
                            "Workload {}: failed to migrate pod {} to {}: {:#}",
                            workload, pod, to, e
                        );
                        outcome.migration_failures += 1;
                        self.metrics.counter_inc(MIGRATION_FAILURES_TOTAL);
                    }
                },
                BalanceAction::Shrink {
                    from_replicas,
                    to_replicas,
                    excess,
                } => {
                    warn!(
                        "Workload {}: {} pods over the per-node cap, {} more node(s) would be needed",
                        workload, excess, plan.additional_nodes_needed
                    );
                    self.metrics.counter_add(EXCESS_PODS_TOTAL, u64::from(*excess));
                    match self
                        .sink
                        .patch_workload_replicas(&workload, *to_replicas)
                        .await
                    {
                        Ok(()) => {
                            info!(
                                "Workload {}: shrank replicas {} → {} ({} pods had no room)",
                                workload, from_replicas, to_replicas, excess
                            );
                            outcome.shrunk_to = Some(*to_replicas);
                            self.metrics.counter_inc(SHRINKS_TOTAL);
                        }
                        Err(e) => {
                            warn!(
                                "Workload {}: failed to shrink replicas to {}: {:#}",
                                workload, to_replicas, e
                            );
                            outcome.shrink_failed = true;
                            self.metrics.counter_inc(SHRINK_FAILURES_TOTAL);
                        }
                    }
                }
            }
        }

        self.metrics.gauge_set(
            ADDITIONAL_NODES_NEEDED,
            i64::from(plan.additional_nodes_needed),
        );
        outcome
    }
}

fn register_metrics(metrics: &MetricsRegistry) {
    metrics.register_counter(PASSES_TOTAL, "Reconciliation passes started");
    metrics.register_counter(PASS_FAILURES_TOTAL, "Passes aborted by an error, panic or timeout");
    metrics.register_counter(MIGRATIONS_TOTAL, "Pods moved to a less loaded node");
    metrics.register_counter(MIGRATION_FAILURES_TOTAL, "Pod migrations that failed to apply");
    metrics.register_counter(SHRINKS_TOTAL, "Replica count reductions applied");
    metrics.register_counter(SHRINK_FAILURES_TOTAL, "Replica count reductions that failed to apply");
    metrics.register_counter(EXCESS_PODS_TOTAL, "Pods that found no node under the cap");
    metrics.register_gauge(
        ADDITIONAL_NODES_NEEDED,
        "Nodes the last rebalanced workload would need to avoid shrinking",
    );
    metrics.register_gauge(QUEUE_DEPTH, "Workload events waiting for reconciliation");
}
