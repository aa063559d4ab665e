//! Placement density balancer.
//!
//! Given a point-in-time snapshot of one workload's pods and the eligible
//! nodes, [`Balancer::balance`] computes the corrective actions that bring
//! every node back under the per-node pod cap: migrate pods to the
//! least-loaded eligible nodes first, and shrink the workload's desired
//! replica count by whatever cannot be placed anywhere.
//!
//! The balancer is pure. It never talks to the cluster, so the same
//! snapshot always yields the same plan.

use pkg_constants::balancer::DEFAULT_MAX_PODS_PER_NODE;
use pkg_types::deployment::Deployment;
use pkg_types::node::Node;
use pkg_types::pod::Pod;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

// --- Node eligibility ---

/// Decides which nodes may receive migrated pods.
#[derive(Debug, Clone, Default)]
pub struct NodePolicy {
    /// Node names that are never migration targets.
    pub excluded_nodes: BTreeSet<String>,
    /// Treat master / control-plane nodes as excluded.
    pub exclude_control_plane: bool,
}

impl NodePolicy {
    pub fn is_eligible(&self, node: &Node) -> bool {
        if self.excluded_nodes.contains(&node.name) {
            return false;
        }
        // Cordoned nodes must not receive new pods
        if node.unschedulable {
            return false;
        }
        !(self.exclude_control_plane && node.is_control_plane())
    }

    /// Names of the eligible nodes, sorted and de-duplicated.
    pub fn eligible_nodes(&self, nodes: &[Node]) -> Vec<String> {
        nodes
            .iter()
            .filter(|n| self.is_eligible(n))
            .map(|n| n.name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

// --- Snapshot ---

/// A pod reduced to what the balancer needs: identity and current node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodPlacement {
    pub namespace: String,
    pub name: String,
    /// `None` when the pod is not (or not resolvably) bound to a node.
    pub node: Option<String>,
}

impl From<&Pod> for PodPlacement {
    fn from(pod: &Pod) -> Self {
        Self {
            namespace: pod.namespace.clone(),
            name: pod.name.clone(),
            node: pod.assigned_node().map(str::to_string),
        }
    }
}

/// Everything one balancing pass looks at.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Desired replica count of the workload.
    pub replicas: u32,
    /// Nodes that may receive migrated pods.
    pub eligible_nodes: Vec<String>,
    pub pods: Vec<PodPlacement>,
}

impl Snapshot {
    pub fn from_cluster(
        workload: &Deployment,
        nodes: &[Node],
        pods: &[Pod],
        policy: &NodePolicy,
    ) -> Self {
        Self {
            replicas: workload.spec.replicas,
            eligible_nodes: policy.eligible_nodes(nodes),
            pods: pods.iter().map(PodPlacement::from).collect(),
        }
    }
}

// --- Plan ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BalanceAction {
    /// Re-bind a pod to a less loaded node.
    Migrate {
        namespace: String,
        pod: String,
        from: String,
        to: String,
    },
    /// Lower the workload's desired replicas to what fits.
    Shrink {
        from_replicas: u32,
        to_replicas: u32,
        excess: u32,
    },
}

impl fmt::Display for BalanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceAction::Migrate {
                namespace,
                pod,
                from,
                to,
            } => write!(f, "migrate {}/{}: {} → {}", namespace, pod, from, to),
            BalanceAction::Shrink {
                from_replicas,
                to_replicas,
                excess,
            } => write!(
                f,
                "shrink replicas {} → {} (excess {})",
                from_replicas, to_replicas, excess
            ),
        }
    }
}

/// Result of one balancing pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BalancePlan {
    /// Actions to apply, in order.
    pub actions: Vec<BalanceAction>,
    /// Working per-node counts after the planned migrations and removals.
    pub counts: BTreeMap<String, u32>,
    /// Pods that could not be placed under the cap.
    pub excess: u32,
    /// Pods without a node assignment; counted but never moved.
    pub unassigned: u32,
    /// Nodes that would be needed to absorb `excess` without shrinking.
    pub additional_nodes_needed: u32,
}

impl BalancePlan {
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn migrations(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, BalanceAction::Migrate { .. }))
            .count()
    }

    pub fn shrink(&self) -> Option<&BalanceAction> {
        self.actions
            .iter()
            .find(|a| matches!(a, BalanceAction::Shrink { .. }))
    }
}

// --- Working counts ---

/// Per-node pod tally for one pass.
///
/// Eligible nodes are additionally kept in `candidates`, ordered by
/// `(count, name)`, so the least-loaded target is always the first entry.
struct PlacementCount {
    counts: BTreeMap<String, u32>,
    eligible: BTreeSet<String>,
    candidates: BTreeSet<(u32, String)>,
}

impl PlacementCount {
    fn seed(eligible_nodes: &[String]) -> Self {
        let eligible: BTreeSet<String> = eligible_nodes.iter().cloned().collect();
        Self {
            counts: eligible.iter().map(|n| (n.clone(), 0)).collect(),
            candidates: eligible.iter().map(|n| (0, n.clone())).collect(),
            eligible,
        }
    }

    fn get(&self, node: &str) -> u32 {
        self.counts.get(node).copied().unwrap_or(0)
    }

    fn increment(&mut self, node: &str) {
        let old = self.get(node);
        self.set(node, old, old + 1);
    }

    fn decrement(&mut self, node: &str) {
        let old = self.get(node);
        self.set(node, old, old.saturating_sub(1));
    }

    fn set(&mut self, node: &str, old: u32, new: u32) {
        self.counts.insert(node.to_string(), new);
        if self.eligible.contains(node) {
            self.candidates.remove(&(old, node.to_string()));
            self.candidates.insert((new, node.to_string()));
        }
    }

    /// Least-loaded eligible node other than `source` with room under `cap`.
    fn target_below(&self, cap: u32, source: &str) -> Option<String> {
        self.candidates
            .iter()
            .take_while(|(count, _)| *count < cap)
            .find(|(_, name)| name != source)
            .map(|(_, name)| name.clone())
    }
}

// --- Balancer ---

/// Enforces a per-node pod density cap for one workload at a time.
pub struct Balancer {
    max_pods_per_node: u32,
}

impl Balancer {
    /// A cap of zero is raised to one; zero would make every pod excess.
    pub fn new(max_pods_per_node: u32) -> Self {
        Self {
            max_pods_per_node: max_pods_per_node.max(1),
        }
    }

    pub fn max_pods_per_node(&self) -> u32 {
        self.max_pods_per_node
    }

    /// Compute the corrective actions for `snapshot`.
    pub fn balance(&self, snapshot: &Snapshot) -> BalancePlan {
        let cap = self.max_pods_per_node;
        let mut counts = PlacementCount::seed(&snapshot.eligible_nodes);

        let mut pods: Vec<&PodPlacement> = snapshot.pods.iter().collect();
        pods.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

        let mut unassigned = 0u32;
        let mut assigned = 0u32;
        for pod in &pods {
            match pod.node.as_deref() {
                Some(node) => {
                    counts.increment(node);
                    assigned += 1;
                }
                None => unassigned += 1,
            }
        }

        let mut actions = Vec::new();
        let mut excess = 0u32;

        for pod in &pods {
            let Some(source) = pod.node.as_deref() else {
                continue;
            };
            if counts.get(source) <= cap {
                continue;
            }

            match counts.target_below(cap, source) {
                Some(target) => {
                    debug!(
                        pod = %pod.name,
                        from = source,
                        to = %target,
                        "planned migration"
                    );
                    counts.decrement(source);
                    counts.increment(&target);
                    actions.push(BalanceAction::Migrate {
                        namespace: pod.namespace.clone(),
                        pod: pod.name.clone(),
                        from: source.to_string(),
                        to: target,
                    });
                }
                None => {
                    debug!(pod = %pod.name, node = source, "no node has room, counting as excess");
                    counts.decrement(source);
                    excess += 1;
                }
            }
        }

        // Replicas at or below what fits means an earlier shrink is still
        // being carried out by tearing down the surplus pods.
        if excess > 0 && snapshot.replicas > assigned - excess {
            actions.push(BalanceAction::Shrink {
                from_replicas: snapshot.replicas,
                to_replicas: snapshot.replicas.saturating_sub(excess),
                excess,
            });
        }

        BalancePlan {
            actions,
            counts: counts.counts,
            excess,
            unassigned,
            additional_nodes_needed: excess.div_ceil(cap),
        }
    }
}

impl Default for Balancer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PODS_PER_NODE)
    }
}
