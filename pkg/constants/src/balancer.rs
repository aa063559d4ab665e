//! Placement density policy constants.

/// Default cap on how many pods of one workload a single node may host.
pub const DEFAULT_MAX_PODS_PER_NODE: u32 = 3;

/// Workloads that are never rebalanced unless the config says otherwise.
pub const DEFAULT_EXCLUDED_WORKLOADS: &[&str] = &["coredns"];

/// Node labels that mark a control-plane node.
pub const CONTROL_PLANE_LABELS: &[&str] = &[
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];

/// Label used to match a workload's pods when its selector is empty.
pub const DEFAULT_SELECTOR_LABEL: &str = "app";
