use chrono::{DateTime, Utc};
use pkg_constants::balancer::CONTROL_PLANE_LABELS;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// --- Node status ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    Ready,
    NotReady,
    Unknown,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Ready => write!(f, "Ready"),
            NodeStatus::NotReady => write!(f, "NotReady"),
            NodeStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

// --- Persisted Node object ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// If true, the scheduler will not place new pods on this node.
    #[serde(default)]
    pub unschedulable: bool,
    pub registered_at: DateTime<Utc>,
}

impl Node {
    /// True if the node carries a master / control-plane role label.
    pub fn is_control_plane(&self) -> bool {
        CONTROL_PLANE_LABELS
            .iter()
            .any(|label| self.labels.contains_key(*label))
    }
}
