use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// --- Container spec ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

// --- Pod status ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodStatus {
    Pending,
    Scheduled,
    ContainerCreating,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl std::fmt::Display for PodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodStatus::Pending => write!(f, "Pending"),
            PodStatus::Scheduled => write!(f, "Scheduled"),
            PodStatus::ContainerCreating => write!(f, "ContainerCreating"),
            PodStatus::Running => write!(f, "Running"),
            PodStatus::Succeeded => write!(f, "Succeeded"),
            PodStatus::Failed => write!(f, "Failed"),
            PodStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

// --- Pod spec ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub node_affinity: HashMap<String, String>,
}

// --- Pod ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub spec: PodSpec,
    pub status: PodStatus,
    /// The OCI container ID for this pod (set by agent after container creation).
    #[serde(default)]
    pub container_id: Option<String>,
    /// The node this pod is assigned to (set by scheduler)
    #[serde(default)]
    pub node_name: Option<String>,
    /// Labels for selector-based matching
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Pod {
    /// The node this pod runs on, treating an empty name as unassigned.
    pub fn assigned_node(&self) -> Option<&str> {
        self.node_name.as_deref().filter(|n| !n.is_empty())
    }

    /// True when every selector entry is present in the pod's labels.
    pub fn matches_selector(&self, selector: &HashMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|lv| lv == v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pod(node: Option<&str>, labels: &[(&str, &str)]) -> Pod {
        Pod {
            name: "web-0".to_string(),
            namespace: "default".to_string(),
            spec: PodSpec::default(),
            status: PodStatus::Running,
            container_id: None,
            node_name: node.map(str::to_string),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn empty_node_name_is_unassigned() {
        assert_eq!(make_pod(Some(""), &[]).assigned_node(), None);
        assert_eq!(make_pod(None, &[]).assigned_node(), None);
        assert_eq!(make_pod(Some("node-1"), &[]).assigned_node(), Some("node-1"));
    }

    #[test]
    fn selector_requires_all_labels() {
        let pod = make_pod(None, &[("app", "web"), ("tier", "edge")]);
        let both = HashMap::from([
            ("app".to_string(), "web".to_string()),
            ("tier".to_string(), "edge".to_string()),
        ]);
        let wrong = HashMap::from([("app".to_string(), "api".to_string())]);
        assert!(pod.matches_selector(&both));
        assert!(!pod.matches_selector(&wrong));
        assert!(pod.matches_selector(&HashMap::new()));
    }
}
