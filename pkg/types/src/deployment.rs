use chrono::{DateTime, Utc};
use pkg_constants::balancer::DEFAULT_SELECTOR_LABEL;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::pod::PodSpec;

// --- Workload reference ---

/// Identity of a workload awaiting reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse the `{ns}/{name}` tail of a registry key.
    pub fn from_key_suffix(suffix: &str) -> Option<Self> {
        let (namespace, name) = suffix.split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// --- Deployment spec ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub replicas: u32,
    pub template: PodSpec,
    /// Label selector for matching pods
    #[serde(default)]
    pub selector: HashMap<String, String>,
}

// --- Deployment ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub namespace: String,
    pub spec: DeploymentSpec,
    /// Monotonically increasing generation; bumped on spec changes
    #[serde(default)]
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    pub fn workload_ref(&self) -> WorkloadRef {
        WorkloadRef::new(&self.namespace, &self.name)
    }

    /// Selector used to find this workload's pods.
    ///
    /// An empty selector falls back to `app=<name>`.
    pub fn pod_selector(&self) -> HashMap<String, String> {
        if !self.spec.selector.is_empty() {
            return self.spec.selector.clone();
        }
        HashMap::from([(DEFAULT_SELECTOR_LABEL.to_string(), self.name.clone())])
    }
}
