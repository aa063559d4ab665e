use serde::{Deserialize, Serialize};

/// Rebalancer configuration file (YAML).
///
/// Example `rebalancer.yaml`:
/// ```yaml
/// data-dir: /var/lib/k3rs/data
/// max-pods-per-node: 3
/// excluded-workloads: [coredns, metrics-server]
/// excluded-nodes: [edge-1]
/// exclude-control-plane: true
/// pass-timeout-secs: 30
/// log-json: false
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebalancerConfigFile {
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default, alias = "max-pods-per-node")]
    pub max_pods_per_node: Option<u32>,
    #[serde(default, alias = "excluded-workloads")]
    pub excluded_workloads: Option<Vec<String>>,
    #[serde(default, alias = "excluded-nodes")]
    pub excluded_nodes: Option<Vec<String>>,
    #[serde(default, alias = "exclude-control-plane")]
    pub exclude_control_plane: Option<bool>,
    #[serde(default, alias = "pass-timeout-secs")]
    pub pass_timeout_secs: Option<u64>,
    #[serde(default, alias = "log-json")]
    pub log_json: Option<bool>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    // An empty file parses as YAML null; treat it like a missing one.
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
