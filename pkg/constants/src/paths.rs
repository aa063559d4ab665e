//! Filesystem path constants.

/// Default config file path for the rebalancer.
pub const DEFAULT_REBALANCER_CONFIG: &str = "/etc/k3rs/rebalancer.yaml";

/// Default data directory for the state store.
pub const DEFAULT_DATA_DIR: &str = "/tmp/k3rs-data";
