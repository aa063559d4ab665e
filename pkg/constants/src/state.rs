//! State store key layout and watch constants.

/// Key prefix for Node objects: `/registry/nodes/{name}`.
pub const NODES_PREFIX: &str = "/registry/nodes/";

/// Key prefix for Pod objects: `/registry/pods/{ns}/{name}`.
pub const PODS_PREFIX: &str = "/registry/pods/";

/// Key prefix for Deployment objects: `/registry/deployments/{ns}/{name}`.
pub const DEPLOYMENTS_PREFIX: &str = "/registry/deployments/";

/// Number of recent watch events retained by the event log.
pub const EVENT_LOG_CAPACITY: usize = 1000;

/// Capacity of the broadcast channel feeding live watch subscribers.
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;
