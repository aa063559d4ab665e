//! Density rebalancing controller.
//!
//! Workload watch events flow through [`queue::EventQueue`] into a single
//! [`rebalancer::RebalanceController`] worker, which snapshots the cluster
//! through [`cluster::ClusterReader`], plans with `pkg_balancer` and writes
//! through [`cluster::MutationSink`].

pub mod cluster;
pub mod informer;
pub mod queue;
pub mod rebalancer;
