//! Centralized constants for the k3rs rebalancer.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod balancer;
pub mod paths;
pub mod state;
