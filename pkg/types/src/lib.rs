pub mod config;
pub mod deployment;
pub mod node;
pub mod pod;
