//! Kubernetes operations module.

pub mod client;
pub mod cluster;
pub mod manifest;
