//! Helm chart and release operations module.

pub mod client;
