//! A node agent that keeps the containers on one machine matching the pods assigned to it.

pub mod app;
pub mod config;
pub mod container;
pub mod dirs;
pub mod dns;
pub mod envvars;
pub mod error;
pub mod kubelet;
pub mod lifecycle;
pub mod pod_manager;
pub mod pod_workers;
pub mod prober;
pub mod runtime;
pub mod source;
pub mod stats;
pub mod status_manager;
pub mod upstream;
pub mod volume;

#[cfg(test)]
mod testing;
