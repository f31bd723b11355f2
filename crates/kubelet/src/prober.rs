//! Liveness/readiness probing and the readiness map.

use std::collections::HashSet;
use std::sync::Arc;

use api_types::Container;
use api_types::Pod;
use api_types::Probe;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::container::ContainerId;
use crate::lifecycle::HandlerRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Success,
    Failure,
    Unknown,
}

/// Last known readiness per container ID. A missing entry means not ready.
#[derive(Debug, Default)]
pub struct ReadinessManager {
    states: DashMap<ContainerId, bool>,
}

impl ReadinessManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_readiness(&self, id: &ContainerId, ready: bool) {
        self.states.insert(id.clone(), ready);
    }

    pub fn readiness(&self, id: &ContainerId) -> bool {
        self.states.get(id).map(|entry| *entry).unwrap_or(false)
    }

    pub fn remove_readiness(&self, id: &ContainerId) {
        self.states.remove(id);
    }

    /// Forgets every container not in `live`.
    pub fn retain_ids(&self, live: &HashSet<ContainerId>) {
        self.states.retain(|id, _| live.contains(id));
    }
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// Whether the container should keep running. Containers without a liveness probe
    /// are live.
    async fn probe_liveness(
        &self,
        pod: &Pod,
        container: &Container,
        container_id: &ContainerId,
    ) -> ProbeResult;

    /// Whether the container should receive traffic. Containers without a readiness probe
    /// are ready as soon as they run.
    async fn probe_readiness(
        &self,
        pod: &Pod,
        container: &Container,
        container_id: &ContainerId,
    ) -> ProbeResult;
}

/// Probes by running the probe's handler; any handler error is a failure.
pub struct HandlerProber {
    runner: Arc<dyn HandlerRunner>,
}

impl HandlerProber {
    pub fn new(runner: Arc<dyn HandlerRunner>) -> Self {
        Self { runner }
    }

    async fn run_probe(
        &self,
        probe: Option<&Probe>,
        pod: &Pod,
        container: &Container,
        container_id: &ContainerId,
    ) -> ProbeResult {
        let Some(probe) = probe else {
            return ProbeResult::Success;
        };
        match self
            .runner
            .run(container_id, pod, container, &probe.handler)
            .await
        {
            Ok(()) => ProbeResult::Success,
            Err(e) => {
                debug!(
                    pod = %pod.full_name(),
                    container = %container.name,
                    error = %e,
                    "probe failed"
                );
                ProbeResult::Failure
            }
        }
    }
}

#[async_trait]
impl Prober for HandlerProber {
    async fn probe_liveness(
        &self,
        pod: &Pod,
        container: &Container,
        container_id: &ContainerId,
    ) -> ProbeResult {
        self.run_probe(container.liveness_probe.as_ref(), pod, container, container_id)
            .await
    }

    async fn probe_readiness(
        &self,
        pod: &Pod,
        container: &Container,
        container_id: &ContainerId,
    ) -> ProbeResult {
        self.run_probe(container.readiness_probe.as_ref(), pod, container, container_id)
            .await
    }
}
