//! Pod status generation from runtime observations.

use api_types::Container;
use api_types::ContainerState;
use api_types::ContainerStateWaiting;
use api_types::ContainerStatus;
use api_types::Pod;
use api_types::PodPhase;
use api_types::PodSpec;
use api_types::PodStatus;
use api_types::RestartPolicy;
use tracing::warn;

use super::Kubelet;
use crate::container::list_pods;
use crate::container::RuntimeContainer;
use crate::container::RuntimePod;
use crate::error::KubeletError;
use crate::error::Result;
use crate::status_manager::get_pod_ready_condition;

/// Derives the pod phase from per-container statuses.
pub fn get_phase(spec: &PodSpec, statuses: &[ContainerStatus]) -> PodPhase {
    let total = spec.containers.len();
    let (mut running, mut waiting, mut stopped, mut succeeded, mut unknown) = (0, 0, 0, 0, 0);

    for container in &spec.containers {
        match statuses.iter().find(|s| s.name == container.name) {
            Some(status) => match &status.state {
                ContainerState::Running(_) => running += 1,
                ContainerState::Terminated(terminated) => {
                    stopped += 1;
                    if terminated.exit_code == 0 {
                        succeeded += 1;
                    }
                }
                ContainerState::Waiting(_) => waiting += 1,
            },
            None => unknown += 1,
        }
    }

    if waiting > 0 {
        PodPhase::Pending
    } else if (running > 0 && unknown == 0) || running == total {
        PodPhase::Running
    } else if stopped == total {
        match spec.restart_policy {
            RestartPolicy::Always => PodPhase::Running,
            _ if stopped == succeeded => PodPhase::Succeeded,
            RestartPolicy::OnFailure => PodPhase::Running,
            RestartPolicy::Never => PodPhase::Failed,
        }
    } else {
        PodPhase::Pending
    }
}

/// Only pods that have started (or finished) have containers worth looking at.
pub fn validate_pod_phase(pod_full_name: &str, status: &PodStatus) -> Result<()> {
    match status.phase {
        PodPhase::Running | PodPhase::Succeeded | PodPhase::Failed => Ok(()),
        phase => Err(KubeletError::InvalidPodPhase {
            pod_full_name: pod_full_name.to_string(),
            phase,
        }),
    }
}

/// Returns the runtime ID recorded for `container_name`, rejecting unknown and waiting
/// containers.
pub fn validate_container_status(
    pod_full_name: &str,
    status: &PodStatus,
    container_name: &str,
) -> Result<String> {
    let container = status.container_status(container_name).ok_or_else(|| {
        KubeletError::ContainerNotFound {
            pod_full_name: pod_full_name.to_string(),
            container_name: container_name.to_string(),
        }
    })?;

    match (&container.state, &container.container_id) {
        (ContainerState::Waiting(_), _) | (_, None) => Err(KubeletError::ContainerWaiting {
            container_name: container_name.to_string(),
        }),
        (_, Some(id)) => Ok(id.clone()),
    }
}

impl Kubelet {
    fn reported_id(&self, container: &RuntimeContainer) -> String {
        format!("{}://{}", self.runtime.type_name(), container.id)
    }

    /// State of one runtime instance with the reported container ID filled in.
    fn reported_state(&self, container: &RuntimeContainer) -> ContainerState {
        match &container.state {
            ContainerState::Terminated(terminated) => {
                let mut terminated = terminated.clone();
                terminated.container_id = Some(self.reported_id(container));
                ContainerState::Terminated(terminated)
            }
            state => state.clone(),
        }
    }

    fn container_status(
        &self,
        pod: &Pod,
        container: &Container,
        runtime_pod: &RuntimePod,
        previous: Option<&PodStatus>,
    ) -> ContainerStatus {
        let instances = runtime_pod.instances(&container.name);
        let failure = self
            .failure_reasons
            .get(&(pod.uid().to_string(), container.name.clone()))
            .map(|reason| reason.clone());
        let previous_restarts = previous
            .and_then(|s| s.container_status(&container.name))
            .map_or(0, |s| s.restart_count);

        let Some(latest) = instances.first() else {
            return ContainerStatus {
                name: container.name.clone(),
                state: ContainerState::Waiting(ContainerStateWaiting {
                    reason: failure.unwrap_or_default(),
                }),
                restart_count: previous_restarts,
                image: container.image.clone(),
                ..Default::default()
            };
        };

        let mut status = ContainerStatus {
            name: container.name.clone(),
            state: self.reported_state(latest),
            last_termination_state: instances
                .get(1)
                .filter(|c| c.state.terminated().is_some())
                .map(|c| self.reported_state(c)),
            ready: latest.is_running() && self.readiness.readiness(&latest.id),
            restart_count: u32::try_from(instances.len() - 1)
                .unwrap_or(u32::MAX)
                .max(previous_restarts),
            image: container.image.clone(),
            container_id: Some(self.reported_id(latest)),
        };

        // A failed recreate leaves the container waiting behind its last exit.
        if let (false, Some(reason)) = (latest.is_running(), failure) {
            status.last_termination_state = Some(status.state.clone());
            status.state = ContainerState::Waiting(ContainerStateWaiting { reason });
        }
        status
    }

    /// Builds the status of `pod` from every runtime instance it has, running or exited.
    pub async fn generate_pod_status(&self, pod: &Pod) -> Result<PodStatus> {
        let runtime_pod = list_pods(&*self.runtime, true)
            .await?
            .into_iter()
            .find(|p| p.uid == pod.uid())
            .unwrap_or_default();
        let previous = self.status_manager.cached_status(&pod.full_name());

        let container_statuses: Vec<ContainerStatus> = pod
            .spec
            .containers
            .iter()
            .map(|c| self.container_status(pod, c, &runtime_pod, previous.as_ref()))
            .collect();

        let pod_ip = match runtime_pod.infra_container() {
            Some(infra) => match self.runtime.inspect(&infra.id).await {
                Ok(detail) => detail.ip_address,
                Err(e) => {
                    warn!(pod = %pod.full_name(), error = %e, "failed to inspect pod infra container");
                    None
                }
            },
            None => None,
        };

        Ok(PodStatus {
            phase: get_phase(&pod.spec, &container_statuses),
            conditions: get_pod_ready_condition(Some(&pod.spec), &container_statuses),
            message: String::new(),
            host_ip: None,
            pod_ip,
            container_statuses,
        })
    }

    /// Cached status if there is one; static pods fall back to a freshly generated one.
    pub async fn get_pod_status(&self, pod_full_name: &str) -> Result<PodStatus> {
        match self.status_manager.get_pod_status(pod_full_name) {
            Ok(status) => Ok(status),
            Err(e) => match self.pod_manager.get_pod_by_full_name(pod_full_name) {
                Some(pod) => self.generate_pod_status(&pod).await,
                None => Err(e),
            },
        }
    }

    /// Drops pods whose recorded phase is terminal.
    pub(crate) fn filter_out_terminated_pods(&self, pods: Vec<Pod>) -> Vec<Pod> {
        pods.into_iter()
            .filter(|pod| {
                let phase = self
                    .status_manager
                    .cached_status(&pod.full_name())
                    .map_or(pod.status.phase, |s| s.phase);
                !phase.is_terminal()
            })
            .collect()
    }
}
