//! Admission: which desired pods may run on this node.

use std::collections::BTreeMap;
use std::collections::HashSet;

use api_types::Pod;
use api_types::PodPhase;
use api_types::PodStatus;
use api_types::Protocol;
use api_types::ResourceList;
use tracing::warn;

use super::Kubelet;
use crate::stats::MachineInfo;

const HOST_PORT_CONFLICT: &str = "Pod cannot be started due to host port conflict";
const NODE_SELECTOR_MISMATCH: &str = "Pod cannot be started due to node selector mismatch";
const EXCEEDED_CAPACITY: &str = "Pod cannot be started due to exceeded capacity";

/// Host ports a pod claims. Port 0 means none.
fn host_ports(pod: &Pod) -> Vec<(u16, Protocol)> {
    pod.spec
        .containers
        .iter()
        .flat_map(|c| c.ports.iter())
        .filter(|p| p.host_port != 0)
        .map(|p| (p.host_port, p.protocol))
        .collect()
}

/// Sum of the container limits of a pod.
fn pod_limits(pod: &Pod) -> ResourceList {
    pod.spec
        .containers
        .iter()
        .fold(ResourceList::default(), |total, c| ResourceList {
            cpu_millicores: total
                .cpu_millicores
                .saturating_add(c.resources.limits.cpu_millicores),
            memory_bytes: total
                .memory_bytes
                .saturating_add(c.resources.limits.memory_bytes),
        })
}

fn matches_node_selector(pod: &Pod, labels: &BTreeMap<String, String>) -> bool {
    pod.spec
        .node_selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Tracks what already-admitted pods consume.
#[derive(Default)]
struct Admitted {
    ports: HashSet<(u16, Protocol)>,
    used: ResourceList,
}

impl Admitted {
    fn port_conflict(&self, pod: &Pod) -> bool {
        let ports = host_ports(pod);
        let mut own = HashSet::new();
        // A pod that claims the same port twice conflicts with itself.
        ports
            .iter()
            .any(|port| self.ports.contains(port) || !own.insert(*port))
    }

    /// Zero capacity means unknown and never rejects.
    fn exceeds(&self, pod: &Pod, machine: Option<&MachineInfo>) -> bool {
        let Some(machine) = machine else {
            return false;
        };
        let limits = pod_limits(pod);
        let cpu_capacity = u64::from(machine.num_cores).saturating_mul(1000);
        let memory_capacity = machine.memory_capacity;

        (cpu_capacity != 0
            && self.used.cpu_millicores.saturating_add(limits.cpu_millicores) > cpu_capacity)
            || (memory_capacity != 0
                && self.used.memory_bytes.saturating_add(limits.memory_bytes) > memory_capacity)
    }

    fn add(&mut self, pod: &Pod) {
        self.ports.extend(host_ports(pod));
        let limits = pod_limits(pod);
        self.used.cpu_millicores = self.used.cpu_millicores.saturating_add(limits.cpu_millicores);
        self.used.memory_bytes = self.used.memory_bytes.saturating_add(limits.memory_bytes);
    }
}

impl Kubelet {
    /// Filters `pods` down to the ones this node accepts, oldest first. Rejected pods get a
    /// `Failed` status naming the reason.
    pub(crate) async fn admit_pods(&self, pods: Vec<Pod>) -> Vec<Pod> {
        let mut pods = self.filter_out_terminated_pods(pods);
        pods.sort_by_key(|p| p.metadata.creation_timestamp);

        let labels = match self.node_client.get_node(&self.config.node_name).await {
            Ok(node) => Some(node.metadata.labels),
            Err(report) => {
                warn!(error = ?report, "cannot get node, node selectors are not enforced");
                None
            }
        };
        let machine = match self.stats.machine_info().await {
            Ok(machine) => Some(machine),
            Err(e) => {
                warn!(error = %e, "cannot get machine info, capacity is not enforced");
                None
            }
        };

        let mut admitted = Admitted::default();
        let mut accepted = Vec::with_capacity(pods.len());
        for pod in pods {
            let rejection = if admitted.port_conflict(&pod) {
                Some(HOST_PORT_CONFLICT)
            } else if labels
                .as_ref()
                .is_some_and(|labels| !matches_node_selector(&pod, labels))
            {
                Some(NODE_SELECTOR_MISMATCH)
            } else if admitted.exceeds(&pod, machine.as_ref()) {
                Some(EXCEEDED_CAPACITY)
            } else {
                None
            };

            match rejection {
                Some(message) => {
                    warn!(pod = %pod.full_name(), reason = message, "rejecting pod");
                    self.status_manager.set_pod_status(
                        &pod,
                        PodStatus {
                            phase: PodPhase::Failed,
                            message: message.to_string(),
                            ..Default::default()
                        },
                    );
                }
                None => {
                    admitted.add(&pod);
                    accepted.push(pod);
                }
            }
        }
        accepted
    }
}
