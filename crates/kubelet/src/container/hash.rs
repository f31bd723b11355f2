//! Content hashes of container specs.
//!
//! A running container whose recorded hash differs from the hash of its current spec is
//! stale and gets recreated. Only the fields that change what the container runs are part
//! of the hash; the pull policy and termination message path are not.

use api_types::Container;
use api_types::ContainerPort;
use api_types::EnvVar;
use api_types::Lifecycle;
use api_types::Pod;
use api_types::Probe;
use api_types::PullPolicy;
use api_types::ResourceRequirements;
use api_types::VolumeMount;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use super::POD_INFRA_CONTAINER_NAME;

#[derive(Serialize)]
struct HashedContainer<'a> {
    name: &'a str,
    image: &'a str,
    command: &'a [String],
    args: &'a [String],
    working_dir: &'a Option<String>,
    /// Sorted: port declarations have no meaningful order.
    ports: Vec<&'a ContainerPort>,
    env: &'a [EnvVar],
    resources: &'a ResourceRequirements,
    volume_mounts: &'a [VolumeMount],
    liveness_probe: &'a Option<Probe>,
    readiness_probe: &'a Option<Probe>,
    lifecycle: &'a Option<Lifecycle>,
}

fn digest_u64<T: Serialize>(value: &T) -> u64 {
    // Plain structs with string keys always serialize.
    let encoded = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Deterministic hash over the reconciled fields of `container`.
pub fn hash_container(container: &Container) -> u64 {
    let mut ports: Vec<&ContainerPort> = container.ports.iter().collect();
    ports.sort_by(|a, b| {
        (a.container_port, a.protocol as u8, a.host_port, &a.name, &a.host_ip).cmp(&(
            b.container_port,
            b.protocol as u8,
            b.host_port,
            &b.name,
            &b.host_ip,
        ))
    });

    digest_u64(&HashedContainer {
        name: &container.name,
        image: &container.image,
        command: &container.command,
        args: &container.args,
        working_dir: &container.working_dir,
        ports,
        env: &container.env,
        resources: &container.resources,
        volume_mounts: &container.volume_mounts,
        liveness_probe: &container.liveness_probe,
        readiness_probe: &container.readiness_probe,
        lifecycle: &container.lifecycle,
    })
}

/// The sandbox container spec for `pod`. It carries every container's ports unless the
/// pod shares the host network, so a port change recreates the sandbox.
pub fn pod_infra_container(pod: &Pod, infra_image: &str) -> Container {
    let ports = if pod.spec.host_network {
        Vec::new()
    } else {
        pod.spec
            .containers
            .iter()
            .flat_map(|c| c.ports.iter().cloned())
            .collect()
    };

    Container {
        name: POD_INFRA_CONTAINER_NAME.to_string(),
        image: infra_image.to_string(),
        ports,
        image_pull_policy: PullPolicy::IfNotPresent,
        ..Default::default()
    }
}

/// Hash of a whole pod spec, recorded on mirror pods to detect drift from the static pod.
pub fn hash_pod_spec(pod: &Pod) -> String {
    format!("{:016x}", digest_u64(&pod.spec))
}
