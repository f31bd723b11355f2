//! Runtime container names.
//!
//! Every container this agent creates is named
//! `k8s_<container>.<hash>_<pod>_<namespace>_<uid>_<suffix>`. The name is the only place
//! workload identity survives a restart of the agent, so encoding and decoding live here and
//! nowhere else. A name that does not decode belongs to someone else and is left alone.

use std::fmt;

use api_types::Pod;

const CONTAINER_NAME_PREFIX: &str = "k8s";

/// Decoded identity of a runtime container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerName {
    pub container_name: String,
    /// Content hash of the spec the container was created from. Zero means unknown.
    pub hash: u64,
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_uid: String,
    /// Disambiguates instances that otherwise share the same identity.
    pub suffix: String,
}

impl ContainerName {
    /// Identity for a new instance of `container_name` in `pod`, with a fresh suffix.
    pub fn for_pod(pod: &Pod, container_name: &str, hash: u64) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            container_name: container_name.to_string(),
            hash,
            pod_name: pod.metadata.name.clone(),
            pod_namespace: pod.metadata.namespace.clone(),
            pod_uid: pod.metadata.uid.clone(),
            suffix,
        }
    }

    pub fn pod_full_name(&self) -> String {
        format!("{}_{}", self.pod_name, self.pod_namespace)
    }

    /// Decodes a runtime name. Returns `None` when the container is not ours.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.strip_prefix('/').unwrap_or(name);
        let parts: Vec<&str> = name.split('_').collect();
        let [prefix, container, pod_name, pod_namespace, pod_uid, suffix] = parts.as_slice() else {
            return None;
        };
        if *prefix != CONTAINER_NAME_PREFIX || pod_name.is_empty() || pod_namespace.is_empty() {
            return None;
        }

        let (container_name, hash) = match container.split_once('.') {
            Some((container_name, hash)) => {
                (container_name, u64::from_str_radix(hash, 16).unwrap_or(0))
            }
            None => (*container, 0),
        };
        if container_name.is_empty() {
            return None;
        }

        Some(Self {
            container_name: container_name.to_string(),
            hash,
            pod_name: pod_name.to_string(),
            pod_namespace: pod_namespace.to_string(),
            pod_uid: pod_uid.to_string(),
            suffix: suffix.to_string(),
        })
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{CONTAINER_NAME_PREFIX}_{}.{:x}_{}_{}_{}_{}",
            self.container_name,
            self.hash,
            self.pod_name,
            self.pod_namespace,
            self.pod_uid,
            self.suffix
        )
    }
}
