//! Runtime-side view of pods, rebuilt from container listings on every pass.

pub mod hash;
pub mod naming;

use std::collections::HashMap;
use std::fmt;

use api_types::ContainerState;
use chrono::DateTime;
use chrono::Utc;
use tracing::trace;

pub use self::hash::hash_container;
pub use self::hash::hash_pod_spec;
pub use self::hash::pod_infra_container;
pub use self::naming::ContainerName;
use crate::runtime::ContainerRuntime;
use crate::runtime::RawContainer;
use crate::runtime::RuntimeError;

/// Reserved container name of the pod sandbox.
pub const POD_INFRA_CONTAINER_NAME: &str = "POD";

/// Splits `name_namespace` back into its parts.
pub fn split_pod_full_name(full_name: &str) -> Option<(&str, &str)> {
    match full_name.split_once('_') {
        Some((name, namespace)) if !name.is_empty() && !namespace.is_empty() => {
            Some((name, namespace))
        }
        _ => None,
    }
}

/// Opaque runtime identifier of a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A runtime container whose name decoded to one of our identities.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeContainer {
    pub id: ContainerId,
    pub name: ContainerName,
    pub image: String,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
}

impl RuntimeContainer {
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Start time if running, otherwise creation time. Used to order instances.
    pub fn started_at(&self) -> DateTime<Utc> {
        match &self.state {
            ContainerState::Running(running) => running.started_at,
            ContainerState::Terminated(terminated) => terminated.started_at,
            ContainerState::Waiting(_) => None,
        }
        .unwrap_or(self.created_at)
    }
}

/// All observed containers of one pod UID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimePod {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub containers: Vec<RuntimeContainer>,
}

impl RuntimePod {
    pub fn full_name(&self) -> String {
        format!("{}_{}", self.name, self.namespace)
    }

    /// Instances of `container_name`, newest first.
    pub fn instances(&self, container_name: &str) -> Vec<&RuntimeContainer> {
        let mut instances: Vec<&RuntimeContainer> = self
            .containers
            .iter()
            .filter(|c| c.name.container_name == container_name)
            .collect();
        instances.sort_by(|a, b| {
            (b.created_at, b.started_at(), &b.id).cmp(&(a.created_at, a.started_at(), &a.id))
        });
        instances
    }

    /// The running sandbox, if any.
    pub fn infra_container(&self) -> Option<&RuntimeContainer> {
        self.instances(POD_INFRA_CONTAINER_NAME)
            .into_iter()
            .find(|c| c.is_running())
    }

    pub fn find_running(&self, container_name: &str) -> Option<&RuntimeContainer> {
        self.instances(container_name)
            .into_iter()
            .find(|c| c.is_running())
    }
}

/// Decodes names and groups owned containers by pod UID. Foreign containers are dropped.
pub fn group_by_pod(containers: Vec<RawContainer>) -> Vec<RuntimePod> {
    let mut pods: Vec<RuntimePod> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for raw in containers {
        let Some(name) = ContainerName::parse(&raw.name) else {
            trace!(name = %raw.name, "ignoring container not managed by kubelet");
            continue;
        };

        let slot = *index.entry(name.pod_uid.clone()).or_insert_with(|| {
            pods.push(RuntimePod {
                uid: name.pod_uid.clone(),
                name: name.pod_name.clone(),
                namespace: name.pod_namespace.clone(),
                containers: Vec::new(),
            });
            pods.len() - 1
        });

        pods[slot].containers.push(RuntimeContainer {
            id: raw.id,
            name,
            image: raw.image,
            state: raw.state,
            created_at: raw.created_at,
        });
    }

    pods
}

/// Lists the runtime and groups the result by pod.
pub async fn list_pods(
    runtime: &dyn ContainerRuntime,
    all: bool,
) -> Result<Vec<RuntimePod>, RuntimeError> {
    let containers = runtime.list_containers(all).await?;
    Ok(group_by_pod(containers))
}
