//! Error types of the node agent library.

use std::io;
use std::path::PathBuf;

use crate::lifecycle::HookError;
use crate::runtime::RuntimeError;

/// Unified error type for kubelet operations
#[derive(Debug, thiserror::Error)]
pub enum KubeletError {
    #[error("pod {pod_full_name} requests host network but source {source_name:?} is not allowed to use it")]
    HostNetworkNotAllowed {
        pod_full_name: String,
        source_name: Option<String>,
    },

    #[error("no containers are managed by this kubelet")]
    NoContainers,

    #[error("pod {pod_full_name} not found")]
    PodNotFound { pod_full_name: String },

    #[error("container {container_name} not found in pod {pod_full_name}")]
    ContainerNotFound {
        pod_full_name: String,
        container_name: String,
    },

    #[error("no status recorded for pod {pod_full_name}")]
    StatusNotFound { pod_full_name: String },

    #[error("pod {pod_full_name} is in phase {phase}, expected Running, Succeeded or Failed")]
    InvalidPodPhase {
        pod_full_name: String,
        phase: api_types::PodPhase,
    },

    #[error("container {container_name} is waiting to start")]
    ContainerWaiting { container_name: String },

    #[error("failed to mount volumes for pod {pod_full_name}: {message}")]
    VolumeMount {
        pod_full_name: String,
        message: String,
    },

    #[error("failed to pull image {image}: {source}")]
    ImagePull {
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error("container {container_name}: {source}")]
    Container {
        container_name: String,
        #[source]
        source: RuntimeError,
    },

    #[error("post-start hook of container {container_name} failed: {source}")]
    PostStartHook {
        container_name: String,
        #[source]
        source: HookError,
    },

    #[error("failed to list services for the environment of pod {pod_full_name}: {message}")]
    ServiceEnvironment {
        pod_full_name: String,
        message: String,
    },

    #[error("failed to create data directories of pod {pod_full_name}: {source}")]
    PodDataDirs {
        pod_full_name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read resolver configuration {}: {source}", path.display())]
    ResolverConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("stats unavailable: {message}")]
    Stats { message: String },

    #[error("{}", join(.0))]
    Aggregate(Vec<KubeletError>),
}

fn join(errors: &[KubeletError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl KubeletError {
    /// Folds errors collected during one pass into a single result.
    pub fn aggregate(mut errors: Vec<KubeletError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(KubeletError::Aggregate(errors)),
        }
    }

    /// Lookup misses that callers can report as "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            KubeletError::NoContainers
                | KubeletError::PodNotFound { .. }
                | KubeletError::ContainerNotFound { .. }
                | KubeletError::StatusNotFound { .. }
        )
    }
}

/// Result type for kubelet operations
pub type Result<T> = std::result::Result<T, KubeletError>;
