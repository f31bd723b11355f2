//! Control-plane side collaborators: node object access, pod status push, mirror pods and
//! the service listing used for container environments.

pub mod http;
pub mod standalone;

use core::error::Error;

use api_types::Node;
use api_types::Pod;
use api_types::PodStatus;
use api_types::ServiceList;
use async_trait::async_trait;
use derive_more::Display;
use error_stack::Report;

/// Result type for control-plane operations.
pub type UpstreamResult<T> = Result<T, Report<UpstreamError>>;

/// Errors talking to the control plane.
#[derive(Debug, Display)]
pub enum UpstreamError {
    /// The node object does not exist (yet)
    #[display("Node not found: {node_name}")]
    NodeNotFound { node_name: String },

    /// Transport level failure
    #[display("Request to {url} failed")]
    Request { url: String },

    /// Non-success response
    #[display("Request to {url} returned status {status}")]
    Status { url: String, status: u16 },

    /// Malformed endpoint
    #[display("Invalid endpoint: {message}")]
    InvalidEndpoint { message: String },

    /// Node status retry budget used up
    #[display("Failed to update node status after {attempts} attempts")]
    NodeStatusRetriesExhausted { attempts: usize },

    /// Pod status retry budget used up
    #[display("Failed to push status of pod {pod_full_name} after {attempts} attempts")]
    PodStatusRetriesExhausted {
        pod_full_name: String,
        attempts: usize,
    },

    /// Machine facts could not be gathered
    #[display("Machine info unavailable: {message}")]
    MachineInfo { message: String },
}

impl Error for UpstreamError {}

#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_node(&self, node_name: &str) -> UpstreamResult<Node>;

    async fn update_node_status(&self, node: &Node) -> UpstreamResult<()>;
}

#[async_trait]
pub trait PodStatusClient: Send + Sync {
    async fn update_pod_status(&self, pod: &Pod, status: &PodStatus) -> UpstreamResult<()>;
}

/// Creates and deletes mirror pods, the control-plane shadows of static pods.
#[async_trait]
pub trait MirrorClient: Send + Sync {
    async fn create_mirror_pod(&self, pod: &Pod) -> UpstreamResult<()>;

    async fn delete_mirror_pod(&self, pod_full_name: &str) -> UpstreamResult<()>;
}

/// Lists the services of every namespace.
#[async_trait]
pub trait ServiceLister: Send + Sync {
    async fn list_services(&self) -> UpstreamResult<ServiceList>;
}
