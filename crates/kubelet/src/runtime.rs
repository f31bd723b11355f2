//! Container runtime facade.
//!
//! The sync engine only ever talks to a runtime through [`ContainerRuntime`] and
//! [`CommandRunner`]. Concrete clients (Docker, CRI) live outside this crate; the
//! in-process [`memory::InMemoryRuntime`] backs tests and standalone mode.

pub mod memory;

use api_types::ContainerPort;
use api_types::ContainerState;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;
use tokio::io::DuplexStream;

use crate::container::ContainerId;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container {id} not found")]
    NotFound { id: ContainerId },

    #[error("runtime {operation} failed: {message}")]
    Call {
        operation: &'static str,
        message: String,
    },

    #[error("{operation} is not supported by this runtime")]
    Unsupported { operation: &'static str },
}

/// One entry of a runtime listing, before its name is decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RawContainer {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDetail {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NetworkMode {
    #[default]
    Default,
    Host,
    /// Join the network namespace of another container, normally the pod sandbox.
    Container(ContainerId),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateContainerRequest {
    /// Encoded runtime name, see [`crate::container::ContainerName`].
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub ports: Vec<ContainerPort>,
    /// `host:container[:ro]` bind mounts.
    pub binds: Vec<String>,
    pub network_mode: NetworkMode,
    /// Nameservers; empty keeps the runtime's default.
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short runtime name used in container IDs reported upstream (`<type>://<id>`).
    fn type_name(&self) -> &'static str;

    async fn version(&self) -> Result<String, RuntimeError>;

    /// Lists containers; exited ones are included only when `all` is set.
    async fn list_containers(&self, all: bool) -> Result<Vec<RawContainer>, RuntimeError>;

    async fn create_and_start(
        &self,
        request: CreateContainerRequest,
    ) -> Result<ContainerId, RuntimeError>;

    async fn kill(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerDetail, RuntimeError>;

    async fn is_image_present(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Runs commands inside containers and forwards ports into pod sandboxes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `cmd` to completion and returns its combined output.
    async fn run_in_container(
        &self,
        id: &ContainerId,
        cmd: &[String],
    ) -> Result<Vec<u8>, RuntimeError>;

    async fn exec_in_container(
        &self,
        id: &ContainerId,
        cmd: &[String],
        tty: bool,
    ) -> Result<ExecOutput, RuntimeError>;

    async fn port_forward(
        &self,
        sandbox: &ContainerId,
        port: u16,
        stream: DuplexStream,
    ) -> Result<(), RuntimeError>;
}
