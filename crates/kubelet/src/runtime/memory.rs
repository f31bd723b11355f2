//! In-process container runtime.
//!
//! Containers are records in a vector; "running" means nothing more than the state field.
//! Every call is appended to a call log so tests can assert on exactly what the sync
//! engine asked for, and individual operations can be made to fail.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use api_types::ContainerState;
use api_types::ContainerStateRunning;
use api_types::ContainerStateTerminated;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use tokio::io::DuplexStream;
use tracing::debug;

use super::CommandRunner;
use super::ContainerDetail;
use super::ContainerRuntime;
use super::CreateContainerRequest;
use super::ExecOutput;
use super::NetworkMode;
use super::RawContainer;
use super::RuntimeError;
use crate::container::ContainerId;

/// Runtime operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Create,
    Kill,
    Inspect,
    Pull,
    Exec,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::Create => "create",
            Operation::Kill => "stop",
            Operation::Inspect => "inspect_container",
            Operation::Pull => "pull",
            Operation::Exec => "exec",
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryContainer {
    id: ContainerId,
    name: String,
    image: String,
    state: ContainerState,
    created_at: DateTime<Utc>,
    ip_address: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    containers: Vec<MemoryContainer>,
    images: HashSet<String>,
    calls: Vec<String>,
    created: Vec<String>,
    requests: Vec<CreateContainerRequest>,
    stopped: Vec<ContainerId>,
    pulled: Vec<String>,
    commands: Vec<(ContainerId, Vec<String>)>,
    failures: HashMap<Operation, String>,
    exec_output: ExecOutput,
    next_id: u64,
    last_created: Option<DateTime<Utc>>,
}

impl State {
    fn check(&mut self, operation: Operation) -> Result<(), RuntimeError> {
        match self.failures.get(&operation) {
            Some(message) => Err(RuntimeError::Call {
                operation: operation.name(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Creation timestamps are strictly increasing so instance order is well defined.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_created {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_created = Some(ts);
        ts
    }

    fn find(&self, id: &ContainerId) -> Result<&MemoryContainer, RuntimeError> {
        self.containers
            .iter()
            .find(|c| &c.id == id)
            .ok_or_else(|| RuntimeError::NotFound { id: id.clone() })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    state: Mutex<State>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds a container as if it had been created earlier.
    pub fn insert_container(&self, id: &str, name: &str, image: &str, state: ContainerState) {
        let mut guard = self.state();
        let created_at = guard.next_timestamp();
        guard.containers.push(MemoryContainer {
            id: ContainerId::from(id),
            name: name.to_string(),
            image: image.to_string(),
            state,
            created_at,
            ip_address: None,
        });
    }

    pub fn add_image(&self, image: &str) {
        self.state().images.insert(image.to_string());
    }

    pub fn fail(&self, operation: Operation, message: &str) {
        self.state().failures.insert(operation, message.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn set_exec_output(&self, output: ExecOutput) {
        self.state().exec_output = output;
    }

    /// Marks a container as exited with `exit_code`.
    pub fn exit_container(&self, id: &str, exit_code: i32) {
        let mut guard = self.state();
        if let Some(container) = guard.containers.iter_mut().find(|c| c.id.as_str() == id) {
            container.state = terminated(&container.state, exit_code, "Exited");
        }
    }

    /// Forgets a container entirely, as runtime garbage collection would.
    pub fn remove_container(&self, id: &str) {
        self.state().containers.retain(|c| c.id.as_str() != id);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        let mut guard = self.state();
        guard.calls.clear();
        guard.created.clear();
        guard.requests.clear();
        guard.stopped.clear();
        guard.pulled.clear();
        guard.commands.clear();
    }

    /// Encoded names of containers created, in order.
    pub fn created(&self) -> Vec<String> {
        self.state().created.clone()
    }

    /// Every create request, in order.
    pub fn requests(&self) -> Vec<CreateContainerRequest> {
        self.state().requests.clone()
    }

    pub fn stopped(&self) -> Vec<ContainerId> {
        self.state().stopped.clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state().pulled.clone()
    }

    pub fn commands(&self) -> Vec<(ContainerId, Vec<String>)> {
        self.state().commands.clone()
    }

    pub fn listing(&self) -> Vec<RawContainer> {
        self.state().containers.iter().map(to_raw).collect()
    }
}

fn to_raw(container: &MemoryContainer) -> RawContainer {
    RawContainer {
        id: container.id.clone(),
        name: container.name.clone(),
        image: container.image.clone(),
        state: container.state.clone(),
        created_at: container.created_at,
    }
}

fn terminated(state: &ContainerState, exit_code: i32, reason: &str) -> ContainerState {
    let started_at = match state {
        ContainerState::Running(running) => running.started_at,
        ContainerState::Terminated(terminated) => return ContainerState::Terminated(terminated.clone()),
        ContainerState::Waiting(_) => None,
    };
    ContainerState::Terminated(ContainerStateTerminated {
        exit_code,
        reason: reason.to_string(),
        started_at,
        finished_at: Some(Utc::now()),
        ..Default::default()
    })
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    fn type_name(&self) -> &'static str {
        "memory"
    }

    async fn version(&self) -> Result<String, RuntimeError> {
        Ok(env!("CARGO_PKG_VERSION").to_string())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<RawContainer>, RuntimeError> {
        let mut guard = self.state();
        guard.calls.push("list".to_string());
        guard.check(Operation::List)?;
        Ok(guard
            .containers
            .iter()
            .filter(|c| all || c.state.is_running())
            .map(to_raw)
            .collect())
    }

    async fn create_and_start(
        &self,
        request: CreateContainerRequest,
    ) -> Result<ContainerId, RuntimeError> {
        let mut guard = self.state();
        guard.calls.push("create".to_string());
        guard.check(Operation::Create)?;

        guard.next_id += 1;
        let id = ContainerId::new(format!("{:012x}", guard.next_id));
        let ip_address = match &request.network_mode {
            NetworkMode::Default => Some(format!("10.88.0.{}", guard.next_id % 250 + 2)),
            NetworkMode::Host => None,
            NetworkMode::Container(sandbox) => guard.find(sandbox)?.ip_address.clone(),
        };
        let created_at = guard.next_timestamp();

        guard.created.push(request.name.clone());
        guard.requests.push(request.clone());
        guard.calls.push("start".to_string());
        guard.containers.push(MemoryContainer {
            id: id.clone(),
            name: request.name,
            image: request.image,
            state: ContainerState::Running(ContainerStateRunning {
                started_at: Some(created_at),
            }),
            created_at,
            ip_address,
        });
        debug!(container_id = %id, "created container");
        Ok(id)
    }

    async fn kill(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let mut guard = self.state();
        guard.calls.push("stop".to_string());
        guard.check(Operation::Kill)?;

        let container = guard
            .containers
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| RuntimeError::NotFound { id: id.clone() })?;
        container.state = terminated(&container.state, 137, "Killed");
        guard.stopped.push(id.clone());
        Ok(())
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerDetail, RuntimeError> {
        let mut guard = self.state();
        guard.calls.push("inspect_container".to_string());
        guard.check(Operation::Inspect)?;

        let container = guard.find(id)?;
        Ok(ContainerDetail {
            id: container.id.clone(),
            name: container.name.clone(),
            image: container.image.clone(),
            state: container.state.clone(),
            ip_address: container.ip_address.clone(),
        })
    }

    async fn is_image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        let mut guard = self.state();
        guard.calls.push("inspect_image".to_string());
        Ok(guard.images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut guard = self.state();
        guard.calls.push("pull".to_string());
        guard.check(Operation::Pull)?;
        guard.pulled.push(image.to_string());
        guard.images.insert(image.to_string());
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for InMemoryRuntime {
    async fn run_in_container(
        &self,
        id: &ContainerId,
        cmd: &[String],
    ) -> Result<Vec<u8>, RuntimeError> {
        let output = self.exec_in_container(id, cmd, false).await?;
        let mut combined = output.stdout;
        combined.extend(output.stderr);
        Ok(combined)
    }

    async fn exec_in_container(
        &self,
        id: &ContainerId,
        cmd: &[String],
        _tty: bool,
    ) -> Result<ExecOutput, RuntimeError> {
        let mut guard = self.state();
        guard.calls.push("exec".to_string());
        guard.check(Operation::Exec)?;
        guard.find(id)?;
        guard.commands.push((id.clone(), cmd.to_vec()));
        Ok(guard.exec_output.clone())
    }

    async fn port_forward(
        &self,
        sandbox: &ContainerId,
        port: u16,
        _stream: DuplexStream,
    ) -> Result<(), RuntimeError> {
        let mut guard = self.state();
        guard.calls.push("port_forward".to_string());
        guard.find(sandbox)?;
        guard
            .commands
            .push((sandbox.clone(), vec!["port-forward".to_string(), port.to_string()]));
        Ok(())
    }
}
