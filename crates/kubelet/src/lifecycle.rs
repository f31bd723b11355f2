//! Lifecycle handlers (post-start / pre-stop) and the transports they run over.

use std::sync::Arc;
use std::time::Duration;

use api_types::Container;
use api_types::Handler;
use api_types::HttpGetAction;
use api_types::Pod;
use api_types::PortRef;
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::container::ContainerId;
use crate::runtime::CommandRunner;
use crate::runtime::ContainerRuntime;
use crate::runtime::RuntimeError;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("handler defines neither exec nor httpGet")]
    InvalidHandler,

    #[error("named port {port} is not declared by the container")]
    UnknownPort { port: String },

    #[error("container has no IP address to send the request to")]
    NoHost,

    #[error("GET {url} failed: {message}")]
    Http { url: String, message: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Performs an HTTP GET and reports success or failure.
#[async_trait]
pub trait HttpGetter: Send + Sync {
    async fn get(&self, url: &str) -> Result<(), HookError>;
}

/// Runs a lifecycle handler against a started container.
#[async_trait]
pub trait HandlerRunner: Send + Sync {
    async fn run(
        &self,
        container_id: &ContainerId,
        pod: &Pod,
        container: &Container,
        handler: &Handler,
    ) -> Result<(), HookError>;
}

/// [`HttpGetter`] over reqwest. Non-2xx responses count as failures.
pub struct ReqwestHttpGetter {
    client: reqwest::Client,
}

impl ReqwestHttpGetter {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpGetter for ReqwestHttpGetter {
    async fn get(&self, url: &str) -> Result<(), HookError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| HookError::Http {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        debug!(url, status = %response.status(), "lifecycle GET succeeded");
        Ok(())
    }
}

/// Runs exec handlers through the runtime's command runner and HTTP handlers through an
/// [`HttpGetter`], resolving an empty host to the container's IP.
pub struct LifecycleHandlerRunner {
    http: Arc<dyn HttpGetter>,
    commands: Arc<dyn CommandRunner>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl LifecycleHandlerRunner {
    pub fn new(
        http: Arc<dyn HttpGetter>,
        commands: Arc<dyn CommandRunner>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            http,
            commands,
            runtime,
        }
    }

    async fn url_for(
        &self,
        container_id: &ContainerId,
        container: &Container,
        action: &HttpGetAction,
    ) -> Result<String, HookError> {
        let host = if action.host.is_empty() {
            self.runtime
                .inspect(container_id)
                .await?
                .ip_address
                .ok_or(HookError::NoHost)?
        } else {
            action.host.clone()
        };
        let port = resolve_port(&action.port, container)?;
        Ok(build_url(&host, port, &action.path))
    }
}

#[async_trait]
impl HandlerRunner for LifecycleHandlerRunner {
    async fn run(
        &self,
        container_id: &ContainerId,
        _pod: &Pod,
        container: &Container,
        handler: &Handler,
    ) -> Result<(), HookError> {
        if let Some(exec) = &handler.exec {
            self.commands
                .run_in_container(container_id, &exec.command)
                .await?;
            return Ok(());
        }
        if let Some(action) = &handler.http_get {
            let url = self.url_for(container_id, container, action).await?;
            return self.http.get(&url).await;
        }
        Err(HookError::InvalidHandler)
    }
}

pub(crate) fn resolve_port(port: &PortRef, container: &Container) -> Result<u16, HookError> {
    match port {
        PortRef::Number(port) => Ok(*port),
        PortRef::Name(name) => container
            .ports
            .iter()
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .map(|p| p.container_port)
            .or_else(|| name.parse().ok())
            .ok_or_else(|| HookError::UnknownPort { port: name.clone() }),
    }
}

pub(crate) fn build_url(host: &str, port: u16, path: &str) -> String {
    if path.starts_with('/') {
        format!("http://{host}:{port}{path}")
    } else {
        format!("http://{host}:{port}/{path}")
    }
}
