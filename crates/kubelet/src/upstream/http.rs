//! HTTP client for the control plane.

use std::time::Duration;

use api_types::Node;
use api_types::Pod;
use api_types::PodStatus;
use api_types::ServiceList;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use reqwest::Method;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use url::Url;

use super::MirrorClient;
use super::NodeClient;
use super::PodStatusClient;
use super::ServiceLister;
use super::UpstreamError;
use super::UpstreamResult;
use crate::container::split_pod_full_name;

/// Talks JSON to `<base>/api/v1/...`.
pub struct HttpUpstream {
    base: Url,
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(base: &str, timeout: Duration) -> UpstreamResult<Self> {
        let base = Url::parse(base).change_context(UpstreamError::InvalidEndpoint {
            message: base.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .change_context(UpstreamError::InvalidEndpoint {
                message: "failed to build http client".to_string(),
            })?;
        Ok(Self { base, client })
    }

    fn endpoint(&self, path: &str) -> UpstreamResult<Url> {
        self.base
            .join(path)
            .change_context(UpstreamError::InvalidEndpoint {
                message: path.to_string(),
            })
    }

    /// Sends a request and returns the response status alongside the decoded body, if any.
    async fn send<B, R>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> UpstreamResult<(StatusCode, Option<R>)>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .change_context(UpstreamError::Request {
                url: url.to_string(),
            })?;
        let status = response.status();
        debug!(%method, %url, %status, "control plane request");

        if status == StatusCode::NOT_FOUND {
            return Ok((status, None));
        }
        if !status.is_success() {
            return Err(Report::new(UpstreamError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }));
        }

        let bytes = response
            .bytes()
            .await
            .change_context(UpstreamError::Request {
                url: url.to_string(),
            })?;
        if bytes.is_empty() {
            return Ok((status, None));
        }
        let decoded = serde_json::from_slice(&bytes)
            .change_context(UpstreamError::Request {
                url: url.to_string(),
            })
            .attach_printable("response body is not valid JSON")?;
        Ok((status, Some(decoded)))
    }
}

fn pod_path(namespace: &str, name: &str) -> String {
    format!("api/v1/namespaces/{namespace}/pods/{name}")
}

#[async_trait]
impl NodeClient for HttpUpstream {
    async fn get_node(&self, node_name: &str) -> UpstreamResult<Node> {
        let (_, node) = self
            .send::<(), Node>(Method::GET, &format!("api/v1/nodes/{node_name}"), None)
            .await?;
        node.ok_or_else(|| {
            Report::new(UpstreamError::NodeNotFound {
                node_name: node_name.to_string(),
            })
        })
    }

    async fn update_node_status(&self, node: &Node) -> UpstreamResult<()> {
        let path = format!("api/v1/nodes/{}/status", node.metadata.name);
        let (status, _) = self
            .send::<Node, serde_json::Value>(Method::PUT, &path, Some(node))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(Report::new(UpstreamError::NodeNotFound {
                node_name: node.metadata.name.clone(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl PodStatusClient for HttpUpstream {
    async fn update_pod_status(&self, pod: &Pod, status: &PodStatus) -> UpstreamResult<()> {
        let body = Pod {
            metadata: pod.metadata.clone(),
            status: status.clone(),
            ..Default::default()
        };
        let path = format!(
            "{}/status",
            pod_path(&pod.metadata.namespace, &pod.metadata.name)
        );
        let (code, _) = self
            .send::<Pod, serde_json::Value>(Method::PUT, &path, Some(&body))
            .await?;
        if code == StatusCode::NOT_FOUND {
            return Err(Report::new(UpstreamError::Status {
                url: path,
                status: code.as_u16(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl MirrorClient for HttpUpstream {
    async fn create_mirror_pod(&self, pod: &Pod) -> UpstreamResult<()> {
        let path = format!("api/v1/namespaces/{}/pods", pod.metadata.namespace);
        self.send::<Pod, serde_json::Value>(Method::POST, &path, Some(pod))
            .await?;
        Ok(())
    }

    async fn delete_mirror_pod(&self, pod_full_name: &str) -> UpstreamResult<()> {
        let (name, namespace) = split_pod_full_name(pod_full_name).ok_or_else(|| {
            Report::new(UpstreamError::InvalidEndpoint {
                message: format!("malformed pod full name {pod_full_name}"),
            })
        })?;
        // Already gone is fine.
        self.send::<(), serde_json::Value>(Method::DELETE, &pod_path(namespace, name), None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceLister for HttpUpstream {
    async fn list_services(&self) -> UpstreamResult<ServiceList> {
        let (_, services) = self
            .send::<(), ServiceList>(Method::GET, "api/v1/services", None)
            .await?;
        Ok(services.unwrap_or_default())
    }
}
