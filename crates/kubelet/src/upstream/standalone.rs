//! Control plane stand-in for running without an API server.
//!
//! The node object lives in memory, pod statuses are only logged and mirror pods are
//! never materialised.

use std::sync::Mutex;
use std::sync::PoisonError;

use api_types::Node;
use api_types::ObjectMeta;
use api_types::Pod;
use api_types::PodStatus;
use async_trait::async_trait;
use tracing::debug;
use tracing::info;

use super::MirrorClient;
use super::NodeClient;
use super::PodStatusClient;
use super::UpstreamResult;

pub struct StandaloneUpstream {
    node: Mutex<Node>,
}

impl StandaloneUpstream {
    pub fn new(node_name: &str) -> Self {
        Self {
            node: Mutex::new(Node {
                metadata: ObjectMeta {
                    name: node_name.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            }),
        }
    }

    pub fn node(&self) -> Node {
        self.node.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl NodeClient for StandaloneUpstream {
    async fn get_node(&self, _node_name: &str) -> UpstreamResult<Node> {
        Ok(self.node())
    }

    async fn update_node_status(&self, node: &Node) -> UpstreamResult<()> {
        *self.node.lock().unwrap_or_else(PoisonError::into_inner) = node.clone();
        Ok(())
    }
}

#[async_trait]
impl PodStatusClient for StandaloneUpstream {
    async fn update_pod_status(&self, pod: &Pod, status: &PodStatus) -> UpstreamResult<()> {
        debug!(pod = %pod.full_name(), phase = %status.phase, "pod status");
        Ok(())
    }
}

#[async_trait]
impl MirrorClient for StandaloneUpstream {
    async fn create_mirror_pod(&self, pod: &Pod) -> UpstreamResult<()> {
        info!(pod = %pod.full_name(), "standalone mode, not creating mirror pod");
        Ok(())
    }

    async fn delete_mirror_pod(&self, pod_full_name: &str) -> UpstreamResult<()> {
        info!(pod = %pod_full_name, "standalone mode, not deleting mirror pod");
        Ok(())
    }
}
