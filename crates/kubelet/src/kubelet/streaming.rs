//! Container lookups backing logs, exec, attach-style commands, port forwarding and stats.

use tokio::io::DuplexStream;

use super::Kubelet;
use super::status::validate_container_status;
use super::status::validate_pod_phase;
use crate::container::list_pods;
use crate::container::ContainerId;
use crate::container::POD_INFRA_CONTAINER_NAME;
use crate::error::KubeletError;
use crate::error::Result;
use crate::runtime::ExecOutput;
use crate::stats::ContainerInfo;
use crate::stats::ContainerInfoRequest;

impl Kubelet {
    /// Resolves a running container by pod full name, pod UID and container name. Mirror
    /// UIDs are translated to their static pod; an empty UID matches any pod of that name.
    async fn find_container(
        &self,
        pod_full_name: &str,
        uid: &str,
        container_name: &str,
    ) -> Result<ContainerId> {
        let uid = self.pod_manager.translate_pod_uid(uid);
        let pods = list_pods(&*self.runtime, false).await?;
        if pods.is_empty() {
            return Err(KubeletError::NoContainers);
        }

        let pod = pods
            .iter()
            .find(|p| p.full_name() == pod_full_name && (uid.is_empty() || p.uid == uid))
            .ok_or_else(|| KubeletError::PodNotFound {
                pod_full_name: pod_full_name.to_string(),
            })?;

        pod.find_running(container_name)
            .map(|c| c.id.clone())
            .ok_or_else(|| KubeletError::ContainerNotFound {
                pod_full_name: pod_full_name.to_string(),
                container_name: container_name.to_string(),
            })
    }

    pub async fn get_container_info(
        &self,
        pod_full_name: &str,
        uid: &str,
        container_name: &str,
        request: &ContainerInfoRequest,
    ) -> Result<ContainerInfo> {
        let id = self
            .find_container(pod_full_name, uid, container_name)
            .await?;
        self.stats
            .container_info(&id, request)
            .await
            .map_err(|e| KubeletError::Stats {
                message: e.to_string(),
            })
    }

    pub async fn run_in_container(
        &self,
        pod_full_name: &str,
        uid: &str,
        container_name: &str,
        cmd: &[String],
    ) -> Result<Vec<u8>> {
        let id = self
            .find_container(pod_full_name, uid, container_name)
            .await?;
        Ok(self.command_runner.run_in_container(&id, cmd).await?)
    }

    pub async fn exec_in_container(
        &self,
        pod_full_name: &str,
        uid: &str,
        container_name: &str,
        cmd: &[String],
        tty: bool,
    ) -> Result<ExecOutput> {
        let id = self
            .find_container(pod_full_name, uid, container_name)
            .await?;
        Ok(self
            .command_runner
            .exec_in_container(&id, cmd, tty)
            .await?)
    }

    /// Forwards `stream` to `port` inside the pod's network namespace.
    pub async fn port_forward(
        &self,
        pod_full_name: &str,
        uid: &str,
        port: u16,
        stream: DuplexStream,
    ) -> Result<()> {
        let sandbox = self
            .find_container(pod_full_name, uid, POD_INFRA_CONTAINER_NAME)
            .await?;
        Ok(self
            .command_runner
            .port_forward(&sandbox, port, stream)
            .await?)
    }

    /// Runtime ID of the container whose logs can be served, as reported in the pod status.
    pub async fn container_log_target(
        &self,
        pod_full_name: &str,
        container_name: &str,
    ) -> Result<String> {
        let status = self.get_pod_status(pod_full_name).await?;
        validate_pod_phase(pod_full_name, &status)?;
        validate_container_status(pod_full_name, &status, container_name)
    }
}
