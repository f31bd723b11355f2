//! Node status reporting.

use api_types::ConditionStatus;
use api_types::NodeCondition;
use api_types::NodeConditionType;
use api_types::NodeSystemInfo;
use api_types::ResourceList;
use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::Kubelet;
use crate::upstream::UpstreamError;
use crate::upstream::UpstreamResult;

const READY_REASON: &str = "kubelet is posting ready status";
const RUNTIME_DOWN_REASON: &str = "container runtime is down";

/// Sets the `Ready` condition, keeping the transition time unless the status flips.
fn set_ready_condition(
    conditions: &mut Vec<NodeCondition>,
    status: ConditionStatus,
    reason: &str,
    now: DateTime<Utc>,
) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == NodeConditionType::Ready)
    {
        Some(condition) => {
            if condition.status != status {
                condition.last_transition_time = Some(now);
            }
            condition.status = status;
            condition.reason = reason.to_string();
            condition.last_heartbeat_time = Some(now);
        }
        None => conditions.push(NodeCondition {
            condition_type: NodeConditionType::Ready,
            status,
            reason: reason.to_string(),
            last_heartbeat_time: Some(now),
            last_transition_time: Some(now),
        }),
    }
}

impl Kubelet {
    /// Reports node facts and readiness upstream, retrying a bounded number of times.
    pub async fn update_node_status(&self) -> UpstreamResult<()> {
        let attempts = self.config.node_status_update_retry;
        for attempt in 1..=attempts {
            match self.try_update_node_status().await {
                Ok(()) => return Ok(()),
                Err(report) => {
                    warn!(attempt, error = ?report, "error updating node status, will retry");
                }
            }
        }
        Err(Report::new(UpstreamError::NodeStatusRetriesExhausted { attempts }))
    }

    async fn try_update_node_status(&self) -> UpstreamResult<()> {
        let node_name = &self.config.node_name;
        let mut node = self.node_client.get_node(node_name).await?;

        let machine = self
            .stats
            .machine_info()
            .await
            .change_context_lazy(|| UpstreamError::MachineInfo {
                message: format!("cannot read machine info for node {node_name}"),
            })?;
        let version = self.stats.version_info().await.unwrap_or_else(|e| {
            warn!(error = %e, "cannot read version info");
            Default::default()
        });
        let runtime_version = self.runtime.version().await;

        node.status.node_info = NodeSystemInfo {
            machine_id: machine.machine_id,
            system_uuid: machine.system_uuid,
            boot_id: machine.boot_id,
            kernel_version: version.kernel_version,
            os_image: version.container_os_version,
            container_runtime_version: match &runtime_version {
                Ok(v) => format!("{}://{}", self.runtime.type_name(), v),
                Err(_) => String::new(),
            },
            kubelet_version: utils::version::VERSION.to_string(),
        };
        node.status.capacity = ResourceList {
            cpu_millicores: u64::from(machine.num_cores) * 1000,
            memory_bytes: machine.memory_capacity,
        };

        let (status, reason) = match &runtime_version {
            Ok(_) => (ConditionStatus::True, READY_REASON),
            Err(e) => {
                warn!(error = %e, "cannot read container runtime version");
                (ConditionStatus::False, RUNTIME_DOWN_REASON)
            }
        };
        set_ready_condition(&mut node.status.conditions, status, reason, Utc::now());

        self.node_client.update_node_status(&node).await
    }

    /// Updates the node status every `node_status_update_frequency` until cancelled.
    #[tracing::instrument(skip_all)]
    pub async fn run_node_status_loop(&self, token: CancellationToken) {
        info!(node = %self.config.node_name, "starting node status loop");
        let mut ticker = tokio::time::interval(self.config.node_status_update_frequency);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(report) = self.update_node_status().await {
                        error!(error = ?report, "unable to update node status");
                    }
                }
            }
        }
        info!("node status loop stopped");
    }
}
