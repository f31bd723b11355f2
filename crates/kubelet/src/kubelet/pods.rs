//! Top-level reconciliation over the whole desired pod set.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Instant;

use api_types::Pod;
use futures::future::join_all;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::Kubelet;
use crate::container::list_pods;
use crate::container::ContainerId;
use crate::container::RuntimePod;
use crate::error::KubeletError;
use crate::error::Result;

impl Kubelet {
    /// Reconciles the node against `all_pods`.
    ///
    /// Statuses of pods that are no longer desired are purged, the remaining pods go through
    /// admission and are handed to their workers. Destructive cleanup (killing orphaned pods,
    /// tearing down their volumes, deleting orphaned mirror pods) only happens once every
    /// configuration source has reported, so a partial view never deletes anything.
    #[tracing::instrument(skip_all, fields(pods = all_pods.len()))]
    pub async fn sync_pods(
        &self,
        all_pods: Vec<Pod>,
        deletion_set: &HashSet<String>,
        mirror_pods: &HashMap<String, Pod>,
        start: Instant,
    ) -> Result<()> {
        let desired_full_names: HashSet<String> = all_pods.iter().map(Pod::full_name).collect();
        self.status_manager
            .remove_orphaned_statuses(&desired_full_names);

        let candidates: Vec<Pod> = all_pods
            .into_iter()
            .filter(|pod| !deletion_set.contains(pod.uid()))
            .collect();
        let pods = self.admit_pods(candidates).await;
        let desired_uids: HashSet<String> = pods.iter().map(|p| p.uid().to_string()).collect();
        self.failure_reasons
            .retain(|(uid, _), _| desired_uids.contains(uid));

        for pod in pods {
            let mirror_pod = mirror_pods.get(&pod.full_name()).cloned();
            self.pod_workers.update_pod(pod, mirror_pod);
        }
        self.pod_workers
            .forget_non_existing_pod_workers(&desired_uids);

        if !(self.sources_ready)() {
            debug!("skipping cleanup, sources aren't ready yet");
            return Ok(());
        }

        let running = list_pods(&*self.runtime, false).await?;
        let running_ids: HashSet<ContainerId> = running
            .iter()
            .flat_map(|pod| pod.containers.iter().map(|c| c.id.clone()))
            .collect();
        self.readiness.retain_ids(&running_ids);
        let mut errors = self.kill_unwanted_pods(&desired_uids, &running).await;

        if let Err(e) = self.cleanup_orphaned_volumes(&desired_uids).await {
            errors.push(e);
        }
        self.pod_manager.delete_orphaned_mirror_pods().await;

        debug!(elapsed = ?start.elapsed(), "sync pods finished");
        KubeletError::aggregate(errors)
    }

    /// Stops every running container of pods that are not desired. Pods are handled
    /// concurrently.
    async fn kill_unwanted_pods(
        &self,
        desired_uids: &HashSet<String>,
        running: &[RuntimePod],
    ) -> Vec<KubeletError> {
        let unwanted = running
            .iter()
            .filter(|pod| !desired_uids.contains(&pod.uid))
            .map(|pod| async move {
                info!(pod = %pod.full_name(), uid = %pod.uid, "killing unwanted pod");
                let mut errors = Vec::new();
                for container in pod.containers.iter().filter(|c| c.is_running()) {
                    if let Err(e) = self.kill_container(container, None, None).await {
                        errors.push(e);
                    }
                }
                errors
            });

        join_all(unwanted).await.into_iter().flatten().collect()
    }

    /// Tears down volumes of pods that are neither desired nor still running.
    async fn cleanup_orphaned_volumes(&self, desired_uids: &HashSet<String>) -> Result<()> {
        let running_uids: HashSet<String> = list_pods(&*self.runtime, false)
            .await?
            .into_iter()
            .map(|pod| pod.uid)
            .collect();

        let mounted = match self.volume_mounter.list_mounted_on_disk().await {
            Ok(mounted) => mounted,
            Err(e) => {
                warn!(error = %e, "failed to list mounted volumes");
                return Ok(());
            }
        };

        for volume in mounted {
            if desired_uids.contains(&volume.pod_uid) || running_uids.contains(&volume.pod_uid) {
                continue;
            }
            info!(pod_uid = %volume.pod_uid, volume = %volume.name, "tearing down orphaned volume");
            if let Err(e) = self.volume_mounter.tear_down(&volume).await {
                warn!(pod_uid = %volume.pod_uid, volume = %volume.name, error = %e, "failed to tear down volume");
                continue;
            }
            self.volumes.remove_volumes(&volume.pod_uid);
        }
        Ok(())
    }
}
