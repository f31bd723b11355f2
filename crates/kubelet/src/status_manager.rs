//! Pod status cache and upstream push.
//!
//! Two maps keyed by pod full name: the upstream cache for pods that exist in the control
//! plane, and a local-only map for static pods. Both apply the same merge so restart counts
//! never go backwards. Changed upstream entries are queued (coalesced per pod) and pushed
//! by [`StatusManager::run`] or an explicit [`StatusManager::flush`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use api_types::ConditionStatus;
use api_types::ContainerStatus;
use api_types::Pod;
use api_types::PodCondition;
use api_types::PodConditionType;
use api_types::PodSpec;
use api_types::PodStatus;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use error_stack::Report;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::KubeletError;
use crate::error::Result;
use crate::upstream::PodStatusClient;
use crate::upstream::UpstreamError;
use crate::upstream::UpstreamResult;

/// Ready iff every declared container has a ready status. No spec means not ready; a spec
/// without containers is ready.
pub fn get_pod_ready_condition(
    spec: Option<&PodSpec>,
    statuses: &[ContainerStatus],
) -> Vec<PodCondition> {
    let ready = match spec {
        None => false,
        Some(spec) => spec.containers.iter().all(|container| {
            statuses
                .iter()
                .any(|status| status.name == container.name && status.ready)
        }),
    };
    vec![PodCondition {
        condition_type: PodConditionType::Ready,
        status: if ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        },
    }]
}

/// Folds a fresh observation into the previous one: restart counts only grow, and the
/// Ready condition follows the merged container statuses.
fn merge_status(spec: &PodSpec, previous: Option<&PodStatus>, mut status: PodStatus) -> PodStatus {
    if let Some(previous) = previous {
        for container in &mut status.container_statuses {
            if let Some(old) = previous.container_status(&container.name) {
                container.restart_count = container.restart_count.max(old.restart_count);
            }
        }
    }
    status.conditions = get_pod_ready_condition(Some(spec), &status.container_statuses);
    status
}

pub struct StatusManager {
    statuses: DashMap<String, PodStatus>,
    local_statuses: DashMap<String, PodStatus>,
    pending: DashMap<String, Pod>,
    notify: Notify,
    client: Arc<dyn PodStatusClient>,
    retry: usize,
    retry_delay: Duration,
}

impl StatusManager {
    pub fn new(client: Arc<dyn PodStatusClient>, retry: usize, retry_delay: Duration) -> Self {
        Self {
            statuses: DashMap::new(),
            local_statuses: DashMap::new(),
            pending: DashMap::new(),
            notify: Notify::new(),
            client,
            retry: retry.max(1),
            retry_delay,
        }
    }

    /// Records an observed status. Returns whether the cached value changed.
    ///
    /// An unchanged status still wakes the push loop while an earlier push of the same pod
    /// is queued, so a push that ran out of retries is attempted again on the next sync.
    pub fn set_pod_status(&self, pod: &Pod, status: PodStatus) -> bool {
        let full_name = pod.full_name();
        let target = if pod.is_static() {
            &self.local_statuses
        } else {
            &self.statuses
        };

        let changed = match target.entry(full_name.clone()) {
            Entry::Occupied(mut entry) => {
                let merged = merge_status(&pod.spec, Some(entry.get()), status);
                if *entry.get() == merged {
                    false
                } else {
                    entry.insert(merged);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(merge_status(&pod.spec, None, status));
                true
            }
        };

        if pod.is_static() {
            return changed;
        }
        if changed {
            debug!(pod = %full_name, "queueing status update");
            self.pending.insert(full_name, pod.clone());
            self.notify.notify_one();
        } else if self.pending.contains_key(&full_name) {
            debug!(pod = %full_name, "retrying queued status update");
            self.notify.notify_one();
        }
        changed
    }

    /// Status as last pushed (or queued) upstream. Static pods are never found here.
    pub fn get_pod_status(&self, pod_full_name: &str) -> Result<PodStatus> {
        self.statuses
            .get(pod_full_name)
            .map(|entry| entry.clone())
            .ok_or_else(|| KubeletError::StatusNotFound {
                pod_full_name: pod_full_name.to_string(),
            })
    }

    /// Last recorded status from either map.
    pub fn cached_status(&self, pod_full_name: &str) -> Option<PodStatus> {
        self.statuses
            .get(pod_full_name)
            .or_else(|| self.local_statuses.get(pod_full_name))
            .map(|entry| entry.clone())
    }

    pub fn delete_pod_status(&self, pod_full_name: &str) {
        self.statuses.remove(pod_full_name);
        self.local_statuses.remove(pod_full_name);
        self.pending.remove(pod_full_name);
    }

    /// Drops every entry whose pod is not in `desired`.
    pub fn remove_orphaned_statuses(&self, desired: &HashSet<String>) {
        self.statuses.retain(|full_name, _| desired.contains(full_name));
        self.local_statuses
            .retain(|full_name, _| desired.contains(full_name));
        self.pending.retain(|full_name, _| desired.contains(full_name));
    }

    /// Pushes every queued update. Entries that exhaust their retries stay queued for the
    /// next trigger; the first such failure is returned.
    pub async fn flush(&self) -> UpstreamResult<usize> {
        let queued: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut pushed = 0;
        let mut first_error = None;

        for full_name in queued {
            let Some((_, pod)) = self.pending.remove(&full_name) else {
                continue;
            };
            // Purged while queued.
            let Some(status) = self.statuses.get(&full_name).map(|e| e.clone()) else {
                continue;
            };

            match self.push(&pod, &status).await {
                Ok(()) => pushed += 1,
                Err(report) => {
                    error!(pod = %full_name, error = ?report, "failed to push pod status");
                    self.pending.entry(full_name).or_insert(pod);
                    first_error.get_or_insert(report);
                }
            }
        }

        match first_error {
            Some(report) => Err(report),
            None => Ok(pushed),
        }
    }

    async fn push(&self, pod: &Pod, status: &PodStatus) -> UpstreamResult<()> {
        for attempt in 1..=self.retry {
            match self.client.update_pod_status(pod, status).await {
                Ok(()) => return Ok(()),
                Err(report) => {
                    warn!(pod = %pod.full_name(), attempt, error = ?report, "pod status push failed");
                    if attempt < self.retry {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(Report::new(UpstreamError::PodStatusRetriesExhausted {
            pod_full_name: pod.full_name(),
            attempts: self.retry,
        }))
    }

    /// Pushes queued updates as they arrive until cancelled. Updates that exhaust their
    /// retries stay queued until the next [`StatusManager::set_pod_status`] of that pod.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, token: CancellationToken) {
        info!("starting pod status push loop");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.notify.notified() => {
                    // Errors are logged per pod inside flush.
                    let _ = self.flush().await;
                }
            }
        }
        info!("pod status push loop stopped");
    }
}
