//! Per-pod serialized sync lanes.
//!
//! Each pod UID gets its own task fed by a channel with room for one update. While a sync
//! is in flight, newer updates for the same pod overwrite a single undelivered slot, so a
//! lane never holds more than the running sync plus the latest desired state.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use api_types::Pod;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::debug;
use tracing::error;

use crate::error::Result;

/// Reconciles one pod. Implemented by the kubelet.
#[async_trait]
pub trait PodSyncer: Send + Sync {
    async fn sync_pod(&self, pod: &Pod, mirror_pod: Option<&Pod>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkUpdate {
    pub pod: Pod,
    pub mirror_pod: Option<Pod>,
}

#[derive(Default)]
struct LaneState {
    lanes: HashMap<String, mpsc::Sender<WorkUpdate>>,
    /// UIDs with a sync in flight or queued on the channel.
    working: HashSet<String>,
    last_undelivered: HashMap<String, WorkUpdate>,
}

struct Inner {
    state: Mutex<LaneState>,
    syncer: Weak<dyn PodSyncer>,
    idle: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn manage_pod_loop(self: Arc<Self>, uid: String, mut updates: mpsc::Receiver<WorkUpdate>) {
        while let Some(work) = updates.recv().await {
            let Some(syncer) = self.syncer.upgrade() else {
                break;
            };
            if let Err(e) = syncer
                .sync_pod(&work.pod, work.mirror_pod.as_ref())
                .await
            {
                error!(pod = %work.pod.full_name(), error = %e, "error syncing pod, skipping");
            }
            drop(syncer);
            self.wrap_up(&uid);
        }
        debug!(pod_uid = %uid, "pod worker stopped");
    }

    /// Hands the lane its coalesced follow-up, or marks it idle.
    fn wrap_up(&self, uid: &str) {
        let mut state = self.state();
        let next = state.last_undelivered.remove(uid);
        let delivered = match (next, state.lanes.get(uid)) {
            (Some(work), Some(lane)) => lane.try_send(work).is_ok(),
            _ => false,
        };
        if !delivered {
            state.working.remove(uid);
            if state.working.is_empty() {
                self.idle.notify_waiters();
            }
        }
    }
}

pub struct PodWorkers {
    inner: Arc<Inner>,
}

impl PodWorkers {
    pub fn new(syncer: Weak<dyn PodSyncer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LaneState::default()),
                syncer,
                idle: Notify::new(),
            }),
        }
    }

    /// Schedules a sync of `pod`. Must be called from within a tokio runtime.
    pub fn update_pod(&self, pod: Pod, mirror_pod: Option<Pod>) {
        let uid = pod.uid().to_string();
        let work = WorkUpdate { pod, mirror_pod };
        let mut state = self.inner.state();

        let lane = match state.lanes.get(&uid) {
            Some(lane) => lane.clone(),
            None => {
                let (sender, receiver) = mpsc::channel(1);
                state.lanes.insert(uid.clone(), sender.clone());
                tokio::spawn(self.inner.clone().manage_pod_loop(uid.clone(), receiver));
                sender
            }
        };

        if state.working.contains(&uid) {
            state.last_undelivered.insert(uid, work);
            return;
        }

        // The lane is idle, so its single slot is free.
        match lane.try_send(work) {
            Ok(()) => {
                state.working.insert(uid);
            }
            Err(e) => {
                error!(pod_uid = %uid, error = %e, "failed to hand update to pod worker");
            }
        }
    }

    /// Tears down lanes of pods that are no longer desired. An in-flight sync finishes;
    /// its pending follow-up is dropped.
    pub fn forget_non_existing_pod_workers(&self, desired: &HashSet<String>) {
        let mut state = self.inner.state();
        state.lanes.retain(|uid, _| desired.contains(uid));
        state.last_undelivered.retain(|uid, _| desired.contains(uid));
    }

    pub fn is_working(&self, uid: &str) -> bool {
        self.inner.state().working.contains(uid)
    }

    pub fn lane_count(&self) -> usize {
        self.inner.state().lanes.len()
    }

    /// Waits until no lane has work in flight or queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state().working.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
