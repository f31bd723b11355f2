//! Desired pods and the static/mirror pod association.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;

use api_types::Pod;
use api_types::CONFIG_MIRROR_ANNOTATION_KEY;
use tracing::error;
use tracing::info;

use crate::container::hash_pod_spec;
use crate::upstream::MirrorClient;
use crate::upstream::UpstreamResult;

#[derive(Default)]
struct PodIndex {
    pod_by_uid: HashMap<String, Pod>,
    pod_by_full_name: HashMap<String, Pod>,
    mirror_by_uid: HashMap<String, Pod>,
    mirror_by_full_name: HashMap<String, Pod>,
}

/// Holds the latest desired pod set, split into regular pods and mirror pods.
pub struct PodManager {
    index: RwLock<PodIndex>,
    mirror_client: Arc<dyn MirrorClient>,
}

impl PodManager {
    pub fn new(mirror_client: Arc<dyn MirrorClient>) -> Self {
        Self {
            index: RwLock::new(PodIndex::default()),
            mirror_client,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PodIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the whole set.
    pub fn set_pods(&self, pods: Vec<Pod>) {
        let mut index = PodIndex::default();
        for pod in pods {
            if pod.is_mirror() {
                index.mirror_by_uid.insert(pod.uid().to_string(), pod.clone());
                index.mirror_by_full_name.insert(pod.full_name(), pod);
            } else {
                index.pod_by_uid.insert(pod.uid().to_string(), pod.clone());
                index.pod_by_full_name.insert(pod.full_name(), pod);
            }
        }
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = index;
    }

    /// Regular (non-mirror) pods.
    pub fn get_pods(&self) -> Vec<Pod> {
        self.read().pod_by_uid.values().cloned().collect()
    }

    /// Regular pods plus mirror pods keyed by full name.
    pub fn get_pods_and_mirror_map(&self) -> (Vec<Pod>, HashMap<String, Pod>) {
        let index = self.read();
        (
            index.pod_by_uid.values().cloned().collect(),
            index.mirror_by_full_name.clone(),
        )
    }

    pub fn get_pod_by_full_name(&self, pod_full_name: &str) -> Option<Pod> {
        self.read().pod_by_full_name.get(pod_full_name).cloned()
    }

    pub fn get_pod_by_name(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.get_pod_by_full_name(&format!("{name}_{namespace}"))
    }

    pub fn get_mirror_pod_by_pod(&self, pod: &Pod) -> Option<Pod> {
        self.read().mirror_by_full_name.get(&pod.full_name()).cloned()
    }

    pub fn is_mirror_uid(&self, uid: &str) -> bool {
        self.read().mirror_by_uid.contains_key(uid)
    }

    /// Maps a mirror pod UID to the UID of its static pod. Other UIDs pass through.
    pub fn translate_pod_uid(&self, uid: &str) -> String {
        let index = self.read();
        index
            .mirror_by_uid
            .get(uid)
            .and_then(|mirror| index.pod_by_full_name.get(&mirror.full_name()))
            .map(|pod| pod.uid().to_string())
            .unwrap_or_else(|| uid.to_string())
    }

    /// A mirror is current when it carries the spec hash of the static pod.
    pub fn is_mirror_pod_of(mirror_pod: &Pod, pod: &Pod) -> bool {
        mirror_pod.full_name() == pod.full_name()
            && mirror_pod
                .metadata
                .annotations
                .get(CONFIG_MIRROR_ANNOTATION_KEY)
                .is_some_and(|hash| *hash == hash_pod_spec(pod))
    }

    pub async fn create_mirror_pod(&self, pod: &Pod) -> UpstreamResult<()> {
        let mut mirror = pod.clone();
        mirror.metadata.uid.clear();
        mirror
            .metadata
            .annotations
            .insert(CONFIG_MIRROR_ANNOTATION_KEY.to_string(), hash_pod_spec(pod));
        info!(pod = %pod.full_name(), "creating mirror pod");
        self.mirror_client.create_mirror_pod(&mirror).await
    }

    pub async fn delete_mirror_pod(&self, pod_full_name: &str) -> UpstreamResult<()> {
        info!(pod = %pod_full_name, "deleting mirror pod");
        self.mirror_client.delete_mirror_pod(pod_full_name).await
    }

    /// Deletes mirror pods whose static pod is gone. Failures are logged and retried on
    /// the next pass.
    pub async fn delete_orphaned_mirror_pods(&self) {
        let orphaned: Vec<String> = {
            let index = self.read();
            index
                .mirror_by_full_name
                .keys()
                .filter(|full_name| !index.pod_by_full_name.contains_key(*full_name))
                .cloned()
                .collect()
        };
        for full_name in orphaned {
            if let Err(e) = self.delete_mirror_pod(&full_name).await {
                error!(pod = %full_name, error = ?e, "failed to delete orphaned mirror pod");
            }
        }
    }
}
