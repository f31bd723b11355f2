//! The node agent core: per-pod reconciliation, the top-level reconciler and the
//! operations exposed to the surrounding API layer.

mod admission;
mod environment;
mod node_status;
mod pods;
mod status;
mod streaming;
mod sync;
#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Instant;

use api_types::Pod;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

pub use self::status::get_phase;
pub use self::status::validate_container_status;
pub use self::status::validate_pod_phase;
use crate::config::KubeletConfig;
use crate::container::list_pods;
use crate::dirs::KubeletDirs;
use crate::error::Result;
use crate::lifecycle::HandlerRunner;
use crate::pod_manager::PodManager;
use crate::pod_workers::PodSyncer;
use crate::pod_workers::PodWorkers;
use crate::prober::Prober;
use crate::prober::ReadinessManager;
use crate::runtime::CommandRunner;
use crate::runtime::ContainerRuntime;
use crate::source::PodConfig;
use crate::source::PodUpdate;
use crate::stats::StatsProvider;
use crate::status_manager::StatusManager;
use crate::upstream::MirrorClient;
use crate::upstream::NodeClient;
use crate::upstream::PodStatusClient;
use crate::upstream::ServiceLister;
use crate::volume::VolumeManager;
use crate::volume::VolumeMounter;

/// Reports whether every configuration source has delivered its first snapshot.
pub type SourcesReady = Arc<dyn Fn() -> bool + Send + Sync>;

/// Collaborators the kubelet is built from.
pub struct Dependencies {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub command_runner: Arc<dyn CommandRunner>,
    pub handler_runner: Arc<dyn HandlerRunner>,
    pub prober: Arc<dyn Prober>,
    pub volume_mounter: Arc<dyn VolumeMounter>,
    pub stats: Arc<dyn StatsProvider>,
    pub node_client: Arc<dyn NodeClient>,
    pub status_client: Arc<dyn PodStatusClient>,
    pub mirror_client: Arc<dyn MirrorClient>,
    pub sources_ready: SourcesReady,
    /// Source of service environment variables; `None` without a control plane.
    pub service_lister: Option<Arc<dyn ServiceLister>>,
}

pub struct Kubelet {
    config: KubeletConfig,
    dirs: KubeletDirs,
    runtime: Arc<dyn ContainerRuntime>,
    command_runner: Arc<dyn CommandRunner>,
    handler_runner: Arc<dyn HandlerRunner>,
    prober: Arc<dyn Prober>,
    volume_mounter: Arc<dyn VolumeMounter>,
    stats: Arc<dyn StatsProvider>,
    node_client: Arc<dyn NodeClient>,
    sources_ready: SourcesReady,
    service_lister: Option<Arc<dyn ServiceLister>>,
    pod_manager: PodManager,
    status_manager: Arc<StatusManager>,
    readiness: ReadinessManager,
    volumes: VolumeManager,
    /// Last create failure per (pod UID, container name), reported as the waiting reason.
    failure_reasons: DashMap<(String, String), String>,
    pod_workers: PodWorkers,
}

impl Kubelet {
    pub fn new(config: KubeletConfig, deps: Dependencies) -> Arc<Self> {
        let status_manager = Arc::new(StatusManager::new(
            deps.status_client,
            config.status_update_retry,
            config.retry_delay,
        ));

        Arc::new_cyclic(|kubelet: &Weak<Kubelet>| {
            let syncer: Weak<dyn PodSyncer> = kubelet.clone();
            Self {
                runtime: deps.runtime,
                command_runner: deps.command_runner,
                handler_runner: deps.handler_runner,
                prober: deps.prober,
                volume_mounter: deps.volume_mounter,
                stats: deps.stats,
                node_client: deps.node_client,
                sources_ready: deps.sources_ready,
                service_lister: deps.service_lister,
                pod_manager: PodManager::new(deps.mirror_client),
                status_manager,
                readiness: ReadinessManager::new(),
                volumes: VolumeManager::new(),
                failure_reasons: DashMap::new(),
                pod_workers: PodWorkers::new(syncer),
                dirs: KubeletDirs::new(&config.root_dir),
                config,
            }
        })
    }

    pub fn config(&self) -> &KubeletConfig {
        &self.config
    }

    pub fn dirs(&self) -> &KubeletDirs {
        &self.dirs
    }

    pub fn pod_manager(&self) -> &PodManager {
        &self.pod_manager
    }

    pub fn status_manager(&self) -> &Arc<StatusManager> {
        &self.status_manager
    }

    pub fn pod_workers(&self) -> &PodWorkers {
        &self.pod_workers
    }

    pub fn readiness(&self) -> &ReadinessManager {
        &self.readiness
    }

    pub fn volumes(&self) -> &VolumeManager {
        &self.volumes
    }

    /// Runs the reconciler on every tick and on every source update until cancelled.
    #[tracing::instrument(skip_all)]
    pub async fn run(
        self: Arc<Self>,
        pod_config: Arc<PodConfig>,
        mut updates: mpsc::Receiver<PodUpdate>,
        token: CancellationToken,
    ) {
        info!(node = %self.config.node_name, "starting sync loop");
        let mut ticker = tokio::time::interval(self.config.sync_frequency);
        let mut sources_open = true;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                update = updates.recv(), if sources_open => match update {
                    Some(update) => self.pod_manager.set_pods(pod_config.apply(update)),
                    None => {
                        warn!("all pod sources closed, continuing with periodic syncs");
                        sources_open = false;
                        continue;
                    }
                },
                _ = ticker.tick() => {}
            }

            let (pods, mirror_pods) = self.pod_manager.get_pods_and_mirror_map();
            if let Err(e) = self
                .sync_pods(pods, &HashSet::new(), &mirror_pods, Instant::now())
                .await
            {
                error!(error = %e, "couldn't sync pods");
            }
        }
        info!("sync loop stopped");
    }
}

#[async_trait]
impl PodSyncer for Kubelet {
    async fn sync_pod(&self, pod: &Pod, mirror_pod: Option<&Pod>) -> Result<()> {
        let runtime_pod = list_pods(&*self.runtime, true)
            .await?
            .into_iter()
            .find(|p| p.uid == pod.uid())
            .unwrap_or_default();
        self.reconcile_pod(pod, mirror_pod, &runtime_pod).await
    }
}
