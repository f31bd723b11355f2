use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::app::tasks::Tasks;
use crate::kubelet::Kubelet;
use crate::source::FileSource;
use crate::source::PodConfig;
use crate::source::PodUpdate;

/// The assembled daemon.
pub struct Application {
    kubelet: Arc<Kubelet>,
    pod_config: Arc<PodConfig>,
    /// Taken by the task that runs it.
    file_source: Mutex<Option<FileSource>>,
    updates_sender: mpsc::Sender<PodUpdate>,
    updates_receiver: Mutex<Option<mpsc::Receiver<PodUpdate>>>,
}

impl Application {
    pub fn new(
        kubelet: Arc<Kubelet>,
        pod_config: Arc<PodConfig>,
        file_source: Option<FileSource>,
        updates_sender: mpsc::Sender<PodUpdate>,
        updates_receiver: mpsc::Receiver<PodUpdate>,
    ) -> Self {
        Self {
            kubelet,
            pod_config,
            file_source: Mutex::new(file_source),
            updates_sender,
            updates_receiver: Mutex::new(Some(updates_receiver)),
        }
    }

    pub fn kubelet(&self) -> &Arc<Kubelet> {
        &self.kubelet
    }

    pub fn pod_config(&self) -> &Arc<PodConfig> {
        &self.pod_config
    }

    pub(crate) async fn take_file_source(&self) -> Option<FileSource> {
        self.file_source.lock().await.take()
    }

    pub(crate) async fn take_updates_receiver(&self) -> Option<mpsc::Receiver<PodUpdate>> {
        self.updates_receiver.lock().await.take()
    }

    pub(crate) fn updates_sender(&self) -> mpsc::Sender<PodUpdate> {
        self.updates_sender.clone()
    }

    /// Run application, start all tasks and wait for completion
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");
        let dirs = self.kubelet.dirs();
        dirs.setup().await.with_context(|| {
            format!("failed to set up data directories under {}", dirs.root_dir().display())
        })?;

        let mut tasks = Tasks::new();
        if let Err(e) = tasks.spawn_all_tasks(self).await {
            tracing::error!("Failed to spawn application tasks: {}", e);
            return Err(e);
        }

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {}", e);
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }

    /// Pushes whatever status updates are still queued.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down application...");
        if let Err(report) = self.kubelet.status_manager().flush().await {
            tracing::warn!(error = ?report, "pod statuses left unpushed at shutdown");
        }
        tracing::info!("Application shutdown completed");
        Ok(())
    }
}
