use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Start all background tasks
    pub async fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        if let Some(file_source) = app.take_file_source().await {
            let updates = app.updates_sender();
            let token = self.cancellation_token.clone();
            self.tasks.push(tokio::spawn(async move {
                file_source.run(updates, token).await;
            }));
        }

        let updates = app
            .take_updates_receiver()
            .await
            .context("application tasks were already started")?;
        let sync_loop = {
            let kubelet = app.kubelet().clone();
            let pod_config = app.pod_config().clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                kubelet.run(pod_config, updates, token).await;
            })
        };
        self.tasks.push(sync_loop);

        let status_push = {
            let status_manager = app.kubelet().status_manager().clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                status_manager.run(token).await;
            })
        };
        self.tasks.push(status_push);

        let node_status = {
            let kubelet = app.kubelet().clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                kubelet.run_node_status_loop(token).await;
            })
        };
        self.tasks.push(node_status);

        Ok(())
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::signal;
                use tokio::signal::unix::SignalKind;
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                    }
                })
            }
        };

        let cancelled = self.cancellation_token.clone();
        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
            }
            _ = cancelled.cancelled() => {
                tracing::info!("Cancellation requested, stopping all tasks");
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    self.cancellation_token.cancel();
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if task.is_finished() {
                    continue;
                }
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }
}
