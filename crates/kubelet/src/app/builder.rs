use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::app::core::Application;
use crate::config::DaemonArgs;
use crate::config::KubeletConfig;
use crate::dirs::KubeletDirs;
use crate::kubelet::Dependencies;
use crate::kubelet::Kubelet;
use crate::lifecycle::HandlerRunner;
use crate::lifecycle::LifecycleHandlerRunner;
use crate::lifecycle::ReqwestHttpGetter;
use crate::prober::HandlerProber;
use crate::runtime::memory::InMemoryRuntime;
use crate::source::FileSource;
use crate::source::PodConfig;
use crate::stats::HostStatsProvider;
use crate::upstream::http::HttpUpstream;
use crate::upstream::standalone::StandaloneUpstream;
use crate::upstream::MirrorClient;
use crate::upstream::NodeClient;
use crate::upstream::PodStatusClient;
use crate::upstream::ServiceLister;
use crate::volume::HostPathVolumeMounter;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const SOURCE_CHANNEL_CAPACITY: usize = 32;

type Upstream = (
    Arc<dyn NodeClient>,
    Arc<dyn PodStatusClient>,
    Arc<dyn MirrorClient>,
    Option<Arc<dyn ServiceLister>>,
);

fn split_upstream<U>(upstream: Arc<U>, service_lister: Option<Arc<dyn ServiceLister>>) -> Upstream
where
    U: NodeClient + PodStatusClient + MirrorClient + 'static,
{
    (upstream.clone(), upstream.clone(), upstream, service_lister)
}

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    fn create_upstream(&self) -> Result<Upstream> {
        match &self.daemon_args.api_server {
            Some(base) => {
                tracing::info!(api_server = %base, "reporting to control plane");
                let upstream = HttpUpstream::new(base, HTTP_TIMEOUT)
                    .map_err(|report| anyhow::anyhow!("{report:?}"))?;
                let upstream = Arc::new(upstream);
                let service_lister: Arc<dyn ServiceLister> = upstream.clone();
                Ok(split_upstream(upstream, Some(service_lister)))
            }
            None => {
                tracing::info!("no control plane configured, running standalone");
                let upstream = StandaloneUpstream::new(&self.daemon_args.node_name);
                Ok(split_upstream(Arc::new(upstream), None))
            }
        }
    }

    /// Build complete application
    pub fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");
        let config = KubeletConfig::from(&self.daemon_args);
        let (node_client, status_client, mirror_client, service_lister) = self.create_upstream()?;

        let runtime = Arc::new(InMemoryRuntime::new());
        let http = Arc::new(ReqwestHttpGetter::new(HTTP_TIMEOUT)?);
        let handler_runner: Arc<dyn HandlerRunner> = Arc::new(LifecycleHandlerRunner::new(
            http,
            runtime.clone(),
            runtime.clone(),
        ));

        let file_source = self.daemon_args.manifest_dir.as_ref().map(|dir| {
            FileSource::new(dir, &config.node_name, config.file_check_frequency)
        });
        let sources: Vec<&str> = file_source
            .as_ref()
            .map(|_| api_types::FILE_SOURCE)
            .into_iter()
            .collect();
        let pod_config = Arc::new(PodConfig::new(sources));

        let kubelet = Kubelet::new(
            config.clone(),
            Dependencies {
                runtime: runtime.clone(),
                command_runner: runtime,
                handler_runner: handler_runner.clone(),
                prober: Arc::new(HandlerProber::new(handler_runner)),
                volume_mounter: Arc::new(HostPathVolumeMounter::new(KubeletDirs::new(
                    &config.root_dir,
                ))),
                stats: Arc::new(HostStatsProvider::default()),
                node_client,
                status_client,
                mirror_client,
                sources_ready: {
                    let pod_config = pod_config.clone();
                    Arc::new(move || pod_config.sources_ready())
                },
                service_lister,
            },
        );

        let (updates_sender, updates_receiver) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        Ok(Application::new(
            kubelet,
            pod_config,
            file_source,
            updates_sender,
            updates_receiver,
        ))
    }
}
