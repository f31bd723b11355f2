use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use utils::version;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node agent
    Daemon(DaemonArgs),
    /// Decode a runtime container name into the pod identity it encodes
    #[command(name = "decode-name")]
    DecodeName(DecodeNameArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this agent manages pods for"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBELET_ROOT_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/var/lib/kubelet",
        help = "Directory for pod volumes and other local state"
    )]
    pub root_dir: PathBuf,

    #[arg(
        long,
        env = "KUBELET_MANIFEST_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory of static pod manifests (*.yaml, *.yml, *.json)"
    )]
    pub manifest_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "KUBELET_API_SERVER",
        help = "Control plane base URL, e.g. http://127.0.0.1:8080. Runs standalone when unset"
    )]
    pub api_server: Option<String>,

    #[arg(
        long,
        default_value = "10",
        help = "Seconds between periodic reconciliation passes"
    )]
    pub sync_frequency: u64,

    #[arg(
        long,
        default_value = "20",
        help = "Seconds between rescans of the manifest directory"
    )]
    pub file_check_frequency: u64,

    #[arg(
        long,
        default_value = "10",
        help = "Seconds between node status updates"
    )]
    pub node_status_update_frequency: u64,

    #[arg(
        long,
        env = "POD_INFRA_CONTAINER_IMAGE",
        default_value = "kubernetes/pause:latest",
        help = "Image of the sandbox container holding each pod's network namespace"
    )]
    pub pod_infra_container_image: String,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "file",
        help = "Pod sources allowed to use the host network, comma separated; '*' allows all"
    )]
    pub host_network_sources: Vec<String>,

    #[arg(
        long,
        default_value = "5",
        help = "Attempts per node status update before giving up until the next tick"
    )]
    pub node_status_update_retry: usize,

    #[arg(
        long,
        default_value = "3",
        help = "Attempts per pod status push before it is requeued"
    )]
    pub status_update_retry: usize,

    #[arg(
        long,
        default_value = "default",
        help = "Namespace whose kubernetes and kubernetes-ro services are exposed to every pod"
    )]
    pub master_service_namespace: String,

    #[arg(
        long,
        help = "Cluster DNS server placed ahead of the host resolvers for ClusterFirst pods"
    )]
    pub cluster_dns: Option<IpAddr>,

    #[arg(
        long,
        help = "Cluster domain; pods search <namespace>.<domain> and <domain> before the host searches"
    )]
    pub cluster_domain: Option<String>,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = "/etc/resolv.conf",
        help = "Resolver configuration providing the host nameservers and searches; empty disables"
    )]
    pub resolver_config: String,

    #[arg(
        long,
        env = "KUBELET_LOG_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily"
    )]
    pub log_path: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct DecodeNameArgs {
    /// Runtime container name, e.g. /k8s_bar.1a2b_foo_default_uid_abcd1234
    pub name: String,
}

/// Library-side configuration of the kubelet.
#[derive(Debug, Clone)]
pub struct KubeletConfig {
    pub node_name: String,
    pub root_dir: PathBuf,
    pub pod_infra_container_image: String,
    pub host_network_sources: Vec<String>,
    pub sync_frequency: Duration,
    pub file_check_frequency: Duration,
    pub node_status_update_frequency: Duration,
    pub node_status_update_retry: usize,
    pub status_update_retry: usize,
    pub retry_delay: Duration,
    pub master_service_namespace: String,
    pub cluster_dns: Option<IpAddr>,
    pub cluster_domain: Option<String>,
    /// Host resolver configuration; `None` means no host nameservers or searches.
    pub resolver_config: Option<PathBuf>,
}

impl Default for KubeletConfig {
    fn default() -> Self {
        Self {
            node_name: "testnode".to_string(),
            root_dir: PathBuf::from("/var/lib/kubelet"),
            pod_infra_container_image: "kubernetes/pause:latest".to_string(),
            host_network_sources: vec![api_types::FILE_SOURCE.to_string()],
            sync_frequency: Duration::from_secs(10),
            file_check_frequency: Duration::from_secs(20),
            node_status_update_frequency: Duration::from_secs(10),
            node_status_update_retry: 5,
            status_update_retry: 3,
            retry_delay: Duration::from_millis(500),
            master_service_namespace: "default".to_string(),
            cluster_dns: None,
            cluster_domain: None,
            resolver_config: None,
        }
    }
}

impl KubeletConfig {
    /// Whether pods from `source` may share the host network namespace.
    pub fn host_network_allowed(&self, source: Option<&str>) -> bool {
        self.host_network_sources
            .iter()
            .any(|allowed| allowed == "*" || Some(allowed.as_str()) == source)
    }
}

impl From<&DaemonArgs> for KubeletConfig {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            node_name: args.node_name.clone(),
            root_dir: args.root_dir.clone(),
            pod_infra_container_image: args.pod_infra_container_image.clone(),
            host_network_sources: args.host_network_sources.clone(),
            sync_frequency: Duration::from_secs(args.sync_frequency),
            file_check_frequency: Duration::from_secs(args.file_check_frequency),
            node_status_update_frequency: Duration::from_secs(args.node_status_update_frequency),
            node_status_update_retry: args.node_status_update_retry,
            status_update_retry: args.status_update_retry,
            master_service_namespace: args.master_service_namespace.clone(),
            cluster_dns: args.cluster_dns,
            cluster_domain: args
                .cluster_domain
                .clone()
                .filter(|domain| !domain.is_empty()),
            resolver_config: Some(args.resolver_config.as_str())
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            ..Default::default()
        }
    }
}
