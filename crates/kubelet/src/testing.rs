//! Fakes and builders shared by unit tests.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use api_types::Container;
use api_types::ContainerState;
use api_types::ContainerStateRunning;
use api_types::ContainerStateTerminated;
use api_types::Handler;
use api_types::Node;
use api_types::ObjectMeta;
use api_types::Pod;
use api_types::PodStatus;
use api_types::Service;
use api_types::ServiceList;
use api_types::API_SOURCE;
use api_types::CONFIG_MIRROR_ANNOTATION_KEY;
use api_types::CONFIG_SOURCE_ANNOTATION_KEY;
use api_types::FILE_SOURCE;
use async_trait::async_trait;
use chrono::Utc;
use error_stack::Report;
use tempfile::TempDir;

use crate::config::KubeletConfig;
use crate::container::hash_pod_spec;
use crate::container::ContainerId;
use crate::container::ContainerName;
use crate::kubelet::Dependencies;
use crate::kubelet::Kubelet;
use crate::lifecycle::HandlerRunner;
use crate::lifecycle::HookError;
use crate::prober::ProbeResult;
use crate::prober::Prober;
use crate::runtime::memory::InMemoryRuntime;
use crate::stats::ContainerInfo;
use crate::stats::ContainerInfoRequest;
use crate::stats::MachineInfo;
use crate::stats::StatsError;
use crate::stats::StatsProvider;
use crate::stats::VersionInfo;
use crate::upstream::MirrorClient;
use crate::upstream::NodeClient;
use crate::upstream::PodStatusClient;
use crate::upstream::ServiceLister;
use crate::upstream::UpstreamError;
use crate::upstream::UpstreamResult;
use crate::volume::MountedVolume;
use crate::volume::VolumeError;
use crate::volume::VolumeMap;
use crate::volume::VolumeMounter;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct FakePodStatusClient {
    pushed: Mutex<Vec<String>>,
    fail_next: AtomicUsize,
    attempts: AtomicUsize,
}

impl FakePodStatusClient {
    pub fn pushed(&self) -> Vec<String> {
        lock(&self.pushed).clone()
    }

    /// Fails the next `n` pushes.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PodStatusClient for FakePodStatusClient {
    async fn update_pod_status(&self, pod: &Pod, _status: &PodStatus) -> UpstreamResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Report::new(UpstreamError::Request {
                url: "fake://status".to_string(),
            }));
        }
        lock(&self.pushed).push(pod.full_name());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeServiceLister {
    services: Mutex<Vec<Service>>,
    failing: AtomicBool,
}

impl FakeServiceLister {
    pub fn set(&self, services: Vec<Service>) {
        *lock(&self.services) = services;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServiceLister for FakeServiceLister {
    async fn list_services(&self) -> UpstreamResult<ServiceList> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Report::new(UpstreamError::Request {
                url: "fake://services".to_string(),
            }));
        }
        Ok(ServiceList {
            items: lock(&self.services).clone(),
        })
    }
}

#[derive(Default)]
pub struct FakeMirrorClient {
    created: Mutex<Vec<Pod>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeMirrorClient {
    pub fn created(&self) -> Vec<Pod> {
        lock(&self.created).clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }
}

#[async_trait]
impl MirrorClient for FakeMirrorClient {
    async fn create_mirror_pod(&self, pod: &Pod) -> UpstreamResult<()> {
        lock(&self.created).push(pod.clone());
        Ok(())
    }

    async fn delete_mirror_pod(&self, pod_full_name: &str) -> UpstreamResult<()> {
        lock(&self.deleted).push(pod_full_name.to_string());
        Ok(())
    }
}

/// Holds a single node named after the test config.
pub struct FakeNodeClient {
    node: Mutex<Option<Node>>,
    gets: AtomicUsize,
    updated: Mutex<Vec<Node>>,
}

impl FakeNodeClient {
    pub fn new(node_name: &str) -> Self {
        Self {
            node: Mutex::new(Some(Node {
                metadata: ObjectMeta {
                    name: node_name.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            })),
            gets: AtomicUsize::new(0),
            updated: Mutex::new(Vec::new()),
        }
    }

    pub fn set_labels(&self, labels: &[(&str, &str)]) {
        if let Some(node) = lock(&self.node).as_mut() {
            node.metadata.labels = labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        }
    }

    /// Removes the node so every lookup fails.
    pub fn clear(&self) {
        *lock(&self.node) = None;
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn updated(&self) -> Vec<Node> {
        lock(&self.updated).clone()
    }
}

#[async_trait]
impl NodeClient for FakeNodeClient {
    async fn get_node(&self, node_name: &str) -> UpstreamResult<Node> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        lock(&self.node).clone().ok_or_else(|| {
            Report::new(UpstreamError::NodeNotFound {
                node_name: node_name.to_string(),
            })
        })
    }

    async fn update_node_status(&self, node: &Node) -> UpstreamResult<()> {
        *lock(&self.node) = Some(node.clone());
        lock(&self.updated).push(node.clone());
        Ok(())
    }
}

/// Every container is live and ready unless marked otherwise by name.
#[derive(Default)]
pub struct FakeProber {
    unhealthy: Mutex<HashSet<String>>,
    not_ready: Mutex<HashSet<String>>,
}

impl FakeProber {
    pub fn mark_unhealthy(&self, container_name: &str) {
        lock(&self.unhealthy).insert(container_name.to_string());
    }

    pub fn mark_not_ready(&self, container_name: &str) {
        lock(&self.not_ready).insert(container_name.to_string());
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe_liveness(
        &self,
        _pod: &Pod,
        container: &Container,
        _container_id: &ContainerId,
    ) -> ProbeResult {
        if lock(&self.unhealthy).contains(&container.name) {
            ProbeResult::Failure
        } else {
            ProbeResult::Success
        }
    }

    async fn probe_readiness(
        &self,
        _pod: &Pod,
        container: &Container,
        _container_id: &ContainerId,
    ) -> ProbeResult {
        if lock(&self.not_ready).contains(&container.name) {
            ProbeResult::Failure
        } else {
            ProbeResult::Success
        }
    }
}

/// Records handler invocations as `(container id, container name)`.
#[derive(Default)]
pub struct FakeHandlerRunner {
    calls: Mutex<Vec<(ContainerId, String)>>,
    failing: AtomicBool,
}

impl FakeHandlerRunner {
    pub fn calls(&self) -> Vec<(ContainerId, String)> {
        lock(&self.calls).clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl HandlerRunner for FakeHandlerRunner {
    async fn run(
        &self,
        container_id: &ContainerId,
        _pod: &Pod,
        container: &Container,
        _handler: &Handler,
    ) -> Result<(), HookError> {
        lock(&self.calls).push((container_id.clone(), container.name.clone()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(HookError::Http {
                url: "http://fake/hook".to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

/// Mounting only records the pod's volumes as present on disk.
#[derive(Default)]
pub struct FakeVolumeMounter {
    mounted: Mutex<Vec<MountedVolume>>,
    torn_down: Mutex<Vec<MountedVolume>>,
}

impl FakeVolumeMounter {
    pub fn add_mounted(&self, pod_uid: &str, name: &str) {
        lock(&self.mounted).push(MountedVolume {
            pod_uid: pod_uid.to_string(),
            name: name.to_string(),
            path: format!("/fake/pods/{pod_uid}/volumes/{name}").into(),
        });
    }

    pub fn torn_down(&self) -> Vec<MountedVolume> {
        lock(&self.torn_down).clone()
    }
}

#[async_trait]
impl VolumeMounter for FakeVolumeMounter {
    async fn mount(&self, pod: &Pod) -> Result<VolumeMap, VolumeError> {
        let mut volumes = VolumeMap::new();
        for volume in &pod.spec.volumes {
            let path = format!("/fake/pods/{}/volumes/{}", pod.uid(), volume.name);
            let mut mounted = lock(&self.mounted);
            if !mounted
                .iter()
                .any(|m| m.pod_uid == pod.uid() && m.name == volume.name)
            {
                mounted.push(MountedVolume {
                    pod_uid: pod.uid().to_string(),
                    name: volume.name.clone(),
                    path: path.clone().into(),
                });
            }
            volumes.insert(volume.name.clone(), path);
        }
        Ok(volumes)
    }

    async fn list_mounted_on_disk(&self) -> Result<Vec<MountedVolume>, VolumeError> {
        Ok(lock(&self.mounted).clone())
    }

    async fn tear_down(&self, volume: &MountedVolume) -> Result<(), VolumeError> {
        lock(&self.mounted).retain(|m| m != volume);
        lock(&self.torn_down).push(volume.clone());
        Ok(())
    }
}

pub struct FakeStatsProvider {
    machine: Mutex<MachineInfo>,
    container_info_fails: AtomicBool,
}

impl Default for FakeStatsProvider {
    fn default() -> Self {
        Self {
            machine: Mutex::new(MachineInfo {
                machine_id: "123".to_string(),
                system_uuid: "abc".to_string(),
                boot_id: "1b3".to_string(),
                ..Default::default()
            }),
            container_info_fails: AtomicBool::new(false),
        }
    }
}

impl FakeStatsProvider {
    pub fn set_machine(&self, num_cores: u32, memory_capacity: u64) {
        let mut machine = lock(&self.machine);
        machine.num_cores = num_cores;
        machine.memory_capacity = memory_capacity;
    }

    pub fn fail_container_info(&self) {
        self.container_info_fails.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatsProvider for FakeStatsProvider {
    async fn machine_info(&self) -> Result<MachineInfo, StatsError> {
        Ok(lock(&self.machine).clone())
    }

    async fn version_info(&self) -> Result<VersionInfo, StatsError> {
        Ok(VersionInfo {
            kernel_version: "3.16.0-0.bpo.4-amd64".to_string(),
            container_os_version: "Debian GNU/Linux 7 (wheezy)".to_string(),
        })
    }

    async fn container_info(
        &self,
        id: &ContainerId,
        _request: &ContainerInfoRequest,
    ) -> Result<ContainerInfo, StatsError> {
        if self.container_info_fails.load(Ordering::SeqCst) {
            return Err(StatsError::Unavailable {
                message: "fake stats are switched off".to_string(),
            });
        }
        Ok(ContainerInfo {
            id: id.to_string(),
            name: String::new(),
            stats: Vec::new(),
        })
    }
}

pub struct TestKubelet {
    pub kubelet: Arc<Kubelet>,
    pub runtime: Arc<InMemoryRuntime>,
    pub status_client: Arc<FakePodStatusClient>,
    pub mirror_client: Arc<FakeMirrorClient>,
    pub node_client: Arc<FakeNodeClient>,
    pub prober: Arc<FakeProber>,
    pub handler_runner: Arc<FakeHandlerRunner>,
    pub volume_mounter: Arc<FakeVolumeMounter>,
    pub stats: Arc<FakeStatsProvider>,
    pub sources_ready: Arc<AtomicBool>,
    pub services: Arc<FakeServiceLister>,
    pub root_dir: TempDir,
}

pub fn new_test_kubelet() -> TestKubelet {
    build_test_kubelet(true, |_| {})
}

/// A test kubelet that runs without a control plane to list services from.
pub fn new_test_kubelet_without_services() -> TestKubelet {
    build_test_kubelet(false, |_| {})
}

/// A test kubelet whose configuration `configure` adjusts; `root_dir` is already set.
pub fn new_test_kubelet_with(configure: impl FnOnce(&mut KubeletConfig)) -> TestKubelet {
    build_test_kubelet(true, configure)
}

fn build_test_kubelet(
    with_services: bool,
    configure: impl FnOnce(&mut KubeletConfig),
) -> TestKubelet {
    let root_dir = tempfile::tempdir().unwrap();
    let mut config = KubeletConfig {
        root_dir: root_dir.path().to_path_buf(),
        retry_delay: Duration::ZERO,
        ..Default::default()
    };
    configure(&mut config);
    let runtime = Arc::new(InMemoryRuntime::new());
    let status_client = Arc::new(FakePodStatusClient::default());
    let mirror_client = Arc::new(FakeMirrorClient::default());
    let node_client = Arc::new(FakeNodeClient::new(&config.node_name));
    let prober = Arc::new(FakeProber::default());
    let handler_runner = Arc::new(FakeHandlerRunner::default());
    let volume_mounter = Arc::new(FakeVolumeMounter::default());
    let stats = Arc::new(FakeStatsProvider::default());
    let sources_ready = Arc::new(AtomicBool::new(true));
    let services = Arc::new(FakeServiceLister::default());

    let ready = sources_ready.clone();
    let kubelet = Kubelet::new(
        config,
        Dependencies {
            runtime: runtime.clone(),
            command_runner: runtime.clone(),
            handler_runner: handler_runner.clone(),
            prober: prober.clone(),
            volume_mounter: volume_mounter.clone(),
            stats: stats.clone(),
            node_client: node_client.clone(),
            status_client: status_client.clone(),
            mirror_client: mirror_client.clone(),
            sources_ready: Arc::new(move || ready.load(Ordering::SeqCst)),
            service_lister: with_services
                .then(|| services.clone() as Arc<dyn ServiceLister>),
        },
    );

    TestKubelet {
        kubelet,
        runtime,
        status_client,
        mirror_client,
        node_client,
        prober,
        handler_runner,
        volume_mounter,
        stats,
        sources_ready,
        services,
        root_dir,
    }
}

pub fn test_pod(uid: &str, name: &str, namespace: &str, containers: &[&str]) -> Pod {
    let mut pod = Pod {
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: uid.to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    pod.spec.containers = containers
        .iter()
        .map(|c| Container {
            name: c.to_string(),
            image: "busybox".to_string(),
            ..Default::default()
        })
        .collect();
    pod
}

/// A pod from the file source.
pub fn static_pod(uid: &str, name: &str, namespace: &str, containers: &[&str]) -> Pod {
    let mut pod = test_pod(uid, name, namespace, containers);
    pod.metadata
        .annotations
        .insert(CONFIG_SOURCE_ANNOTATION_KEY.to_string(), FILE_SOURCE.to_string());
    pod
}

/// An up-to-date mirror of a static pod.
pub fn mirror_pod_of(pod: &Pod) -> Pod {
    let mut mirror = pod.clone();
    mirror.metadata.uid = format!("mirror-{}", pod.uid());
    mirror.metadata.annotations = [
        (CONFIG_SOURCE_ANNOTATION_KEY.to_string(), API_SOURCE.to_string()),
        (CONFIG_MIRROR_ANNOTATION_KEY.to_string(), hash_pod_spec(pod)),
    ]
    .into();
    mirror
}

/// Runtime name of a container of `pod` with an unknown hash, as a listing returns it.
pub fn container_name(pod: &Pod, container_name: &str) -> String {
    container_name_with_hash(pod, container_name, 0)
}

pub fn container_name_with_hash(pod: &Pod, container_name: &str, hash: u64) -> String {
    let name = ContainerName {
        container_name: container_name.to_string(),
        hash,
        pod_name: pod.metadata.name.clone(),
        pod_namespace: pod.metadata.namespace.clone(),
        pod_uid: pod.uid().to_string(),
        suffix: "0".to_string(),
    };
    format!("/{name}")
}

pub fn running() -> ContainerState {
    ContainerState::Running(ContainerStateRunning {
        started_at: Some(Utc::now()),
    })
}

pub fn terminated(exit_code: i32) -> ContainerState {
    ContainerState::Terminated(ContainerStateTerminated {
        exit_code,
        finished_at: Some(Utc::now()),
        ..Default::default()
    })
}
