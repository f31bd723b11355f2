//! Per-pod reconciliation: drive the runtime containers of one pod toward its spec.

use std::collections::HashSet;

use api_types::Container;
use api_types::ContainerState;
use api_types::Pod;
use api_types::PullPolicy;
use api_types::RestartPolicy;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::Kubelet;
use crate::container::hash_container;
use crate::container::pod_infra_container;
use crate::container::ContainerId;
use crate::container::ContainerName;
use crate::container::RuntimeContainer;
use crate::container::RuntimePod;
use crate::error::KubeletError;
use crate::error::Result;
use crate::pod_manager::PodManager;
use crate::prober::ProbeResult;
use crate::runtime::CreateContainerRequest;
use crate::runtime::NetworkMode;
use crate::runtime::RuntimeError;
use crate::volume::binds_for;
use crate::volume::VolumeMap;

/// What one pass has to do to a pod.
#[derive(Debug, Default)]
struct PodContainerChanges<'a> {
    /// The sandbox is missing or stale and everything has to be recreated.
    start_infra: bool,
    /// Running sandbox to join when `start_infra` is false.
    infra_id: Option<ContainerId>,
    to_start: Vec<&'a Container>,
    /// Running containers to stop, with their spec when they still have one.
    to_kill: Vec<(&'a RuntimeContainer, Option<&'a Container>)>,
}

/// Whether a container with no running instance should be (re)started.
fn should_restart(
    pod: &Pod,
    container: &Container,
    runtime_pod: &RuntimePod,
    previous: Option<&ContainerState>,
) -> bool {
    let latest = runtime_pod
        .instances(&container.name)
        .first()
        .map(|c| c.state.clone())
        .or_else(|| previous.cloned());

    match latest {
        Some(ContainerState::Terminated(terminated)) => match pod.spec.restart_policy {
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => terminated.exit_code != 0,
            RestartPolicy::Never => false,
        },
        _ => true,
    }
}

impl Kubelet {
    /// Brings the runtime containers of `pod` in line with its spec and records the
    /// resulting status. Errors from individual containers are collected; the pass keeps
    /// going and reports them together.
    #[tracing::instrument(skip_all, fields(pod = %pod.full_name()))]
    pub(crate) async fn reconcile_pod(
        &self,
        pod: &Pod,
        mirror_pod: Option<&Pod>,
        runtime_pod: &RuntimePod,
    ) -> Result<()> {
        let pod_full_name = pod.full_name();
        let uid = pod.uid();

        if pod.spec.host_network && !self.config.host_network_allowed(pod.source()) {
            return Err(KubeletError::HostNetworkNotAllowed {
                pod_full_name,
                source_name: pod.source().map(str::to_string),
            });
        }

        if pod.is_static() {
            self.reconcile_mirror_pod(pod, mirror_pod).await;
        }

        self.dirs
            .make_pod_dirs(uid)
            .await
            .map_err(|source| KubeletError::PodDataDirs {
                pod_full_name: pod_full_name.clone(),
                source,
            })?;

        let volumes = self
            .volume_mounter
            .mount(pod)
            .await
            .map_err(|e| KubeletError::VolumeMount {
                pod_full_name: pod_full_name.clone(),
                message: e.to_string(),
            })?;
        self.volumes.set_volumes(uid, volumes.clone());

        let changes = self.compute_pod_changes(pod, runtime_pod).await;
        debug!(
            start_infra = changes.start_infra,
            to_start = changes.to_start.len(),
            to_kill = changes.to_kill.len(),
            "computed pod changes"
        );

        let mut errors = Vec::new();
        for (container, spec) in &changes.to_kill {
            if let Err(e) = self.kill_container(container, *spec, Some(pod)).await {
                errors.push(e);
            }
        }

        let infra_id = if changes.start_infra {
            match self.start_infra_container(pod).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(error = %e, "failed to create pod infra container");
                    errors.push(e);
                    None
                }
            }
        } else {
            changes.infra_id.clone()
        };

        // Containers without a sandbox would have nothing to join.
        if let Some(infra_id) = &infra_id {
            for container in &changes.to_start {
                if let Err(e) = self
                    .start_container(pod, container, infra_id, &volumes)
                    .await
                {
                    warn!(container = %container.name, error = %e, "failed to start container");
                    errors.push(e);
                }
            }
        }

        match self.generate_pod_status(pod).await {
            Ok(status) => {
                self.status_manager.set_pod_status(pod, status);
            }
            Err(e) => errors.push(e),
        }

        KubeletError::aggregate(errors)
    }

    async fn compute_pod_changes<'a>(
        &self,
        pod: &'a Pod,
        runtime_pod: &'a RuntimePod,
    ) -> PodContainerChanges<'a> {
        let infra_hash = hash_container(&pod_infra_container(
            pod,
            &self.config.pod_infra_container_image,
        ));
        let infra = runtime_pod.infra_container();
        let mut changes = PodContainerChanges {
            start_infra: match infra {
                None => true,
                Some(c) if c.name.hash != 0 && c.name.hash != infra_hash => {
                    info!(container_id = %c.id, "pod infra container changed, restarting pod");
                    true
                }
                Some(_) => false,
            },
            ..Default::default()
        };

        let previous = self.status_manager.cached_status(&pod.full_name());
        let mut keep: HashSet<&ContainerId> = HashSet::new();

        for container in &pod.spec.containers {
            let expected_hash = hash_container(container);
            // Duplicates: the most recently started instance wins.
            let authoritative = runtime_pod
                .instances(&container.name)
                .into_iter()
                .filter(|c| c.is_running())
                .max_by(|a, b| {
                    (a.started_at(), a.created_at, &a.id).cmp(&(b.started_at(), b.created_at, &b.id))
                });

            let Some(running) = authoritative else {
                let previous_state = previous
                    .as_ref()
                    .and_then(|s| s.container_status(&container.name))
                    .map(|s| &s.state);
                if should_restart(pod, container, runtime_pod, previous_state) {
                    changes.to_start.push(container);
                }
                continue;
            };

            if changes.start_infra {
                changes.to_start.push(container);
                continue;
            }

            if running.name.hash != 0 && running.name.hash != expected_hash {
                info!(
                    container = %container.name,
                    found = running.name.hash,
                    expected = expected_hash,
                    "container hash changed, restarting"
                );
                changes.to_start.push(container);
                continue;
            }

            if self.prober.probe_liveness(pod, container, &running.id).await == ProbeResult::Failure
            {
                info!(container = %container.name, "container is unhealthy, restarting");
                changes.to_start.push(container);
                continue;
            }

            let ready = self.prober.probe_readiness(pod, container, &running.id).await
                == ProbeResult::Success;
            self.readiness.set_readiness(&running.id, ready);
            keep.insert(&running.id);
        }

        if !changes.start_infra {
            if let Some(infra) = infra {
                if keep.is_empty() && changes.to_start.is_empty() {
                    info!("no containers left to run, stopping pod infra container");
                } else {
                    keep.insert(&infra.id);
                    changes.infra_id = Some(infra.id.clone());
                }
            }
        } else if changes.to_start.is_empty() {
            changes.start_infra = false;
        }

        changes.to_kill = runtime_pod
            .containers
            .iter()
            .filter(|c| c.is_running() && !keep.contains(&c.id))
            .map(|c| {
                let spec = pod
                    .spec
                    .containers
                    .iter()
                    .find(|s| s.name == c.name.container_name);
                (c, spec)
            })
            .collect();

        changes
    }

    /// Runs the pre-stop hook when there is one, then stops the container. A container
    /// that is already gone counts as stopped.
    pub(crate) async fn kill_container(
        &self,
        container: &RuntimeContainer,
        spec: Option<&Container>,
        pod: Option<&Pod>,
    ) -> Result<()> {
        if let (Some(spec), Some(pod)) = (spec, pod) {
            if let Some(pre_stop) = spec.lifecycle.as_ref().and_then(|l| l.pre_stop.as_ref()) {
                if let Err(e) = self
                    .handler_runner
                    .run(&container.id, pod, spec, pre_stop)
                    .await
                {
                    warn!(container_id = %container.id, error = %e, "pre-stop hook failed");
                }
            }
        }

        info!(
            container_id = %container.id,
            container = %container.name.container_name,
            "killing container"
        );
        self.readiness.remove_readiness(&container.id);
        match self.runtime.kill(&container.id).await {
            Ok(()) | Err(RuntimeError::NotFound { .. }) => Ok(()),
            Err(source) => Err(KubeletError::Container {
                container_name: container.name.container_name.clone(),
                source,
            }),
        }
    }

    async fn start_infra_container(&self, pod: &Pod) -> Result<ContainerId> {
        let infra = pod_infra_container(pod, &self.config.pod_infra_container_image);
        self.pull_image(&infra.image, PullPolicy::IfNotPresent)
            .await?;

        let name = ContainerName::for_pod(pod, &infra.name, hash_container(&infra));
        let mut request = CreateContainerRequest {
            name: name.to_string(),
            image: infra.image.clone(),
            ports: infra.ports.clone(),
            network_mode: NetworkMode::Host,
            ..Default::default()
        };
        // Containers join the sandbox's network namespace and with it its resolvers.
        if !pod.spec.host_network {
            let resolver = self.cluster_dns(pod).await?;
            request.network_mode = NetworkMode::Default;
            request.dns = resolver.nameservers;
            request.dns_search = resolver.searches;
        }
        let id = self
            .runtime
            .create_and_start(request)
            .await
            .map_err(|source| KubeletError::Container {
                container_name: infra.name.clone(),
                source,
            })?;
        info!(container_id = %id, "created pod infra container");
        Ok(id)
    }

    async fn start_container(
        &self,
        pod: &Pod,
        container: &Container,
        infra_id: &ContainerId,
        volumes: &VolumeMap,
    ) -> Result<ContainerId> {
        let failure_key = (pod.uid().to_string(), container.name.clone());

        if let Err(e) = self
            .pull_image(&container.image, container.image_pull_policy)
            .await
        {
            self.failure_reasons.insert(failure_key, e.to_string());
            return Err(e);
        }

        let env = match self.make_environment_variables(pod, container).await {
            Ok(env) => env,
            Err(e) => {
                self.failure_reasons.insert(failure_key, e.to_string());
                return Err(e);
            }
        };

        let name =
            ContainerName::for_pod(pod, &container.name, hash_container(container)).to_string();
        let mut binds = binds_for(container, volumes);
        binds.extend(self.termination_log_bind(pod, container, &name).await);
        let request = CreateContainerRequest {
            name,
            image: container.image.clone(),
            command: container.command.clone(),
            args: container.args.clone(),
            env,
            working_dir: container.working_dir.clone(),
            ports: container.ports.clone(),
            binds,
            network_mode: if pod.spec.host_network {
                NetworkMode::Host
            } else {
                NetworkMode::Container(infra_id.clone())
            },
            ..Default::default()
        };

        let id = match self.runtime.create_and_start(request).await {
            Ok(id) => id,
            Err(source) => {
                self.failure_reasons
                    .insert(failure_key, source.to_string());
                return Err(KubeletError::Container {
                    container_name: container.name.clone(),
                    source,
                });
            }
        };
        self.failure_reasons.remove(&failure_key);
        self.readiness
            .set_readiness(&id, container.readiness_probe.is_none());
        info!(container_id = %id, container = %container.name, "started container");

        if let Some(post_start) = container.lifecycle.as_ref().and_then(|l| l.post_start.as_ref()) {
            if let Err(source) = self
                .handler_runner
                .run(&id, pod, container, post_start)
                .await
            {
                warn!(container_id = %id, error = %source, "post-start hook failed, killing container");
                self.readiness.remove_readiness(&id);
                if let Err(e) = self.runtime.kill(&id).await {
                    warn!(container_id = %id, error = %e, "failed to kill container after hook failure");
                }
                return Err(KubeletError::PostStartHook {
                    container_name: container.name.clone(),
                    source,
                });
            }
        }

        Ok(id)
    }

    /// Applies the pull policy. `Never` trusts the image to be present and lets the
    /// create call fail otherwise.
    async fn pull_image(&self, image: &str, policy: PullPolicy) -> Result<()> {
        let present = match policy {
            PullPolicy::Never => return Ok(()),
            PullPolicy::Always => false,
            PullPolicy::IfNotPresent => self.runtime.is_image_present(image).await?,
        };
        if present {
            return Ok(());
        }

        info!(image, "pulling image");
        self.runtime
            .pull_image(image)
            .await
            .map_err(|source| KubeletError::ImagePull {
                image: image.to_string(),
                source,
            })
    }

    /// Keeps the upstream mirror of a static pod current. An outdated mirror is deleted
    /// and recreated on a later pass.
    async fn reconcile_mirror_pod(&self, pod: &Pod, mirror_pod: Option<&Pod>) {
        let pod_full_name = pod.full_name();
        match mirror_pod {
            Some(mirror) if !PodManager::is_mirror_pod_of(mirror, pod) => {
                info!("deleting outdated mirror pod");
                if let Err(report) = self.pod_manager.delete_mirror_pod(&pod_full_name).await {
                    warn!(error = ?report, "failed to delete mirror pod");
                }
            }
            Some(_) => {}
            None => {
                info!("creating mirror pod");
                if let Err(report) = self.pod_manager.create_mirror_pod(pod).await {
                    warn!(error = ?report, "failed to create mirror pod");
                }
            }
        }
    }
}
