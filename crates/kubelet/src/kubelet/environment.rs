//! What a container sees of its surroundings: environment variables, resolver settings
//! and the termination message file.

use std::collections::BTreeMap;
use std::collections::HashMap;

use api_types::Container;
use api_types::Pod;
use api_types::Service;
use tracing::debug;
use tracing::warn;

use super::Kubelet;
use crate::dns::pod_resolver_config;
use crate::dns::read_resolv_conf;
use crate::dns::ResolverConfig;
use crate::envvars;
use crate::error::KubeletError;
use crate::error::Result;

/// Services every pod sees, taken from the master service namespace unless the pod's own
/// namespace defines them.
const MASTER_SERVICES: [&str; 2] = ["kubernetes", "kubernetes-ro"];

/// Service variables visible from `namespace`: its own services plus the master services.
pub(crate) fn service_env_map(
    services: Vec<Service>,
    namespace: &str,
    master_namespace: &str,
) -> BTreeMap<String, String> {
    let mut visible: HashMap<String, Service> = HashMap::new();
    for service in services.into_iter().filter(Service::has_portal_ip) {
        let name = service.metadata.name.clone();
        if service.metadata.namespace == namespace {
            visible.insert(name, service);
        } else if service.metadata.namespace == master_namespace
            && MASTER_SERVICES.contains(&name.as_str())
        {
            visible.entry(name).or_insert(service);
        }
    }

    let visible: Vec<Service> = visible.into_values().collect();
    envvars::from_services(&visible)
        .into_iter()
        .map(|var| (var.name, var.value))
        .collect()
}

/// `NAME=value` pairs for `container`: its own variables in order, then the service
/// variables it does not override.
pub(crate) fn merge_env(
    container: &Container,
    mut service_env: BTreeMap<String, String>,
) -> Vec<String> {
    let mut result: Vec<String> = container
        .env
        .iter()
        .map(|var| {
            service_env.remove(&var.name);
            format!("{}={}", var.name, var.value)
        })
        .collect();
    result.extend(
        service_env
            .into_iter()
            .map(|(name, value)| format!("{name}={value}")),
    );
    result
}

impl Kubelet {
    /// Environment of `container` in `pod`. Without a service lister only the container's
    /// own variables are set.
    pub(crate) async fn make_environment_variables(
        &self,
        pod: &Pod,
        container: &Container,
    ) -> Result<Vec<String>> {
        let Some(lister) = &self.service_lister else {
            return Ok(merge_env(container, BTreeMap::new()));
        };
        let services = lister
            .list_services()
            .await
            .map_err(|report| KubeletError::ServiceEnvironment {
                pod_full_name: pod.full_name(),
                message: report.current_context().to_string(),
            })?;
        let service_env = service_env_map(
            services.items,
            &pod.metadata.namespace,
            &self.config.master_service_namespace,
        );
        debug!(container = %container.name, services = service_env.len(), "service environment");
        Ok(merge_env(container, service_env))
    }

    /// Resolver settings of `pod`'s sandbox, derived from the host configuration and the
    /// cluster DNS settings.
    pub(crate) async fn cluster_dns(&self, pod: &Pod) -> Result<ResolverConfig> {
        let host = match &self.config.resolver_config {
            Some(path) => {
                read_resolv_conf(path)
                    .await
                    .map_err(|source| KubeletError::ResolverConfig {
                        path: path.clone(),
                        source,
                    })?
            }
            None => ResolverConfig::default(),
        };
        Ok(pod_resolver_config(
            pod,
            host,
            self.config.cluster_dns,
            self.config.cluster_domain.as_deref(),
        ))
    }

    /// Creates the host file backing `container`'s termination message and returns the bind
    /// exposing it at the requested path. Failures only cost the bind.
    pub(crate) async fn termination_log_bind(
        &self,
        pod: &Pod,
        container: &Container,
        runtime_name: &str,
    ) -> Option<String> {
        let target = container.termination_message_path.as_deref()?;
        let dir = self.dirs.pod_container_dir(pod.uid(), &container.name);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(path = %dir.display(), error = %e, "failed to create container directory");
            return None;
        }
        let host_file = dir.join(runtime_name.trim_start_matches('/'));
        if let Err(e) = tokio::fs::File::create(&host_file).await {
            warn!(path = %host_file.display(), error = %e, "failed to create termination log");
            return None;
        }
        Some(format!("{}:{target}", host_file.display()))
    }
}
