//! Resolver settings handed to pod sandboxes.

use std::io;
use std::net::IpAddr;
use std::path::Path;

use api_types::DnsPolicy;
use api_types::Pod;
use tracing::warn;

/// Nameservers and search domains, in resolver order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverConfig {
    pub nameservers: Vec<String>,
    pub searches: Vec<String>,
}

/// Parses resolv.conf content. Every `nameserver` line adds servers; the last `search`
/// line wins. Comments and unknown keywords are ignored.
pub fn parse_resolv_conf(data: &str) -> ResolverConfig {
    let mut config = ResolverConfig::default();
    for line in data.lines() {
        let line = line.trim_start();
        if line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("nameserver") => config.nameservers.extend(fields.map(str::to_string)),
            Some("search") => config.searches = fields.map(str::to_string).collect(),
            _ => {}
        }
    }
    config
}

/// Reads the host resolver configuration. A missing file reads as empty.
pub async fn read_resolv_conf(path: &Path) -> io::Result<ResolverConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(data) => Ok(parse_resolv_conf(&data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "resolver configuration not found, using no host resolvers");
            Ok(ResolverConfig::default())
        }
        Err(e) => Err(e),
    }
}

/// Resolver settings for `pod`. `ClusterFirst` pods get the cluster server and the
/// namespace-scoped searches ahead of the host's; `Default` pods get the host's only.
pub fn pod_resolver_config(
    pod: &Pod,
    host: ResolverConfig,
    cluster_dns: Option<IpAddr>,
    cluster_domain: Option<&str>,
) -> ResolverConfig {
    if pod.spec.dns_policy != DnsPolicy::ClusterFirst {
        return host;
    }

    let nameservers = match cluster_dns {
        Some(server) => std::iter::once(server.to_string())
            .chain(host.nameservers)
            .collect(),
        None => Vec::new(),
    };
    let searches = match cluster_domain {
        Some(domain) => [format!("{}.{domain}", pod.metadata.namespace), domain.to_string()]
            .into_iter()
            .chain(host.searches)
            .collect(),
        None => Vec::new(),
    };
    ResolverConfig {
        nameservers,
        searches,
    }
}
