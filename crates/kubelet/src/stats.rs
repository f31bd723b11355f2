//! Machine facts and container stats.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use crate::container::ContainerId;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("{message}")]
    Unavailable { message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MachineInfo {
    pub num_cores: u32,
    pub memory_capacity: u64,
    pub machine_id: String,
    pub system_uuid: String,
    pub boot_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub kernel_version: String,
    pub container_os_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfoRequest {
    /// Maximum number of samples to return.
    pub num_stats: usize,
}

impl Default for ContainerInfoRequest {
    fn default() -> Self {
        Self { num_stats: 60 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStats {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage_nanos: u64,
    pub memory_usage_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub stats: Vec<ContainerStats>,
}

#[async_trait]
pub trait StatsProvider: Send + Sync {
    async fn machine_info(&self) -> Result<MachineInfo, StatsError>;

    async fn version_info(&self) -> Result<VersionInfo, StatsError>;

    async fn container_info(
        &self,
        id: &ContainerId,
        request: &ContainerInfoRequest,
    ) -> Result<ContainerInfo, StatsError>;
}

/// Reads machine facts from procfs and sysfs. Container stats are not collected.
pub struct HostStatsProvider {
    root: PathBuf,
}

impl Default for HostStatsProvider {
    fn default() -> Self {
        Self::new("/")
    }
}

impl HostStatsProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read(&self, path: &str) -> String {
        tokio::fs::read_to_string(self.root.join(path))
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kib * 1024)
    })
}

fn parse_pretty_name(os_release: &str) -> Option<String> {
    os_release.lines().find_map(|line| {
        let value = line.strip_prefix("PRETTY_NAME=")?;
        Some(value.trim_matches('"').to_string())
    })
}

#[async_trait]
impl StatsProvider for HostStatsProvider {
    async fn machine_info(&self) -> Result<MachineInfo, StatsError> {
        let memory_capacity = parse_mem_total(&self.read("proc/meminfo").await).ok_or_else(|| {
            StatsError::Unavailable {
                message: "MemTotal missing from /proc/meminfo".to_string(),
            }
        })?;
        let num_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        Ok(MachineInfo {
            num_cores,
            memory_capacity,
            machine_id: self.read("etc/machine-id").await,
            system_uuid: self.read("sys/class/dmi/id/product_uuid").await,
            boot_id: self.read("proc/sys/kernel/random/boot_id").await,
        })
    }

    async fn version_info(&self) -> Result<VersionInfo, StatsError> {
        Ok(VersionInfo {
            kernel_version: self.read("proc/sys/kernel/osrelease").await,
            container_os_version: parse_pretty_name(&self.read("etc/os-release").await)
                .unwrap_or_else(|| "Unknown".to_string()),
        })
    }

    async fn container_info(
        &self,
        _id: &ContainerId,
        _request: &ContainerInfoRequest,
    ) -> Result<ContainerInfo, StatsError> {
        Err(StatsError::Unavailable {
            message: "container stats collection is not configured".to_string(),
        })
    }
}
