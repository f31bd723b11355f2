//! Pod volumes: mounting through a [`VolumeMounter`] and the per-pod mount map.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use api_types::Container;
use api_types::Pod;
use api_types::VolumeSource;
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::warn;

use crate::dirs::KubeletDirs;

const EMPTY_DIR_PLUGIN: &str = "empty-dir";

/// Volume name to host path.
pub type VolumeMap = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A volume found on disk, whether or not its pod still exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    pub pod_uid: String,
    pub name: String,
    pub path: PathBuf,
}

#[async_trait]
pub trait VolumeMounter: Send + Sync {
    async fn mount(&self, pod: &Pod) -> Result<VolumeMap, VolumeError>;

    async fn list_mounted_on_disk(&self) -> Result<Vec<MountedVolume>, VolumeError>;

    async fn tear_down(&self, volume: &MountedVolume) -> Result<(), VolumeError>;
}

/// Mounted volumes per pod UID.
#[derive(Debug, Default)]
pub struct VolumeManager {
    volumes: DashMap<String, VolumeMap>,
}

impl VolumeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_volumes(&self, pod_uid: &str, volumes: VolumeMap) {
        self.volumes.insert(pod_uid.to_string(), volumes);
    }

    pub fn volumes(&self, pod_uid: &str) -> Option<VolumeMap> {
        self.volumes.get(pod_uid).map(|entry| entry.clone())
    }

    pub fn remove_volumes(&self, pod_uid: &str) {
        self.volumes.remove(pod_uid);
    }
}

/// Bind mounts (`host:container[:ro]`) for `container`. Mounts naming an unknown volume
/// are skipped.
pub fn binds_for(container: &Container, volumes: &VolumeMap) -> Vec<String> {
    container
        .volume_mounts
        .iter()
        .filter_map(|mount| {
            let Some(host_path) = volumes.get(&mount.name) else {
                warn!(
                    container = %container.name,
                    volume = %mount.name,
                    "volume mount references an unknown volume"
                );
                return None;
            };
            let mut bind = format!("{host_path}:{}", mount.mount_path);
            if mount.read_only {
                bind.push_str(":ro");
            }
            Some(bind)
        })
        .collect()
}

/// Host-path volumes map straight through; empty-dir volumes are directories under the
/// pod's `volumes/empty-dir/<name>`.
pub struct HostPathVolumeMounter {
    dirs: KubeletDirs,
}

impl HostPathVolumeMounter {
    pub fn new(dirs: KubeletDirs) -> Self {
        Self { dirs }
    }

    fn empty_dir(&self, pod_uid: &str, name: &str) -> PathBuf {
        self.dirs.pod_volume_dir(pod_uid, EMPTY_DIR_PLUGIN, name)
    }
}

async fn read_dir_names(path: &Path) -> Result<Vec<String>, VolumeError> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(VolumeError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut names = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
            Ok(None) => break,
            Err(source) => {
                return Err(VolumeError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
    names.sort();
    Ok(names)
}

#[async_trait]
impl VolumeMounter for HostPathVolumeMounter {
    async fn mount(&self, pod: &Pod) -> Result<VolumeMap, VolumeError> {
        let mut mounted = VolumeMap::new();
        for volume in &pod.spec.volumes {
            let path = match &volume.source {
                VolumeSource::HostPath { path } => PathBuf::from(path),
                VolumeSource::EmptyDir {} => {
                    let path = self.empty_dir(pod.uid(), &volume.name);
                    tokio::fs::create_dir_all(&path)
                        .await
                        .map_err(|source| VolumeError::Io {
                            path: path.clone(),
                            source,
                        })?;
                    path
                }
            };
            mounted.insert(volume.name.clone(), path.to_string_lossy().into_owned());
        }
        Ok(mounted)
    }

    async fn list_mounted_on_disk(&self) -> Result<Vec<MountedVolume>, VolumeError> {
        let mut mounted = Vec::new();
        for pod_uid in read_dir_names(&self.dirs.pods_dir()).await? {
            let base = self.empty_dir(&pod_uid, "");
            for name in read_dir_names(&base).await? {
                mounted.push(MountedVolume {
                    path: base.join(&name),
                    pod_uid: pod_uid.clone(),
                    name,
                });
            }
        }
        Ok(mounted)
    }

    async fn tear_down(&self, volume: &MountedVolume) -> Result<(), VolumeError> {
        match tokio::fs::remove_dir_all(&volume.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(VolumeError::Io {
                path: volume.path.clone(),
                source,
            }),
        }
    }
}
