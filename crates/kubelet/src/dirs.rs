//! On-disk layout under the kubelet root directory.
//!
//! ```text
//! <root>/pods/<uid>/volumes/<plugin>/<name>
//! <root>/pods/<uid>/plugins/<name>
//! <root>/pods/<uid>/containers/<container>
//! <root>/plugins/<name>
//! ```
//!
//! Pod and container directories created by older releases (`<root>/<uid>` and
//! `<pod dir>/<container>`) are still honored while the new location does not exist.

use std::io;
use std::path::Path;
use std::path::PathBuf;

use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeletDirs {
    root: PathBuf,
}

impl KubeletDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    pub fn pods_dir(&self) -> PathBuf {
        self.root.join("pods")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    pub fn plugin_dir(&self, plugin: &str) -> PathBuf {
        self.plugins_dir().join(plugin)
    }

    pub fn pod_dir(&self, pod_uid: &str) -> PathBuf {
        let new_path = self.pods_dir().join(pod_uid);
        let old_path = self.root.join(pod_uid);
        prefer_existing_legacy(new_path, old_path)
    }

    pub fn pod_volumes_dir(&self, pod_uid: &str) -> PathBuf {
        self.pod_dir(pod_uid).join("volumes")
    }

    pub fn pod_volume_dir(&self, pod_uid: &str, plugin: &str, volume: &str) -> PathBuf {
        self.pod_volumes_dir(pod_uid).join(plugin).join(volume)
    }

    pub fn pod_plugins_dir(&self, pod_uid: &str) -> PathBuf {
        self.pod_dir(pod_uid).join("plugins")
    }

    pub fn pod_plugin_dir(&self, pod_uid: &str, plugin: &str) -> PathBuf {
        self.pod_plugins_dir(pod_uid).join(plugin)
    }

    pub fn pod_container_dir(&self, pod_uid: &str, container: &str) -> PathBuf {
        let pod_dir = self.pod_dir(pod_uid);
        let new_path = pod_dir.join("containers").join(container);
        let old_path = pod_dir.join(container);
        prefer_existing_legacy(new_path, old_path)
    }

    /// Creates the root, pods and plugins directories.
    pub async fn setup(&self) -> io::Result<()> {
        for dir in [self.root.clone(), self.pods_dir(), self.plugins_dir()] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        info!(root = %self.root.display(), "kubelet data directories ready");
        Ok(())
    }

    /// Creates the pod, volumes and plugins directories of a pod.
    pub async fn make_pod_dirs(&self, pod_uid: &str) -> io::Result<()> {
        for dir in [
            self.pod_dir(pod_uid),
            self.pod_volumes_dir(pod_uid),
            self.pod_plugins_dir(pod_uid),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }
}

/// `old_path` only wins when it exists and `new_path` does not.
fn prefer_existing_legacy(new_path: PathBuf, old_path: PathBuf) -> PathBuf {
    if !new_path.exists() && old_path.exists() {
        old_path
    } else {
        new_path
    }
}
