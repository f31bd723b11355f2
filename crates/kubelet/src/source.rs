//! Pod configuration sources.
//!
//! A source reports full snapshots of the pods it wants on this node. [`PodConfig`] keeps the
//! latest snapshot per source, merges them into the desired set and tracks whether every
//! expected source has reported at least once.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use api_types::Pod;
use api_types::CONFIG_SOURCE_ANNOTATION_KEY;
use api_types::FILE_SOURCE;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid manifest {}: {message}", path.display())]
    Invalid { path: PathBuf, message: String },
}

/// Full snapshot of one source.
#[derive(Debug, Clone, PartialEq)]
pub struct PodUpdate {
    pub source: String,
    pub pods: Vec<Pod>,
}

#[derive(Default)]
struct ConfigState {
    expected: HashSet<String>,
    snapshots: BTreeMap<String, Vec<Pod>>,
}

pub struct PodConfig {
    state: Mutex<ConfigState>,
}

impl PodConfig {
    /// A config waiting for every source in `sources`. With no sources it is ready at once.
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Mutex::new(ConfigState {
                expected: sources.into_iter().map(Into::into).collect(),
                snapshots: BTreeMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ConfigState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the snapshot of `update.source` and returns the merged desired set. When two
    /// sources name the same pod, the first source in name order wins.
    pub fn apply(&self, update: PodUpdate) -> Vec<Pod> {
        let mut state = self.state();
        state.snapshots.insert(update.source, update.pods);

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for (source, pods) in &state.snapshots {
            for pod in pods {
                if seen.insert(pod.full_name()) {
                    merged.push(pod.clone());
                } else {
                    warn!(pod = %pod.full_name(), source = %source, "ignoring duplicate pod");
                }
            }
        }
        merged
    }

    pub fn sources_ready(&self) -> bool {
        let state = self.state();
        state
            .expected
            .iter()
            .all(|source| state.snapshots.contains_key(source))
    }
}

/// Stable UID for a manifest that does not carry one.
fn manifest_uid(path: &Path, node_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(node_name.as_bytes());
    hasher.finalize()[..16]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn is_manifest(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
    let extension = path.extension().and_then(|e| e.to_str());
    !hidden && matches!(extension, Some("yaml" | "yml" | "json"))
}

/// Parses one manifest and fills in what the file source owns.
pub fn load_manifest(path: &Path, contents: &str, node_name: &str) -> Result<Pod, SourceError> {
    let parsed = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str::<Pod>(contents).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str::<Pod>(contents).map_err(|e| e.to_string())
    };
    let mut pod = parsed.map_err(|message| SourceError::Parse {
        path: path.to_path_buf(),
        message,
    })?;

    if pod.metadata.name.is_empty() {
        return Err(SourceError::Invalid {
            path: path.to_path_buf(),
            message: "metadata.name is required".to_string(),
        });
    }
    if pod.metadata.namespace.is_empty() {
        pod.metadata.namespace = DEFAULT_NAMESPACE.to_string();
    }
    if pod.metadata.uid.is_empty() {
        pod.metadata.uid = manifest_uid(path, node_name);
    }
    pod.metadata
        .annotations
        .insert(CONFIG_SOURCE_ANNOTATION_KEY.to_string(), FILE_SOURCE.to_string());
    pod.spec.node_name = Some(node_name.to_string());
    Ok(pod)
}

/// Static pods from manifest files in a directory.
pub struct FileSource {
    dir: PathBuf,
    node_name: String,
    period: Duration,
}

impl FileSource {
    pub fn new(dir: impl Into<PathBuf>, node_name: &str, period: Duration) -> Self {
        Self {
            dir: dir.into(),
            node_name: node_name.to_string(),
            period,
        }
    }

    /// Reads every manifest in the directory. Broken files are skipped; a missing directory
    /// is an empty set.
    pub async fn read_pods(&self) -> Result<Vec<Pod>, SourceError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(dir = %self.dir.display(), "manifest directory does not exist");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(SourceError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| SourceError::Io {
            path: self.dir.clone(),
            source,
        })? {
            let path = entry.path();
            if is_manifest(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut pods = Vec::with_capacity(paths.len());
        for path in paths {
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => contents,
                Err(source) => {
                    let err = SourceError::Io { path, source };
                    warn!(error = %err, "skipping manifest");
                    continue;
                }
            };
            match load_manifest(&path, &contents, &self.node_name) {
                Ok(pod) => pods.push(pod),
                Err(e) => warn!(error = %e, "skipping manifest"),
            }
        }
        Ok(pods)
    }

    /// Re-reads the directory every period and sends a snapshot whenever it changed. The
    /// first successful read is always sent.
    #[tracing::instrument(skip_all, fields(dir = %self.dir.display()))]
    pub async fn run(self, updates: mpsc::Sender<PodUpdate>, token: CancellationToken) {
        info!("starting file source");
        let mut ticker = tokio::time::interval(self.period);
        let mut last: Option<Vec<Pod>> = None;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let pods = match self.read_pods().await {
                Ok(pods) => pods,
                Err(e) => {
                    warn!(error = %e, "failed to read manifests");
                    continue;
                }
            };
            if last.as_ref() == Some(&pods) {
                continue;
            }

            debug!(pods = pods.len(), "manifests changed");
            let update = PodUpdate {
                source: FILE_SOURCE.to_string(),
                pods: pods.clone(),
            };
            if updates.send(update).await.is_err() {
                break;
            }
            last = Some(pods);
        }
        info!("file source stopped");
    }
}
