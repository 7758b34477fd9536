use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use super::{CONTAINER_NAME_TAG, ContainerID, EnvConfig, K8sInfo};
use crate::fsutil::clean_path;

/// Log driver of containers whose stdout is written by containerd in CRI format.
pub const CONTAINERD_LOG_DRIVER: &str = "containerd";

/// Runtime state of a container, as far as log collection cares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Exited,
    #[default]
    Unknown,
}

impl ContainerState {
    /// Maps a runtime status string (`running`, `exited`, `created`, ...) onto a state.
    pub fn from_status(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "exited" | "dead" => Self::Exited,
            _ => Self::Unknown,
        }
    }
}

/// On-disk framing of a container's stdout log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StdoutFraming {
    DockerJson,
    CriText,
}

impl StdoutFraming {
    pub fn for_log_driver(driver: &str) -> Self {
        if driver == CONTAINERD_LOG_DRIVER {
            Self::CriText
        } else {
            Self::DockerJson
        }
    }
}

/// A volume or bind mount of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Mount {
    pub source: String,
    pub destination: String,
    pub driver: String,
}

/// Nanoseconds since the unix epoch of `time`; zero before the epoch.
pub fn unix_nanos(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// One entry of the container registry.
///
/// The observed fields are immutable once built; a re-observation produces a new detail. Only the
/// bookkeeping that the registry and the filter share (update time, delete flag, pod labels and
/// memoized filter results) changes in place.
#[derive(Debug)]
pub struct ContainerDetail {
    pub id: ContainerID,
    pub name: String,
    /// Display name of the image, e.g. `nginx:1.25`.
    pub image: String,
    pub image_id: String,
    pub created: Option<SystemTime>,
    pub state: ContainerState,
    pub pid: i64,
    pub labels: HashMap<String, String>,
    /// `KEY=VALUE` items in runtime order.
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub stdout_log_path: String,
    pub log_driver: String,
    pub stdout_framing: StdoutFraming,
    pub default_root_path: String,
    pub ip: String,
    pub hostname: String,
    pub k8s: Option<K8sInfo>,
    pub tags: BTreeMap<String, String>,
    pub env_config: BTreeMap<String, EnvConfig>,

    pub(super) k8s_labels: RwLock<Arc<HashMap<String, String>>>,
    pub(super) match_cache: Mutex<HashMap<u64, bool>>,
    pub(super) last_update: AtomicI64,
    pub(super) deleted: AtomicBool,
}

impl ContainerDetail {
    /// Labels of the pod this container belongs to, shared among its siblings.
    pub fn k8s_labels(&self) -> Arc<HashMap<String, String>> {
        Arc::clone(&self.k8s_labels.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Adopts `labels` if it is larger than the current pod label set.
    ///
    /// Returns true if the labels were replaced; memoized filter results are dropped in that case.
    pub fn merge_k8s_labels(&self, labels: &Arc<HashMap<String, String>>) -> bool {
        let mut current = self.k8s_labels.write().unwrap_or_else(PoisonError::into_inner);
        if labels.len() <= current.len() || Arc::ptr_eq(labels, &current) {
            return false;
        }
        *current = Arc::clone(labels);
        drop(current);
        self.match_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        true
    }

    /// Returns the memoized filter result for `filter_hash`, evaluating `eval` on a miss.
    pub fn cached_match(&self, filter_hash: u64, eval: impl FnOnce(&Self) -> bool) -> bool {
        if let Some(matched) = self
            .match_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&filter_hash)
        {
            return *matched;
        }
        let matched = eval(self);
        self.match_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(filter_hash, matched);
        matched
    }

    pub fn is_k8s_sandbox(&self) -> bool {
        self.k8s.as_ref().is_some_and(|k8s| k8s.paused)
    }

    /// Wall clock nanoseconds of the last observation or delete mark.
    pub fn last_update_nanos(&self) -> i64 {
        self.last_update.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self, now_nanos: i64) {
        self.last_update.fetch_max(now_nanos, Ordering::AcqRel);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self, now_nanos: i64) {
        self.deleted.store(true, Ordering::Release);
        self.touch(now_nanos);
    }

    /// True if the record was not refreshed for `max`, or was marked deleted and not refreshed
    /// for `deleted_timeout`.
    pub fn is_timeout(&self, now_nanos: i64, max: Duration, deleted_timeout: Duration) -> bool {
        let age = now_nanos.saturating_sub(self.last_update_nanos());
        age > duration_nanos(max) || (self.is_deleted() && age > duration_nanos(deleted_timeout))
    }

    /// Value of the env variable `key`, or an empty string.
    pub fn env_value(&self, key: &str) -> &str {
        self.env
            .iter()
            .filter_map(|item| item.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
            .unwrap_or_default()
    }

    pub fn env_map(&self) -> HashMap<String, String> {
        super::env_config::env_map(&self.env)
    }

    /// Maps a path inside the container onto the mount that serves it.
    ///
    /// Returns `(source, destination)` of the mount whose destination is the longest prefix of
    /// `path` on a separator boundary, or `(default_root_path, "")` if no mount matches.
    pub fn find_best_matched_path(&self, path: &str) -> (String, String) {
        let path = clean_path(path);
        let mut best: Option<&Mount> = None;
        let mut best_len = 0;
        for mount in &self.mounts {
            let dst = clean_path(&mount.destination);
            let is_prefix = path.starts_with(&dst)
                && (path.len() == dst.len()
                    || matches!(path.as_bytes().get(dst.len()), Some(b'/' | b'\\')));
            if is_prefix && dst.len() > best_len {
                best_len = dst.len();
                best = Some(mount);
            }
        }
        match best {
            Some(mount) if !mount.source.is_empty() => {
                (mount.source.clone(), mount.destination.clone())
            }
            _ => (self.default_root_path.clone(), String::new()),
        }
    }

    /// The tags attached to every record read from this container.
    ///
    /// `envs` and `k8s_labels` map env variable names and pod label keys onto tag names; a
    /// configured key the container does not carry yields an empty tag value.
    pub fn external_tags(
        &self,
        envs: &HashMap<String, String>,
        k8s_labels: &HashMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut tags = self.tags.clone();
        for (key, tag) in envs {
            tags.insert(tag.clone(), self.env_value(key).to_owned());
        }
        if self.k8s.is_some() {
            let labels = self.k8s_labels();
            for (key, tag) in k8s_labels {
                tags.insert(tag.clone(), labels.get(key).cloned().unwrap_or_default());
            }
        }
        tags
    }

    pub fn container_name_tag(&self) -> &str {
        self.tags
            .get(CONTAINER_NAME_TAG)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}
