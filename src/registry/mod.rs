//! The in-memory container inventory shared by the runtime adapters, the discovery loops and the
//! stdout services.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;

use crate::config::DiscoveryConfig;
use crate::container::{ContainerDetail, ContainerID, unix_nanos};
use crate::filter::ContainerFilter;

mod differ;

pub use differ::MatchDelta;

/// Source of wall clock nanoseconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

type ContainerMap = HashMap<ContainerID, Arc<ContainerDetail>>;

/// A record whose update time is this much newer than the last successful full fetch was
/// refreshed by something other than that fetch.
const UPDATED_AFTER_FETCH_ALL_SLACK: i64 = 1_000_000_000;

/// How long records survive without being refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryTimeouts {
    pub container_info_max: Duration,
    pub container_info_deleted: Duration,
    pub fetch_all_success: Duration,
}

impl From<&DiscoveryConfig> for RegistryTimeouts {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            container_info_max: config.container_info_timeout_max,
            container_info_deleted: config.container_info_deleted_timeout,
            fetch_all_success: config.fetch_all_success_timeout,
        }
    }
}

/// Thread safe mapping `id -> record`.
///
/// Readers take a shared lock; adapters and the sweep loop take the exclusive lock. No lock is
/// held while talking to a runtime.
pub struct Registry {
    containers: RwLock<ContainerMap>,
    last_update: AtomicI64,
    last_fetch_all_success: AtomicI64,
    image_cache: DashMap<String, String>,
    timeouts: RegistryTimeouts,
    clock: Clock,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("containers", &self.len())
            .field("last_update", &self.last_update_time())
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(timeouts: RegistryTimeouts) -> Self {
        Self::with_clock(timeouts, Arc::new(|| unix_nanos(SystemTime::now())))
    }

    /// Creates a registry that reads the time from `clock`.
    pub fn with_clock(timeouts: RegistryTimeouts, clock: Clock) -> Self {
        let now = clock();
        Self {
            containers: RwLock::new(HashMap::new()),
            last_update: AtomicI64::new(now),
            last_fetch_all_success: AtomicI64::new(now),
            image_cache: DashMap::new(),
            timeouts,
            clock,
        }
    }

    pub fn now(&self) -> i64 {
        (self.clock)()
    }

    fn read(&self) -> RwLockReadGuard<'_, ContainerMap> {
        self.containers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ContainerMap> {
        self.containers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh_last_update(&self) {
        let now = self.now();
        let _ = self
            .last_update
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev.saturating_add(1)))
            });
    }

    /// Change counter of the inventory; it increases with every mutation.
    pub fn last_update_time(&self) -> i64 {
        self.last_update.load(Ordering::Acquire)
    }

    /// Records that a full fetch of a runtime just succeeded.
    pub fn set_last_fetch_all_success(&self) {
        self.last_fetch_all_success
            .fetch_max(self.now(), Ordering::AcqRel);
    }

    pub fn last_fetch_all_success(&self) -> i64 {
        self.last_fetch_all_success.load(Ordering::Acquire)
    }

    /// Inserts or replaces one record.
    ///
    /// A record of a kubernetes pod first shares pod labels with its siblings. Returns true if the
    /// id was not known before.
    pub fn upsert(&self, detail: ContainerDetail) -> bool {
        let detail = Arc::new(detail);
        let mut containers = self.write();
        if let Some(pod) = detail.k8s.as_ref().and_then(|k8s| k8s.pod_key()) {
            let siblings = containers.values().filter(|other| {
                other.k8s.as_ref().and_then(|k8s| k8s.pod_key()).as_ref() == Some(&pod)
            });
            merge_group(std::iter::once(&detail).chain(siblings));
        }
        log::debug!(
            "update container info, id: {}, name: {}",
            detail.id,
            detail.name
        );
        let is_new = containers
            .insert(detail.id.clone(), detail)
            .is_none();
        drop(containers);
        self.refresh_last_update();
        is_new
    }

    /// Swaps in the result of a full fetch.
    ///
    /// Known records missing from `snapshot` are kept unless they timed out, so a container that
    /// one runtime does not list is not dropped while another still reports it.
    pub fn replace_all(&self, snapshot: Vec<ContainerDetail>) {
        let now = self.now();
        let mut fresh: ContainerMap = snapshot
            .into_iter()
            .map(|detail| (detail.id.clone(), Arc::new(detail)))
            .collect();
        let mut containers = self.write();
        for (id, detail) in containers.drain() {
            if fresh.contains_key(&id) {
                continue;
            }
            if !detail.is_timeout(
                now,
                self.timeouts.container_info_max,
                self.timeouts.container_info_deleted,
            ) {
                fresh.insert(id, detail);
            }
        }
        merge_k8s_info(&fresh);
        *containers = fresh;
        drop(containers);
        self.refresh_last_update();
    }

    /// Flags a record for deletion; it stays visible until a sweep removes it.
    pub fn mark_deleted(&self, id: &str) -> bool {
        let found = match self.read().get(id) {
            Some(detail) => {
                detail.mark_deleted(self.now());
                true
            }
            None => false,
        };
        if found {
            log::debug!("mark container {id} as deleted");
            self.refresh_last_update();
        }
        found
    }

    /// Removes timed out records and returns their ids.
    ///
    /// A timed out record is only removed if the last successful full fetch is itself too old, or
    /// the record was refreshed after that fetch. Otherwise an outage of the runtime API would
    /// drop every container at once.
    pub fn sweep(&self) -> Vec<ContainerID> {
        let now = self.now();
        let last_success = self.last_fetch_all_success();
        let success_timed_out = now.saturating_sub(last_success)
            > i64::try_from(self.timeouts.fetch_all_success.as_nanos()).unwrap_or(i64::MAX);
        let mut removed = Vec::new();
        let mut containers = self.write();
        containers.retain(|id, detail| {
            let eligible = detail.is_timeout(
                now,
                self.timeouts.container_info_max,
                self.timeouts.container_info_deleted,
            ) && (success_timed_out
                || detail.last_update_nanos().saturating_sub(last_success)
                    > UPDATED_AFTER_FETCH_ALL_SLACK);
            if eligible {
                log::debug!("delete container {id}");
                removed.push(id.clone());
            }
            !eligible
        });
        drop(containers);
        if !removed.is_empty() {
            self.refresh_last_update();
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<ContainerDetail>> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn ids(&self) -> HashSet<ContainerID> {
        self.read().keys().cloned().collect()
    }

    /// Calls `f` for every record under the read lock.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<ContainerDetail>)) {
        for detail in self.read().values() {
            f(detail);
        }
    }

    pub fn find_all(&self, mut predicate: impl FnMut(&ContainerDetail) -> bool) -> Vec<Arc<ContainerDetail>> {
        self.read()
            .values()
            .filter(|detail| predicate(detail))
            .cloned()
            .collect()
    }

    /// Every record `filter` accepts.
    pub fn snapshot_matching(&self, filter: &ContainerFilter) -> HashMap<ContainerID, Arc<ContainerDetail>> {
        self.read()
            .iter()
            .filter(|(_, detail)| filter.matches(detail))
            .map(|(id, detail)| (id.clone(), Arc::clone(detail)))
            .collect()
    }

    /// Cached display name of an image id.
    pub fn image_name(&self, image_id: &str) -> Option<String> {
        self.image_cache.get(image_id).map(|name| name.value().clone())
    }

    pub fn cache_image_name(&self, image_id: impl Into<String>, name: impl Into<String>) {
        self.image_cache.insert(image_id.into(), name.into());
    }

    /// Drops cached image names that no record refers to.
    pub fn sweep_image_cache(&self) -> usize {
        let used: HashSet<String> = self
            .read()
            .values()
            .map(|detail| detail.image_id.clone())
            .collect();
        let before = self.image_cache.len();
        self.image_cache.retain(|image_id, _| used.contains(image_id));
        before - self.image_cache.len()
    }
}

/// Shares pod labels among all containers of each pod.
fn merge_k8s_info(containers: &ContainerMap) {
    let mut pods: HashMap<String, Vec<&Arc<ContainerDetail>>> = HashMap::new();
    for detail in containers.values() {
        if let Some(key) = detail.k8s.as_ref().and_then(|k8s| k8s.pod_key()) {
            pods.entry(key).or_default().push(detail);
        }
    }
    for (pod, group) in pods {
        if group.len() < 2 {
            continue;
        }
        log::trace!("merging pod labels of {} containers in {pod}", group.len());
        merge_group(group.into_iter());
    }
}

/// Folds the group's label sets by taking the largest and writes the result back to every member.
fn merge_group<'a>(group: impl Iterator<Item = &'a Arc<ContainerDetail>> + Clone) {
    let Some(largest) = group
        .clone()
        .map(|detail| detail.k8s_labels())
        .max_by_key(|labels| labels.len())
    else {
        return;
    };
    for detail in group {
        detail.merge_k8s_labels(&largest);
    }
}
