//! Adapter for CRI runtimes such as containerd.
//!
//! Besides full fetches, the adapter polls the runtime's container list and refreshes only
//! containers whose state changed, since CRI has no event stream the agent can subscribe to.
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{AdapterContext, AdapterKind, Error, Result, RuntimeAdapter};
use crate::alarm::{self, AlarmType};
use crate::container::{ContainerSpec, ContainerState, pod_labels, unix_nanos};
use crate::runtime::v1alpha2::{Container, ContainerState as CriState};
use crate::shutdown::Shutdown;

mod client;
mod info;
mod rootfs;

pub use client::{CriClient, dockershim_present, probe};
pub use info::{ContainerInfo, spec_from_status};
pub use rootfs::RootfsLookup;

const FETCH_ALL_DEADLINE: Duration = Duration::from_secs(60);

/// What the adapter remembers about a container between sync rounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedContainer {
    pub state: CriState,
    pub pid: i64,
    pub name: String,
    /// Running with a live process when last fetched.
    pub running: bool,
}

impl TrackedContainer {
    fn new(state: CriState, spec: &ContainerSpec) -> Self {
        Self {
            state,
            pid: spec.pid,
            name: spec.name.clone(),
            running: spec.state == ContainerState::Running,
        }
    }
}

/// Outcome of comparing a container listing with the tracked containers.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Containers to fetch again.
    pub fetch: Vec<String>,
    /// Listed containers that are still of interest.
    pub listed: HashSet<String>,
}

/// Decides which listed containers need a fetch.
///
/// Only running containers, and exited ones created after the adapter started, are of interest.
/// A tracked container is fetched again when it was running and its state, name or process
/// liveness changed; an untracked one unless it was seen before.
pub fn plan_sync(
    containers: &[Container],
    tracked: &HashMap<String, TrackedContainer>,
    history: &HashSet<String>,
    start_nanos: i64,
    alive: impl Fn(i64) -> bool,
) -> SyncPlan {
    let mut plan = SyncPlan::default();
    for container in containers {
        let state = container.state();
        let of_interest = state == CriState::ContainerRunning
            || (state == CriState::ContainerExited && container.created_at >= start_nanos);
        if !of_interest {
            continue;
        }
        plan.listed.insert(container.id.clone());
        let name = container
            .metadata
            .as_ref()
            .map(|metadata| metadata.name.as_str())
            .unwrap_or_default();
        match tracked.get(&container.id) {
            Some(old) => {
                let running = old.running && alive(old.pid);
                let unchanged = old.state == state && old.name == name && old.running == running;
                if old.state != CriState::ContainerRunning || unchanged {
                    continue;
                }
            }
            None if history.contains(&container.id) => continue,
            None => {}
        }
        plan.fetch.push(container.id.clone());
    }
    plan
}

/// Tracked containers that are no longer listed or have exited.
pub fn stale_containers(
    tracked: &HashMap<String, TrackedContainer>,
    listed: &HashSet<String>,
) -> Vec<String> {
    tracked
        .iter()
        .filter(|(id, info)| !listed.contains(*id) || info.state == CriState::ContainerExited)
        .map(|(id, _)| id.clone())
        .collect()
}

/// Outcome of a full listing.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FetchAllPlan {
    /// Running containers to inspect, in listing order.
    pub inspect: Vec<String>,
    /// Every listed id.
    pub listed: HashSet<String>,
}

/// Picks the containers a full fetch inspects. Exited containers are never inspected.
pub fn plan_fetch_all(containers: &[Container]) -> FetchAllPlan {
    let mut plan = FetchAllPlan::default();
    for container in containers {
        plan.listed.insert(container.id.clone());
        if container.state() == CriState::ContainerRunning {
            plan.inspect.push(container.id.clone());
        }
    }
    plan
}

/// Keeps the registry in sync with a CRI runtime.
pub struct CriAdapter {
    client: CriClient,
    ctx: AdapterContext,
    runtime_name: String,
    tracked: DashMap<String, TrackedContainer>,
    /// Ids seen running; not fetched again by the sync loop.
    history: Mutex<HashSet<String>>,
    rootfs: RootfsLookup,
    /// Isolates full fetches from sync rounds, so neither acts on a stale listing.
    round: tokio::sync::Mutex<()>,
    start_nanos: i64,
}

impl CriAdapter {
    /// Creates the adapter on a probed client.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime does not answer `Version`.
    pub async fn new(client: CriClient, ctx: AdapterContext) -> Result<Self> {
        let version = client.version().await?;
        log::info!(
            "connected to CRI runtime {} {} at `{}`",
            version.runtime_name,
            version.runtime_version,
            client.socket().display()
        );
        let rootfs = RootfsLookup::new(
            ctx.config.containerd_state_dir.clone(),
            ctx.host_paths.clone(),
        );
        Ok(Self {
            client,
            runtime_name: version.runtime_name,
            tracked: DashMap::new(),
            history: Mutex::new(HashSet::new()),
            rootfs,
            round: tokio::sync::Mutex::new(()),
            start_nanos: unix_nanos(SystemTime::now()),
            ctx,
        })
    }

    pub fn runtime_name(&self) -> &str {
        &self.runtime_name
    }

    fn history(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tracked_snapshot(&self) -> HashMap<String, TrackedContainer> {
        self.tracked
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Status of one container, converted into a spec, with its sandbox id and CRI state.
    async fn inspect(&self, id: &str) -> Result<(ContainerSpec, String, CriState)> {
        let response = self.client.container_status(id).await?;
        let Some(status) = response.status else {
            return Err(Error::not_found(id));
        };
        let info = ContainerInfo::from_verbose(&response.info).map_err(|reason| {
            alarm::raise(
                AlarmType::ConnectCriRuntime,
                format_args!("failed to read CRI info of container {id}: {reason}"),
            );
            Error::CriInfo {
                id: id.to_owned(),
                reason,
            }
        })?;
        let spec = spec_from_status(&status, &info, &self.ctx.host_paths);
        Ok((spec, info.sandbox_id, status.state()))
    }

    fn store(&self, spec: ContainerSpec, state: CriState) {
        let id = spec.id.clone();
        let tracked = TrackedContainer::new(state, &spec);
        let root = self.rootfs.find(&id);
        if let Some(detail) = self.ctx.build_detail(spec, None, root) {
            self.ctx.registry.upsert(detail);
        }
        self.history().insert(id.clone());
        self.tracked.insert(id, tracked);
    }

    /// Fetches one container and the labels of its pod sandbox.
    async fn fetch_container(&self, id: &str) -> Result<()> {
        let (mut spec, sandbox_id, state) = self.inspect(id).await?;
        if !sandbox_id.is_empty() {
            match self.client.pod_sandbox_status(&sandbox_id).await {
                Ok(response) => {
                    spec.pod_labels = response.status.map(|status| pod_labels(&status.labels));
                }
                Err(err) => log::debug!("no pod labels for {id} from sandbox {sandbox_id}: {err}"),
            }
        }
        log::debug!("fetched CRI container {id} ({:?})", spec.state);
        self.store(spec, state);
        Ok(())
    }

    fn remove(&self, ids: impl IntoIterator<Item = String>) {
        for id in ids {
            log::debug!("CRI container {id} is gone");
            self.ctx.registry.mark_deleted(&id);
            self.tracked.remove(&id);
        }
    }

    async fn sync(&self) -> Result<()> {
        let _round = self.round.lock().await;
        let containers = self.client.list_containers().await?;
        let history = self.history().clone();
        let plan = plan_sync(
            &containers,
            &self.tracked_snapshot(),
            &history,
            self.start_nanos,
            |pid| self.ctx.host_paths.process_alive(pid),
        );
        for id in &plan.fetch {
            if let Err(err) = self.fetch_container(id).await {
                log::warn!("failed to fetch CRI container {id}: {err}");
            }
        }
        self.remove(stale_containers(&self.tracked_snapshot(), &plan.listed));
        Ok(())
    }
}

#[async_trait]
impl RuntimeAdapter for CriAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Cri
    }

    async fn fetch_all(&self) -> Result<()> {
        let _round = self.round.lock().await;
        let (containers, sandboxes) = tokio::time::timeout(
            FETCH_ALL_DEADLINE,
            futures::future::try_join(
                self.client.list_containers(),
                self.client.list_pod_sandboxes(),
            ),
        )
        .await
        .map_err(|_| Error::Timeout {
            method: "ListContainers",
        })??;
        let sandbox_labels: HashMap<String, HashMap<String, String>> = sandboxes
            .into_iter()
            .map(|sandbox| (sandbox.id, sandbox.labels))
            .collect();

        let plan = plan_fetch_all(&containers);
        let sandbox_ids: HashMap<&str, &str> = containers
            .iter()
            .map(|c| (c.id.as_str(), c.pod_sandbox_id.as_str()))
            .collect();
        for id in &plan.inspect {
            let (mut spec, _, state) = match self.inspect(id).await {
                Ok(inspected) => inspected,
                Err(err) => {
                    log::warn!("failed to inspect CRI container {id}: {err}");
                    continue;
                }
            };
            if spec.state != ContainerState::Running {
                continue;
            }
            let sandbox = sandbox_ids.get(id.as_str()).copied().unwrap_or_default();
            if let Some(labels) = sandbox_labels.get(sandbox) {
                spec.pod_labels = Some(pod_labels(labels));
            }
            self.store(spec, state);
        }
        log::debug!("CRI fetch all listed {} containers", containers.len());

        let running: HashSet<&String> = plan.inspect.iter().collect();
        let gone: Vec<String> = self
            .tracked
            .iter()
            .filter(|entry| !running.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        self.remove(gone);
        self.history().retain(|id| plan.listed.contains(id));
        Ok(())
    }

    async fn fetch_one(&self, id: &str) -> Result<()> {
        self.fetch_container(id).await
    }

    fn sweep_cache(&self) {
        let registry = &self.ctx.registry;
        let dropped = self.rootfs.retain(|id| registry.contains(id));
        if dropped > 0 {
            log::debug!("dropped {dropped} cached rootfs paths");
        }
    }

    async fn run(&self, mut shutdown: Shutdown) {
        let period = self.ctx.config.cri_sync_interval;
        log::info!("CRI sync loop started, period {period:?}");
        while shutdown.sleep(period).await {
            if let Err(err) = self.sync().await {
                alarm::raise(
                    AlarmType::ConnectCriRuntime,
                    format_args!("CRI sync of containers failed: {err}"),
                );
            }
        }
        log::info!("CRI sync loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::v1alpha2::ContainerMetadata;

    fn listed(id: &str, name: &str, state: CriState, created_at: i64) -> Container {
        Container {
            id: id.to_owned(),
            metadata: Some(ContainerMetadata {
                name: name.to_owned(),
                attempt: 0,
            }),
            state: state as i32,
            created_at,
            ..Default::default()
        }
    }

    fn tracked(state: CriState, pid: i64, name: &str, running: bool) -> TrackedContainer {
        TrackedContainer {
            state,
            pid,
            name: name.to_owned(),
            running,
        }
    }

    #[test]
    fn test_plan_fetch_all_skips_exited() {
        let containers = vec![
            listed("up", "a", CriState::ContainerRunning, 0),
            listed("done", "b", CriState::ContainerExited, 0),
            listed("created", "c", CriState::ContainerCreated, 0),
        ];
        let plan = plan_fetch_all(&containers);
        assert_eq!(plan.inspect, vec!["up".to_owned()]);
        assert_eq!(
            plan.listed,
            HashSet::from(["up".to_owned(), "done".to_owned(), "created".to_owned()])
        );
    }

    #[test]
    fn test_plan_sync_new_and_history() {
        let containers = vec![
            listed("new", "a", CriState::ContainerRunning, 0),
            listed("seen", "b", CriState::ContainerRunning, 0),
            listed("created", "c", CriState::ContainerCreated, 0),
        ];
        let history = HashSet::from(["seen".to_owned()]);
        let plan = plan_sync(&containers, &HashMap::new(), &history, 100, |_| true);
        assert_eq!(plan.fetch, vec!["new".to_owned()]);
        assert_eq!(
            plan.listed,
            HashSet::from(["new".to_owned(), "seen".to_owned()])
        );
    }

    #[test]
    fn test_plan_sync_exited_before_start_ignored() {
        let containers = vec![
            listed("old", "a", CriState::ContainerExited, 50),
            listed("young", "b", CriState::ContainerExited, 150),
        ];
        let plan = plan_sync(&containers, &HashMap::new(), &HashSet::new(), 100, |_| true);
        assert_eq!(plan.fetch, vec!["young".to_owned()]);
        assert!(!plan.listed.contains("old"));
    }

    #[test]
    fn test_plan_sync_changes_of_tracked() {
        let containers = vec![
            listed("same", "a", CriState::ContainerRunning, 0),
            listed("renamed", "new-name", CriState::ContainerRunning, 0),
            listed("died", "c", CriState::ContainerRunning, 0),
            listed("stopped", "d", CriState::ContainerExited, 200),
        ];
        let tracked = HashMap::from([
            ("same".to_owned(), tracked(CriState::ContainerRunning, 1, "a", true)),
            ("renamed".to_owned(), tracked(CriState::ContainerRunning, 2, "old-name", true)),
            ("died".to_owned(), tracked(CriState::ContainerRunning, 3, "c", true)),
            ("stopped".to_owned(), tracked(CriState::ContainerRunning, 4, "d", true)),
        ]);
        let plan = plan_sync(&containers, &tracked, &HashSet::new(), 100, |pid| pid != 3);
        let mut fetch = plan.fetch.clone();
        fetch.sort();
        assert_eq!(fetch, vec!["died", "renamed", "stopped"]);
    }

    #[test]
    fn test_plan_sync_skips_tracked_not_running() {
        let containers = vec![listed("x", "a", CriState::ContainerRunning, 0)];
        let tracked = HashMap::from([(
            "x".to_owned(),
            tracked(CriState::ContainerExited, 1, "a", false),
        )]);
        let plan = plan_sync(&containers, &tracked, &HashSet::new(), 0, |_| true);
        assert!(plan.fetch.is_empty());
    }

    #[test]
    fn test_stale_containers() {
        let tracked = HashMap::from([
            ("live".to_owned(), tracked(CriState::ContainerRunning, 1, "a", true)),
            ("gone".to_owned(), tracked(CriState::ContainerRunning, 2, "b", true)),
            ("exited".to_owned(), tracked(CriState::ContainerExited, 3, "c", false)),
        ]);
        let listed = HashSet::from(["live".to_owned(), "exited".to_owned()]);
        let mut stale = stale_containers(&tracked, &listed);
        stale.sort();
        assert_eq!(stale, vec!["exited", "gone"]);
    }
}
