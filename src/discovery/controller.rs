use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::cri::{self, CriAdapter};
use super::docker::{BollardDocker, DockerAdapter};
use super::static_file::StaticFileAdapter;
use super::{
    AdapterContext, AdapterKind, ContainerEvent, Error, EventObserver, Result, RuntimeAdapter,
};
use crate::alarm::{self, AlarmType};
use crate::config::DiscoveryConfig;
use crate::container::ContainerDetail;
use crate::environment::HostPaths;
use crate::registry::Registry;
use crate::shutdown::Shutdown;
use crate::task;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const INIT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Counts `fetch_one` calls per wall-clock second.
#[derive(Debug)]
struct FetchOneLimiter {
    max_per_second: u32,
    /// `(second, calls in that second)`
    window: Mutex<(u64, u32)>,
}

impl FetchOneLimiter {
    fn new(max_per_second: u32) -> Self {
        Self {
            max_per_second,
            window: Mutex::new((0, 0)),
        }
    }

    fn try_acquire(&self) -> bool {
        let second = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.try_acquire_at(second)
    }

    fn try_acquire_at(&self, second: u64) -> bool {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if window.0 != second {
            *window = (second, 0);
        }
        window.1 += 1;
        window.1 <= self.max_per_second
    }
}

/// Owns the runtime adapters and the registry they feed.
pub struct Discovery {
    registry: Arc<Registry>,
    config: Arc<DiscoveryConfig>,
    /// Enabled adapters, ordered static, docker, cri.
    adapters: RwLock<Vec<Arc<dyn RuntimeAdapter>>>,
    observer: EventObserver,
    limiter: FetchOneLimiter,
}

impl Discovery {
    /// Creates the adapters the node supports.
    ///
    /// The CRI runtime is probed first; the Docker adapter is created whenever a client can be
    /// configured and left to [`Discovery::init`] to prove itself.
    pub async fn new(
        registry: Arc<Registry>,
        config: Arc<DiscoveryConfig>,
        host_paths: HostPaths,
    ) -> Self {
        let ctx = AdapterContext::new(Arc::clone(&registry), Arc::clone(&config), host_paths);
        let observer = EventObserver::default();
        let mut adapters: Vec<Arc<dyn RuntimeAdapter>> = Vec::new();

        if let Some(path) = &config.static_container_info {
            log::info!("static container info enabled, reading `{}`", path.display());
            adapters.push(Arc::new(StaticFileAdapter::new(path, ctx.clone())));
        }

        let cri = match cri::probe(&config, &ctx.host_paths).await {
            Ok(client) => match CriAdapter::new(client, ctx.clone()).await {
                Ok(adapter) => Some(adapter),
                Err(err) => {
                    alarm::raise(
                        AlarmType::ConnectCriRuntime,
                        format_args!("CRI runtime does not answer: {err}"),
                    );
                    None
                }
            },
            Err(err @ Error::CriUnavailable { .. }) => {
                log::info!("{err}");
                None
            }
            Err(err) => {
                alarm::raise(
                    AlarmType::ConnectCriRuntime,
                    format_args!("failed to connect to CRI runtime: {err}"),
                );
                None
            }
        };

        match BollardDocker::connect(config.request_timeout, config.event_listener_timeout) {
            Ok(api) => adapters.push(Arc::new(DockerAdapter::new(
                Arc::new(api),
                ctx.clone(),
                observer.clone(),
                cri.is_some(),
            ))),
            Err(err) => alarm::raise(
                AlarmType::DockerCenter,
                format_args!("failed to create docker client: {err}"),
            ),
        }
        if let Some(cri) = cri {
            adapters.push(Arc::new(cri));
        }

        Self::with_adapters(registry, config, adapters, observer)
    }

    /// Creates a controller over the given adapters.
    pub fn with_adapters(
        registry: Arc<Registry>,
        config: Arc<DiscoveryConfig>,
        mut adapters: Vec<Arc<dyn RuntimeAdapter>>,
        observer: EventObserver,
    ) -> Self {
        adapters.sort_by_key(|adapter| adapter.kind());
        Self {
            limiter: FetchOneLimiter::new(config.fetch_one_max_per_second),
            registry,
            config,
            adapters: RwLock::new(adapters),
            observer,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn adapter_kinds(&self) -> Vec<AdapterKind> {
        self.adapters().iter().map(|adapter| adapter.kind()).collect()
    }

    fn adapters(&self) -> Vec<Arc<dyn RuntimeAdapter>> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs a first full fetch on every adapter, disabling the ones that keep failing.
    ///
    /// # Errors
    ///
    /// Returns the static file error if the configured file cannot be read, or
    /// [`Error::AllAdaptersDisabled`] if no adapter is left.
    pub async fn init(&self, try_times: usize) -> Result<()> {
        let mut enabled = Vec::new();
        for adapter in self.adapters() {
            let kind = adapter.kind();
            let mut last_err = None;
            for attempt in 1..=try_times.max(1) {
                match adapter.fetch_all().await {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(err) => {
                        log::warn!("{kind} fetch all failed (attempt {attempt}/{try_times}): {err}");
                        last_err = Some(err);
                    }
                }
                if attempt < try_times {
                    tokio::time::sleep(INIT_RETRY_DELAY).await;
                }
            }
            match last_err {
                None => enabled.push(adapter),
                Some(err) if kind == AdapterKind::StaticFile => return Err(err),
                Some(err) => alarm::raise(
                    alarm_for(kind),
                    format_args!("disabling {kind} container discovery: {err}"),
                ),
            }
        }
        if enabled.is_empty() {
            return Err(Error::AllAdaptersDisabled);
        }
        log::info!(
            "container discovery initialized with {:?}, {} containers",
            enabled.iter().map(|a| a.kind()).collect::<Vec<_>>(),
            self.registry.len()
        );
        *self.adapters.write().unwrap_or_else(PoisonError::into_inner) = enabled;
        Ok(())
    }

    /// Full fetch on every adapter; failures are reported, not returned.
    pub async fn fetch_all(&self) {
        for adapter in self.adapters() {
            let kind = adapter.kind();
            let started = Instant::now();
            match adapter.fetch_all().await {
                Ok(()) => log::debug!("{kind} fetch all took {:?}", started.elapsed()),
                Err(err) => alarm::raise(
                    alarm_for(kind),
                    format_args!("{kind} fetch all failed: {err}"),
                ),
            }
        }
    }

    /// Refreshes one container, asking CRI first, then Docker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] if the per second budget is spent, or the error of the
    /// last adapter asked, [`Error::NotFound`] if none knows `id`.
    pub async fn fetch_one(&self, id: &str) -> Result<()> {
        if !self.limiter.try_acquire() {
            return Err(Error::RateLimited {
                id: id.to_owned(),
                max: self.limiter.max_per_second,
            });
        }
        let mut last_err = Error::not_found(id);
        for adapter in self.adapters().iter().rev() {
            match adapter.fetch_one(id).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    log::debug!("{} fetch of {id} failed: {err}", adapter.kind());
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// The record of `id`, fetching it once on a registry miss.
    pub async fn container_meta(&self, id: &str) -> Option<Arc<ContainerDetail>> {
        if let Some(detail) = self.registry.get(id) {
            return Some(detail);
        }
        match self.fetch_one(id).await {
            Ok(()) => self.registry.get(id),
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                log::warn!("no metadata for container {id}: {err}");
                None
            }
        }
    }

    /// Drops adapter caches of containers the registry forgot.
    pub fn clean(&self) {
        for adapter in self.adapters() {
            adapter.sweep_cache();
        }
    }

    pub fn register_event_observer(&self, tx: mpsc::Sender<ContainerEvent>) {
        self.observer.register(tx);
    }

    pub fn unregister_event_observer(&self) {
        self.observer.unregister();
    }

    /// Sweeps timed out containers every 10 s and runs a full fetch every fetch all interval.
    pub async fn timer_fetch(&self, mut shutdown: Shutdown) {
        let mut last_fetch = Instant::now();
        while shutdown.sleep(SWEEP_INTERVAL).await {
            let removed = self.registry.sweep();
            if !removed.is_empty() {
                log::info!("removed {} timed out containers", removed.len());
                self.clean();
            }
            if last_fetch.elapsed() >= self.config.fetch_all_interval {
                self.fetch_all().await;
                last_fetch = Instant::now();
            }
        }
        log::info!("discovery timer stopped");
    }

    /// Spawns the long lived loop of every adapter.
    pub fn sync_containers(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        self.adapters()
            .into_iter()
            .map(|adapter| {
                let shutdown = shutdown.clone();
                task::spawn_guarded(format!("{} discovery", adapter.kind()), async move {
                    adapter.run(shutdown).await;
                })
            })
            .collect()
    }

    /// Spawns the adapter loops and the timer.
    pub fn start(self: &Arc<Self>, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let mut handles = self.sync_containers(shutdown);
        let discovery = Arc::clone(self);
        let shutdown = shutdown.clone();
        handles.push(task::spawn_guarded("discovery timer", async move {
            discovery.timer_fetch(shutdown).await;
        }));
        handles
    }
}

fn alarm_for(kind: AdapterKind) -> AlarmType {
    match kind {
        AdapterKind::StaticFile => AlarmType::StaticContainer,
        AdapterKind::Docker => AlarmType::DockerCenter,
        AdapterKind::Cri => AlarmType::ConnectCriRuntime,
    }
}
