//! Adapter for the Docker engine API.
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bollard::models::{ContainerInspectResponse, EventMessage};
use futures::StreamExt;

use super::{AdapterContext, AdapterKind, ContainerEvent, Error, EventObserver, Result, RuntimeAdapter};
use crate::alarm::{self, AlarmType};
use crate::backoff::Backoff;
use crate::container::{ContainerDetail, ContainerSpec, K8S_SANDBOX_ID_LABEL};
use crate::shutdown::Shutdown;

mod client;

pub use client::{BollardDocker, DockerApi, EventStream, is_not_found, spec_from_inspect};

const INSPECT_ATTEMPTS: usize = 3;
const INSPECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Consecutive listener failures after which the listener gives up while CRI is available.
const DISABLE_AFTER_ERRORS: u32 = 10;
/// Consecutive listener failures after which every retry waits [`LONG_RETRY_DELAY`].
const LONG_RETRY_AFTER_ERRORS: u32 = 30;
const LONG_RETRY_DELAY: Duration = Duration::from_secs(300);
const RETRY_DELAY_CAP: Duration = Duration::from_secs(10);

/// How one subscription of the event stream ended.
enum Subscription {
    Shutdown,
    /// No event arrived within the listener timeout.
    Idle,
    Failed,
}

/// Keeps the registry in sync with a Docker engine.
pub struct DockerAdapter {
    api: Arc<dyn DockerApi>,
    ctx: AdapterContext,
    observer: EventObserver,
    /// Whether a CRI adapter runs next to this one and can take over.
    cri_enabled: bool,
    inspect_retry_delay: Duration,
}

impl DockerAdapter {
    pub fn new(
        api: Arc<dyn DockerApi>,
        ctx: AdapterContext,
        observer: EventObserver,
        cri_enabled: bool,
    ) -> Self {
        Self {
            api,
            ctx,
            observer,
            cri_enabled,
            inspect_retry_delay: INSPECT_RETRY_DELAY,
        }
    }

    #[cfg(test)]
    fn with_inspect_retry_delay(mut self, delay: Duration) -> Self {
        self.inspect_retry_delay = delay;
        self
    }

    async fn inspect_with_retry(&self, id: &str) -> Result<ContainerInspectResponse> {
        let mut attempt = 1;
        loop {
            match self.api.inspect_container(id).await {
                Ok(info) => return Ok(info),
                Err(err) if client::is_not_found(&err) => return Err(Error::not_found(id)),
                Err(err) if attempt >= INSPECT_ATTEMPTS => return Err(err.into()),
                Err(err) => {
                    log::debug!("inspect of container {id} failed (attempt {attempt}): {err}");
                    attempt += 1;
                    tokio::time::sleep(self.inspect_retry_delay).await;
                }
            }
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse> {
        self.api.inspect_container(id).await.map_err(|err| {
            if client::is_not_found(&err) {
                Error::not_found(id)
            } else {
                err.into()
            }
        })
    }

    /// Display name of an image id, asking the engine on a cache miss.
    async fn image_name(&self, image_id: &str) -> Option<String> {
        if image_id.is_empty() {
            return None;
        }
        if let Some(name) = self.ctx.registry.image_name(image_id) {
            return Some(name);
        }
        match self.api.image_tag(image_id).await {
            Ok(Some(name)) => {
                self.ctx.registry.cache_image_name(image_id, name.clone());
                Some(name)
            }
            Ok(None) => None,
            Err(err) => {
                log::debug!("failed to inspect image {image_id}: {err}");
                None
            }
        }
    }

    async fn build(&self, spec: ContainerSpec) -> Option<ContainerDetail> {
        let image_name = self.image_name(&spec.image_id).await;
        self.ctx.build_detail(spec, image_name, None)
    }

    /// Young containers are kept without a liveness check, so short lived ones are still
    /// collected.
    fn is_alive(&self, spec: &ContainerSpec) -> bool {
        let young = spec
            .created
            .and_then(|created| SystemTime::now().duration_since(created).ok())
            .is_some_and(|age| age < self.ctx.config.sync_containers_period);
        young || self.ctx.host_paths.process_alive(spec.pid)
    }

    /// Inspects and stores one container; with `with_sandbox` its pod sandbox is refreshed
    /// first.
    async fn fetch_container(&self, id: &str, with_sandbox: bool) -> Result<()> {
        let info = self.inspect(id).await?;
        let spec = client::spec_from_inspect(info);
        if with_sandbox {
            if let Some(sandbox) = spec
                .labels
                .get(K8S_SANDBOX_ID_LABEL)
                .filter(|sandbox| !sandbox.is_empty() && sandbox.as_str() != id)
            {
                match self.inspect(sandbox).await {
                    Ok(info) => {
                        if let Some(detail) = self.build(client::spec_from_inspect(info)).await {
                            self.ctx.registry.upsert(detail);
                        }
                    }
                    Err(err) => log::debug!("failed to refresh sandbox {sandbox} of {id}: {err}"),
                }
            }
        }
        if let Some(detail) = self.build(spec).await {
            log::debug!("fetched docker container {}", detail.id.short());
            self.ctx.registry.upsert(detail);
        }
        Ok(())
    }

    async fn handle_event(&self, event: EventMessage) {
        let id = event
            .actor
            .and_then(|actor| actor.id)
            .unwrap_or_default();
        let action = event.action.unwrap_or_default();
        if id.is_empty() {
            return;
        }
        log::debug!("docker event `{action}` of container {id}");
        match action.as_str() {
            "start" | "restart" | "rename" => {
                if let Err(err) = self.fetch_container(&id, false).await {
                    log::warn!("failed to fetch container {id} after `{action}`: {err}");
                }
            }
            "die" => {
                self.ctx.registry.mark_deleted(&id);
            }
            _ => {}
        }
        self.observer.notify(ContainerEvent {
            id,
            action,
            time_nanos: event.time_nano.unwrap_or_default(),
        });
    }

    /// Consumes one subscription until it ends, idles out or shutdown fires.
    async fn listen(&self, shutdown: &mut Shutdown, errors: &mut u32, backoff: &mut Backoff) -> Subscription {
        let mut events = self.api.events();
        let timeout = self.ctx.config.event_listener_timeout;
        loop {
            let next = tokio::select! {
                _ = shutdown.wait() => return Subscription::Shutdown,
                next = tokio::time::timeout(timeout, events.next()) => next,
            };
            match next {
                Err(_) => {
                    log::info!("no docker event within {timeout:?}, renewing the subscription");
                    return Subscription::Idle;
                }
                Ok(None) => {
                    log::info!("docker event stream closed");
                    return Subscription::Failed;
                }
                Ok(Some(Err(err))) => {
                    alarm::raise(
                        AlarmType::DockerCenter,
                        format_args!("docker event stream failed: {err}"),
                    );
                    return Subscription::Failed;
                }
                Ok(Some(Ok(event))) => {
                    *errors = 0;
                    backoff.reset();
                    self.handle_event(event).await;
                }
            }
        }
    }
}

#[async_trait]
impl RuntimeAdapter for DockerAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Docker
    }

    async fn fetch_all(&self) -> Result<()> {
        let summaries = self.api.list_containers().await?;
        let mut details = Vec::with_capacity(summaries.len());
        let mut inspect_failed = false;
        for id in summaries.into_iter().filter_map(|summary| summary.id) {
            let info = match self.inspect_with_retry(&id).await {
                Ok(info) => info,
                Err(err) => {
                    alarm::raise(
                        AlarmType::DockerCenter,
                        format_args!("failed to inspect container {id}: {err}"),
                    );
                    inspect_failed = true;
                    continue;
                }
            };
            let spec = client::spec_from_inspect(info);
            if !self.is_alive(&spec) {
                log::debug!("skipping container {id}, its process is gone");
                continue;
            }
            if let Some(detail) = self.build(spec).await {
                details.push(detail);
            }
        }
        log::debug!("docker fetch all found {} containers", details.len());
        self.ctx.registry.replace_all(details);
        if !inspect_failed {
            self.ctx.registry.set_last_fetch_all_success();
        }
        Ok(())
    }

    async fn fetch_one(&self, id: &str) -> Result<()> {
        self.fetch_container(id, true).await
    }

    fn sweep_cache(&self) {
        let dropped = self.ctx.registry.sweep_image_cache();
        if dropped > 0 {
            log::debug!("dropped {dropped} unused image names");
        }
    }

    async fn run(&self, mut shutdown: Shutdown) {
        let mut backoff = Backoff::new(Duration::from_secs(1), RETRY_DELAY_CAP);
        let mut errors = 0u32;
        loop {
            log::info!("docker event listener subscribing");
            match self.listen(&mut shutdown, &mut errors, &mut backoff).await {
                Subscription::Shutdown => return,
                Subscription::Idle => {
                    errors = 0;
                    backoff.reset();
                    continue;
                }
                Subscription::Failed => errors += 1,
            }
            if errors >= DISABLE_AFTER_ERRORS && self.cri_enabled {
                alarm::raise(
                    AlarmType::DockerCenter,
                    format_args!(
                        "docker event listener failed {errors} times in a row, leaving events to the CRI runtime"
                    ),
                );
                return;
            }
            let delay = if errors > LONG_RETRY_AFTER_ERRORS {
                LONG_RETRY_DELAY
            } else {
                backoff.next_delay()
            };
            log::debug!("docker event listener retrying in {delay:?} after {errors} errors");
            if !shutdown.sleep(delay).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use bollard::errors::Error as DockerError;
    use bollard::models::{
        ContainerConfig, ContainerState as InspectState, ContainerSummary, EventActor,
        HostConfig, HostConfigLogConfig,
    };
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::environment::HostPaths;
    use crate::registry::{Registry, RegistryTimeouts};

    #[derive(Default)]
    struct FakeDocker {
        containers: Mutex<HashMap<String, ContainerInspectResponse>>,
        broken: HashSet<String>,
        images: HashMap<String, String>,
        events: Mutex<Vec<EventMessage>>,
        inspect_calls: Mutex<Vec<String>>,
    }

    impl FakeDocker {
        fn add(&self, info: ContainerInspectResponse) {
            let id = info.id.clone().unwrap_or_default();
            self.containers.lock().unwrap().insert(id, info);
        }
    }

    #[async_trait]
    impl DockerApi for FakeDocker {
        async fn list_containers(&self) -> std::result::Result<Vec<ContainerSummary>, DockerError> {
            let mut ids: Vec<String> = self.containers.lock().unwrap().keys().cloned().collect();
            ids.extend(self.broken.iter().cloned());
            ids.sort();
            Ok(ids
                .into_iter()
                .map(|id| ContainerSummary {
                    id: Some(id),
                    ..Default::default()
                })
                .collect())
        }

        async fn inspect_container(
            &self,
            id: &str,
        ) -> std::result::Result<ContainerInspectResponse, DockerError> {
            self.inspect_calls.lock().unwrap().push(id.to_owned());
            if self.broken.contains(id) {
                return Err(DockerError::DockerResponseServerError {
                    status_code: 500,
                    message: "daemon busy".to_owned(),
                });
            }
            self.containers
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| DockerError::DockerResponseServerError {
                    status_code: 404,
                    message: format!("no such container: {id}"),
                })
        }

        async fn image_tag(&self, image_id: &str) -> std::result::Result<Option<String>, DockerError> {
            Ok(self.images.get(image_id).cloned())
        }

        fn events(&self) -> EventStream {
            let events: Vec<_> = self.events.lock().unwrap().drain(..).map(Ok).collect();
            Box::pin(futures::stream::iter(events).chain(futures::stream::pending()))
        }
    }

    fn running(id: &str, name: &str, labels: &[(&str, &str)]) -> ContainerInspectResponse {
        ContainerInspectResponse {
            id: Some(id.to_owned()),
            name: Some(name.to_owned()),
            created: Some(chrono::Utc::now().to_rfc3339()),
            image: Some("sha256:img".to_owned()),
            state: Some(InspectState {
                running: Some(true),
                pid: Some(1),
                ..Default::default()
            }),
            log_path: Some(format!("/var/lib/docker/containers/{id}/{id}-json.log")),
            host_config: Some(HostConfig {
                log_config: Some(HostConfigLogConfig {
                    typ: Some("json-file".to_owned()),
                    config: None,
                }),
                ..Default::default()
            }),
            config: Some(ContainerConfig {
                image: Some("busybox".to_owned()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn context() -> AdapterContext {
        let config = DiscoveryConfig::default();
        let registry = Arc::new(Registry::new(RegistryTimeouts::from(&config)));
        AdapterContext::new(registry, Arc::new(config), HostPaths::default())
    }

    fn adapter(fake: Arc<FakeDocker>, ctx: AdapterContext) -> DockerAdapter {
        DockerAdapter::new(fake, ctx, EventObserver::default(), false)
            .with_inspect_retry_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_fetch_all_replaces_registry() {
        let fake = Arc::new(FakeDocker {
            images: HashMap::from([("sha256:img".to_owned(), "busybox:1.36".to_owned())]),
            ..Default::default()
        });
        fake.add(running("c1", "/web", &[]));
        fake.add(running("c2", "/db", &[]));
        let ctx = context();
        let docker = adapter(Arc::clone(&fake), ctx.clone());

        docker.fetch_all().await.unwrap();
        assert_eq!(ctx.registry.len(), 2);
        let web = ctx.registry.get("c1").unwrap();
        assert_eq!(web.tags.get("_container_name_").map(String::as_str), Some("web"));
        assert_eq!(web.tags.get("_image_name_").map(String::as_str), Some("busybox:1.36"));
        assert_eq!(ctx.registry.image_name("sha256:img").as_deref(), Some("busybox:1.36"));
    }

    #[tokio::test]
    async fn test_fetch_all_with_failed_inspect_keeps_success_time() {
        let fake = Arc::new(FakeDocker {
            broken: HashSet::from(["bad".to_owned()]),
            ..Default::default()
        });
        fake.add(running("c1", "/web", &[]));
        let ctx = context();
        let before = ctx.registry.last_fetch_all_success();
        let docker = adapter(Arc::clone(&fake), ctx.clone());

        docker.fetch_all().await.unwrap();
        assert!(ctx.registry.contains("c1"));
        assert!(!ctx.registry.contains("bad"));
        assert_eq!(ctx.registry.last_fetch_all_success(), before);
        let calls = fake.inspect_calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|id| *id == "bad").count(), INSPECT_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_fetch_all_skips_dead_old_containers() {
        let fake = Arc::new(FakeDocker::default());
        let mut old = running("old", "/old", &[]);
        old.created = Some("2020-01-01T00:00:00Z".to_owned());
        if let Some(state) = old.state.as_mut() {
            state.pid = Some(99_999_999);
        }
        fake.add(old);
        let ctx = context();
        adapter(Arc::clone(&fake), ctx.clone()).fetch_all().await.unwrap();
        assert!(!ctx.registry.contains("old"));
    }

    #[tokio::test]
    async fn test_fetch_one_refreshes_sandbox() {
        let fake = Arc::new(FakeDocker::default());
        fake.add(running(
            "app",
            "/k8s_app_web-0_default_uid-1_0",
            &[(K8S_SANDBOX_ID_LABEL, "sandbox")],
        ));
        fake.add(running(
            "sandbox",
            "/k8s_POD_web-0_default_uid-1_0",
            &[("app", "web")],
        ));
        let ctx = context();
        let docker = adapter(Arc::clone(&fake), ctx.clone());

        docker.fetch_one("app").await.unwrap();
        assert!(ctx.registry.contains("sandbox"));
        let app = ctx.registry.get("app").unwrap();
        assert_eq!(app.k8s_labels().get("app").map(String::as_str), Some("web"));

        let err = docker.fetch_one("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_event_listener_applies_events() {
        let fake = Arc::new(FakeDocker::default());
        fake.add(running("c1", "/web", &[]));
        fake.add(running("c2", "/db", &[]));
        let event = |id: &str, action: &str| EventMessage {
            action: Some(action.to_owned()),
            actor: Some(EventActor {
                id: Some(id.to_owned()),
                attributes: None,
            }),
            ..Default::default()
        };
        fake.events
            .lock()
            .unwrap()
            .extend([event("c1", "start"), event("c2", "start"), event("c2", "die")]);

        let ctx = context();
        let observer = EventObserver::default();
        let (tx, mut rx) = mpsc::channel(8);
        observer.register(tx);
        let docker = Arc::new(DockerAdapter::new(fake, ctx.clone(), observer, false));
        let (trigger, shutdown) = crate::shutdown::channel();
        let handle = tokio::spawn({
            let docker = Arc::clone(&docker);
            async move { docker.run(shutdown).await }
        });

        let mut actions = Vec::new();
        for _ in 0..3 {
            let event = rx.recv().await.unwrap();
            actions.push((event.id, event.action));
        }
        trigger.trigger();
        handle.await.unwrap();

        assert_eq!(
            actions,
            vec![
                ("c1".to_owned(), "start".to_owned()),
                ("c2".to_owned(), "start".to_owned()),
                ("c2".to_owned(), "die".to_owned()),
            ]
        );
        assert!(!ctx.registry.get("c1").unwrap().is_deleted());
        assert!(ctx.registry.get("c2").unwrap().is_deleted());
    }
}
