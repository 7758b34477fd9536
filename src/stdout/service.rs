use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::collector::{Collector, PipelineContext};
use super::parser::{ParserOptions, StdoutParser};
use super::reader::{CheckpointHandle, FileReader, ReaderMetrics, ReaderOptions};
use super::Result;
use crate::alarm::{self, AlarmType};
use crate::checkpoint::{CheckpointRecord, CheckpointStore, CheckpointStoreExt, FileCheckpointStore};
use crate::config::{PipelineConfig, StdoutConfig};
use crate::container::{CONTAINERD_LOG_DRIVER, ContainerDetail, ContainerID};
use crate::environment::HostPaths;
use crate::filter::ContainerFilter;
use crate::metrics::{self, Average, Counter, MetricsRegistry};
use crate::registry::Registry;
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::task;

const JSON_FILE_LOG_DRIVER: &str = "json-file";
const CONFIG_LABEL: &str = "config_name";
const CONTAINER_LABEL: &str = "container_id";

/// Shared components every stdout service needs.
#[derive(Clone)]
pub struct ServiceDeps {
    pub registry: Arc<Registry>,
    pub host_paths: HostPaths,
    pub metrics: Arc<MetricsRegistry>,
    pub collector: Arc<dyn Collector>,
    /// Each pipeline keeps its checkpoints in a subdirectory named after its config.
    pub checkpoint_root: PathBuf,
}

struct ReaderHandle {
    trigger: ShutdownTrigger,
    task: JoinHandle<()>,
    checkpoint: CheckpointHandle,
}

/// One stdout collection pipeline: keeps a [`FileReader`] running for every container that
/// matches its filter.
pub struct StdoutService {
    context: PipelineContext,
    config: StdoutConfig,
    filter: ContainerFilter,
    parser_options: ParserOptions,
    reader_options: ReaderOptions,
    deps: ServiceDeps,
    store: Arc<dyn CheckpointStore>,
    full_list: HashSet<ContainerID>,
    match_list: HashMap<ContainerID, Arc<ContainerDetail>>,
    readers: HashMap<ContainerID, ReaderHandle>,
    last_update_time: i64,
    first_start: bool,
    container_count: Arc<Average>,
    add_container: Arc<Counter>,
    remove_container: Arc<Counter>,
}

impl StdoutService {
    /// # Errors
    ///
    /// Fails if the filter or the begin line regex do not compile, or if the checkpoint
    /// directory cannot be created.
    pub fn new(pipeline: &PipelineConfig, deps: ServiceDeps) -> Result<Self> {
        let config = pipeline.input.clone();
        let filter = ContainerFilter::from_config(&config)?;
        let parser_options = ParserOptions::from_config(&config)?;
        let store = FileCheckpointStore::open(deps.checkpoint_root.join(&pipeline.config_name))?;
        let labels = [(CONFIG_LABEL, pipeline.config_name.as_str())];
        Ok(Self {
            context: PipelineContext {
                project: pipeline.project.clone(),
                logstore: pipeline.logstore.clone(),
                config_name: pipeline.config_name.clone(),
            },
            reader_options: ReaderOptions::from(&config),
            container_count: deps.metrics.average(metrics::CONTAINER_COUNT, &labels),
            add_container: deps.metrics.counter(metrics::ADD_CONTAINER, &labels),
            remove_container: deps.metrics.counter(metrics::REMOVE_CONTAINER, &labels),
            config,
            filter,
            parser_options,
            deps,
            store: Arc::new(store),
            full_list: HashSet::new(),
            match_list: HashMap::new(),
            readers: HashMap::new(),
            last_update_time: 0,
            first_start: true,
        })
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Starts readers for newly matched containers and stops those that no longer match.
    ///
    /// Readers that ended on their own are restarted first. Apart from that, does nothing if the
    /// registry did not change since the previous call.
    pub async fn flush_all(&mut self) {
        self.restart_finished_readers();
        let update_time = self.deps.registry.last_update_time();
        if !self.first_start && update_time <= self.last_update_time {
            return;
        }
        self.last_update_time = update_time;

        let delta = self.deps.registry.snapshot_matching_delta(
            &mut self.full_list,
            &mut self.match_list,
            &self.filter,
        );
        if !self.first_start && delta.is_empty() {
            return;
        }
        self.first_start = false;
        self.container_count.add(self.match_list.len() as i64);
        log::info!(
            "{}: {} new matched containers, {} deleted, {} matched in total",
            self.context,
            delta.new_count(),
            delta.deleted_count(),
            self.match_list.len()
        );

        let matched: Vec<Arc<ContainerDetail>> = self.match_list.values().cloned().collect();
        for detail in matched {
            if !self.readers.contains_key(&detail.id) {
                self.start_reader(&detail);
            }
        }

        let gone: Vec<ContainerID> = self
            .readers
            .keys()
            .filter(|id| !self.match_list.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(reader) = self.readers.remove(&id) {
                stop_reader(&id, reader).await;
                self.deps.metrics.remove_labeled(&[
                    (CONFIG_LABEL, self.context.config_name.as_str()),
                    (CONTAINER_LABEL, id.as_ref()),
                ]);
                self.remove_container.add(1);
                log::info!("{}: stopped reading container {}", self.context, id.short());
            }
        }
    }

    /// Replaces readers whose task ended without being stopped, e.g. after a panic.
    fn restart_finished_readers(&mut self) {
        let finished: Vec<ContainerID> = self
            .readers
            .iter()
            .filter(|(_, reader)| reader.task.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for id in finished {
            let Some(reader) = self.readers.remove(&id) else {
                continue;
            };
            save_checkpoint(self.store.as_ref(), &id, &reader.checkpoint, true);
            if let Some(detail) = self.match_list.get(&id).cloned() {
                log::warn!(
                    "{}: reader of container {} ended unexpectedly, restarting",
                    self.context,
                    id.short()
                );
                self.start_reader(&detail);
            }
        }
    }

    fn start_reader(&mut self, detail: &ContainerDetail) {
        if !matches!(
            detail.log_driver.as_str(),
            "" | JSON_FILE_LOG_DRIVER | CONTAINERD_LOG_DRIVER
        ) {
            log::debug!(
                "{}: skipping container {} with log driver `{}`",
                self.context,
                detail.id.short(),
                detail.log_driver
            );
            return;
        }
        if detail.stdout_log_path.is_empty() {
            log::debug!(
                "{}: container {} has no stdout log path",
                self.context,
                detail.id.short()
            );
            return;
        }

        let saved = match self.store.load_object::<CheckpointRecord>(detail.id.as_ref()) {
            Ok(saved) => saved,
            Err(err) => {
                alarm::raise(AlarmType::Checkpoint, format_args!("{err}"));
                None
            }
        };
        let tags = detail.external_tags(
            &self.config.external_env_tag,
            &self.config.external_k8s_label_tag,
        );
        let parser = StdoutParser::new(
            self.parser_options.clone(),
            self.context.clone(),
            Arc::clone(&self.deps.collector),
            tags,
        );
        let metrics = ReaderMetrics::register(
            &self.deps.metrics,
            &[
                (CONFIG_LABEL, self.context.config_name.as_str()),
                (CONTAINER_LABEL, detail.id.as_ref()),
            ],
        );
        let path = self.deps.host_paths.translate(&detail.stdout_log_path);
        log::info!(
            "{}: start reading container {} from `{}`",
            self.context,
            detail.id.short(),
            path.display()
        );
        let reader = FileReader::new(path, saved, parser, self.reader_options.clone(), metrics);
        let checkpoint = reader.checkpoint_handle();
        let (trigger, signal) = shutdown::channel();
        let task = task::spawn_guarded(
            format!("{} reader {}", self.context, detail.id.short()),
            reader.run(signal),
        );
        self.readers.insert(
            detail.id.clone(),
            ReaderHandle {
                trigger,
                task,
                checkpoint,
            },
        );
        self.add_container.add(1);
    }

    /// Persists the checkpoints of running readers, all of them when `force`, and deletes the
    /// checkpoints of containers no longer read.
    pub fn save_checkpoints(&self, force: bool) {
        for (id, reader) in &self.readers {
            save_checkpoint(self.store.as_ref(), id, &reader.checkpoint, force);
        }
        let keep: HashSet<String> = self.readers.keys().map(ToString::to_string).collect();
        match self.store.delete_unused(&keep) {
            Ok(0) => {}
            Ok(deleted) => log::debug!("{}: deleted {deleted} stale checkpoints", self.context),
            Err(err) => alarm::raise(AlarmType::Checkpoint, format_args!("{err}")),
        }
    }

    /// Stops every reader and saves its final checkpoint.
    pub async fn stop(&mut self) {
        let readers: Vec<(ContainerID, ReaderHandle)> = self.readers.drain().collect();
        for (id, reader) in readers {
            let checkpoint = reader.checkpoint.clone();
            stop_reader(&id, reader).await;
            save_checkpoint(self.store.as_ref(), &id, &checkpoint, true);
        }
        log::info!("{}: stopped", self.context);
    }

    /// Flushes and saves on their intervals until `shutdown` fires, then stops.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut flush = tokio::time::interval(Duration::from_millis(self.config.flush_interval_ms));
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let save_every = Duration::from_secs(self.config.save_check_point_sec);
        let mut save = tokio::time::interval_at(tokio::time::Instant::now() + save_every, save_every);
        save.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = flush.tick() => self.flush_all().await,
                _ = save.tick() => self.save_checkpoints(false),
            }
        }
        self.stop().await;
    }
}

async fn stop_reader(id: &ContainerID, reader: ReaderHandle) {
    reader.trigger.trigger();
    if let Err(err) = reader.task.await {
        log::error!("reader of container {} failed: {}", id.short(), err);
    }
}

fn save_checkpoint(
    store: &dyn CheckpointStore,
    id: &ContainerID,
    handle: &CheckpointHandle,
    force: bool,
) {
    let (record, changed) = handle.take();
    if !changed && !force {
        return;
    }
    if let Err(err) = store.save_object(id.as_ref(), &record) {
        alarm::raise(AlarmType::Checkpoint, format_args!("{err}"));
    }
}
