//! Adapter for a JSON file that lists the node's containers.
//!
//! Used where no runtime API is reachable, e.g. serverless nodes whose sidecar writes the file.
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{AdapterContext, AdapterKind, Error, Result, RuntimeAdapter};
use crate::alarm::{self, AlarmType};
use crate::checkpoint::FileState;
use crate::shutdown::Shutdown;

mod record;
mod relink;

pub use record::{StaticContainer, StaticState};
pub use relink::relink_latest;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Containers read from one load of the file.
#[derive(Debug, Default)]
pub struct Loaded {
    pub containers: Vec<StaticContainer>,
    /// Ids present in the previous load but missing or no longer running now.
    pub removed: Vec<String>,
}

/// Reads the file again only when it changed or the last read failed.
#[derive(Debug)]
pub struct StaticFileLoader {
    path: PathBuf,
    file_state: Option<FileState>,
    failed: bool,
    ids: HashSet<String>,
}

impl StaticFileLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_state: None,
            failed: false,
            ids: HashSet::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the file; returns `None` if it is unchanged since the last successful load.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a JSON array of containers.
    pub fn load(&mut self, force: bool, alive: impl Fn(&StaticContainer) -> bool) -> Result<Option<Loaded>> {
        let result = self.try_load(force, alive);
        self.failed = result.is_err();
        result
    }

    fn try_load(&mut self, force: bool, alive: impl Fn(&StaticContainer) -> bool) -> Result<Option<Loaded>> {
        let unreadable = |source| Error::StaticFileUnreadable {
            path: self.path.clone(),
            source,
        };
        let state = FileState::from_metadata(&std::fs::metadata(&self.path).map_err(unreadable)?);
        if !force && !self.failed && self.file_state == Some(state) {
            return Ok(None);
        }
        let raw = std::fs::read(&self.path).map_err(unreadable)?;
        let containers: Vec<StaticContainer> =
            serde_json::from_slice(&raw).map_err(|source| Error::StaticFileInvalid {
                path: self.path.clone(),
                source,
            })?;
        let containers: Vec<StaticContainer> = containers
            .into_iter()
            .filter(|container| !container.id.is_empty() && alive(container))
            .collect();

        let ids: HashSet<String> = containers.iter().map(|c| c.id.clone()).collect();
        let removed = self.ids.difference(&ids).cloned().collect();
        self.ids = ids;
        self.file_state = Some(state);
        Ok(Some(Loaded {
            containers,
            removed,
        }))
    }
}

/// Keeps the registry in sync with the static container file.
pub struct StaticFileAdapter {
    ctx: AdapterContext,
    loader: Mutex<StaticFileLoader>,
    /// Log paths of the last load, relinked when log scanning is on.
    log_paths: Mutex<Vec<String>>,
}

impl StaticFileAdapter {
    pub fn new(path: impl Into<PathBuf>, ctx: AdapterContext) -> Self {
        Self {
            ctx,
            loader: Mutex::new(StaticFileLoader::new(path)),
            log_paths: Mutex::new(Vec::new()),
        }
    }

    fn refresh(&self, force: bool) -> Result<()> {
        let host_paths = &self.ctx.host_paths;
        let loaded = self
            .loader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .load(force, |container| container.is_running(host_paths))?;
        let Some(loaded) = loaded else {
            return Ok(());
        };
        log::info!(
            "read static container info, {} containers, removed {:?}",
            loaded.containers.len(),
            loaded.removed
        );
        for id in &loaded.removed {
            self.ctx.registry.mark_deleted(id);
        }
        let mut log_paths = Vec::with_capacity(loaded.containers.len());
        for container in &loaded.containers {
            if !container.log_path.is_empty() {
                log_paths.push(container.log_path.clone());
            }
            if let Some(detail) = self.ctx.build_detail(container.to_spec(), None, None) {
                self.ctx.registry.upsert(detail);
            }
        }
        *self.log_paths.lock().unwrap_or_else(PoisonError::into_inner) = log_paths;
        Ok(())
    }

    fn relink_logs(&self) {
        let log_paths = self
            .log_paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for log_path in log_paths {
            let link = self.ctx.host_paths.translate(&log_path);
            match relink_latest(&link) {
                Ok(Some(target)) => log::info!("relinked `{log_path}` to `{target}`"),
                Ok(None) => {}
                Err(err) => log::debug!("failed to relink `{log_path}`: {err}"),
            }
        }
    }
}

#[async_trait]
impl RuntimeAdapter for StaticFileAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::StaticFile
    }

    /// Reloads the file. Only the Docker full fetch advances the registry's success time, so
    /// records removed from the file stay eligible for the sweep.
    async fn fetch_all(&self) -> Result<()> {
        self.refresh(true)
    }

    /// Single containers cannot be looked up in the file.
    async fn fetch_one(&self, id: &str) -> Result<()> {
        Err(Error::not_found(id))
    }

    fn sweep_cache(&self) {}

    async fn run(&self, mut shutdown: Shutdown) {
        log::info!("static container info flush loop started");
        while shutdown.sleep(FLUSH_INTERVAL).await {
            if let Err(err) = self.refresh(false) {
                alarm::raise(
                    AlarmType::StaticContainer,
                    format_args!("read static container info error: {err}"),
                );
            }
            if self.ctx.config.containerd_log_scan {
                self.relink_logs();
            }
        }
        log::info!("static container info flush loop stopped");
    }
}
