//! Container discovery.
//!
//! Three runtime adapters (a static JSON file, the Docker engine API and a CRI runtime) observe
//! containers and write what they see into the shared [`Registry`]. The [`Discovery`] controller
//! owns the adapters, drives their full fetches on a timer and their event or sync loops as
//! separate tasks.
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::config::DiscoveryConfig;
use crate::container::{ContainerDetail, ContainerSpec, DetailOptions};
use crate::environment::HostPaths;
use crate::registry::Registry;
use crate::shutdown::Shutdown;

mod controller;
pub mod cri;
pub mod docker;
mod error;
mod event;
pub mod static_file;

pub use controller::Discovery;
pub use error::{Error, Result};
pub use event::{ContainerEvent, EventObserver};

/// Which runtime an adapter talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AdapterKind {
    StaticFile,
    Docker,
    Cri,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdapterKind::StaticFile => "static",
            AdapterKind::Docker => "docker",
            AdapterKind::Cri => "cri",
        })
    }
}

/// One source of container observations.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// Lists every container of the runtime and updates the registry.
    async fn fetch_all(&self) -> Result<()>;

    /// Refreshes one container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the runtime does not know `id`.
    async fn fetch_one(&self, id: &str) -> Result<()>;

    /// Drops adapter local cache entries of containers the registry no longer knows.
    fn sweep_cache(&self);

    /// Runs the adapter's long lived loop until `shutdown` fires.
    async fn run(&self, shutdown: Shutdown);
}

/// What every adapter needs to turn an observation into a registry record.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub registry: Arc<Registry>,
    pub config: Arc<DiscoveryConfig>,
    pub host_paths: HostPaths,
}

impl AdapterContext {
    pub fn new(registry: Arc<Registry>, config: Arc<DiscoveryConfig>, host_paths: HostPaths) -> Self {
        Self {
            registry,
            config,
            host_paths,
        }
    }

    /// Builds the record of `spec`, reusing the address known from an earlier observation.
    ///
    /// Returns `None`, after logging, for specs without a valid id.
    pub fn build_detail(
        &self,
        spec: ContainerSpec,
        image_name: Option<String>,
        root_path_fallback: Option<String>,
    ) -> Option<ContainerDetail> {
        let previous_ip = self
            .registry
            .get(&spec.id)
            .map(|detail| detail.ip.clone())
            .filter(|ip| !ip.is_empty());
        let opts = DetailOptions {
            env_config_prefix: self.config.env_config_prefix.clone(),
            env_tags: self.config.env_tags.clone(),
            host_paths: self.host_paths.clone(),
            image_name,
            previous_ip,
            root_path_fallback,
        };
        match ContainerDetail::from_spec(spec, &opts, self.registry.now()) {
            Ok(detail) => Some(detail),
            Err(err) => {
                log::warn!("skipping container: {err}");
                None
            }
        }
    }
}

/// Parses an RFC 3339 timestamp as reported by runtimes; `None` if it is malformed.
pub(crate) fn parse_rfc3339(value: &str) -> Option<SystemTime> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(SystemTime::from)
        .ok()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_parse_rfc3339() {
        let time = parse_rfc3339("1970-01-01T00:00:10.5Z").unwrap();
        assert_eq!(
            time.duration_since(SystemTime::UNIX_EPOCH).unwrap(),
            Duration::from_millis(10_500)
        );
        assert!(parse_rfc3339("yesterday").is_none());
    }
}
