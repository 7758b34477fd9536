use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerInspectResponse, ContainerSummary, EventMessage};
use bollard::system::EventsOptions;
use futures::Stream;

use crate::container::{ContainerSpec, ContainerState, Mount};
use crate::discovery::parse_rfc3339;

/// Stream of engine events, as returned by [`DockerApi::events`].
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventMessage, DockerError>> + Send>>;

const UPPER_DIR_KEY: &str = "UpperDir";

/// The Docker engine calls the adapter needs.
#[async_trait]
pub trait DockerApi: Send + Sync {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, DockerError>;

    /// Returns the first repository tag of an image, if it has one.
    async fn image_tag(&self, image_id: &str) -> Result<Option<String>, DockerError>;

    /// Subscribes to container events.
    fn events(&self) -> EventStream;
}

/// [`DockerApi`] backed by the engine's local socket.
#[derive(Debug, Clone)]
pub struct BollardDocker {
    docker: Docker,
    events: Docker,
}

impl BollardDocker {
    /// Connects with the platform defaults (`DOCKER_HOST` or the local unix socket).
    ///
    /// Requests time out after `request_timeout`; the event subscription uses
    /// `event_timeout` so an idle stream is not cut short.
    pub fn connect(request_timeout: Duration, event_timeout: Duration) -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            events: docker.clone().with_timeout(event_timeout),
            docker: docker.with_timeout(request_timeout),
        })
    }
}

#[async_trait]
impl DockerApi for BollardDocker {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerError> {
        self.docker
            .list_containers(Some(ListContainersOptions::<String>::default()))
            .await
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, DockerError> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
    }

    async fn image_tag(&self, image_id: &str) -> Result<Option<String>, DockerError> {
        let image = self.docker.inspect_image(image_id).await?;
        Ok(image
            .repo_tags
            .and_then(|tags| tags.into_iter().next()))
    }

    fn events(&self) -> EventStream {
        let options = EventsOptions::<String> {
            filters: HashMap::from([("type".to_owned(), vec!["container".to_owned()])]),
            ..Default::default()
        };
        Box::pin(self.events.events(Some(options)))
    }
}

/// Returns true if the engine answered that the object does not exist.
pub fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Converts an inspect response into the runtime neutral spec.
pub fn spec_from_inspect(info: ContainerInspectResponse) -> ContainerSpec {
    let (state, pid) = match &info.state {
        Some(state) => {
            let status = if state.running == Some(true) {
                ContainerState::Running
            } else {
                state
                    .status
                    .as_ref()
                    .map(|status| ContainerState::from_status(&status.to_string()))
                    .unwrap_or_default()
            };
            (status, state.pid.unwrap_or_default())
        }
        None => (ContainerState::Unknown, 0),
    };

    let ip = info
        .network_settings
        .as_ref()
        .and_then(|settings| {
            settings
                .ip_address
                .clone()
                .filter(|ip| !ip.is_empty())
                .or_else(|| {
                    settings.networks.as_ref().and_then(|networks| {
                        networks
                            .values()
                            .filter_map(|endpoint| endpoint.ip_address.clone())
                            .find(|ip| !ip.is_empty())
                    })
                })
        })
        .unwrap_or_default();

    let log_driver = info
        .host_config
        .as_ref()
        .and_then(|host| host.log_config.as_ref())
        .and_then(|log| log.typ.clone())
        .unwrap_or_default();
    let upper_dir = info
        .graph_driver
        .as_ref()
        .and_then(|driver| driver.data.get(UPPER_DIR_KEY).cloned())
        .unwrap_or_default();
    let mounts = info
        .mounts
        .unwrap_or_default()
        .into_iter()
        .map(|mount| Mount {
            source: mount.source.unwrap_or_default(),
            destination: mount.destination.unwrap_or_default(),
            driver: mount.driver.unwrap_or_default(),
        })
        .collect();

    let config = info.config.unwrap_or_default();
    ContainerSpec {
        id: info.id.unwrap_or_default(),
        name: info.name.unwrap_or_default(),
        created: info.created.as_deref().and_then(parse_rfc3339),
        state,
        pid,
        image_id: info.image.unwrap_or_default(),
        image: config.image.unwrap_or_default(),
        hostname: config.hostname.unwrap_or_default(),
        hosts_path: info.hosts_path.unwrap_or_default(),
        ip,
        labels: config.labels.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        mounts,
        log_path: info.log_path.unwrap_or_default(),
        log_driver,
        upper_dir,
        pod_labels: None,
    }
}

#[cfg(test)]
mod tests {
    use bollard::models::{
        ContainerConfig, ContainerState as InspectState, DriverData, EndpointSettings,
        HostConfig, HostConfigLogConfig, MountPoint, NetworkSettings,
    };

    use super::*;

    #[test]
    fn test_spec_from_inspect() {
        let info = ContainerInspectResponse {
            id: Some("c1".to_owned()),
            name: Some("/web".to_owned()),
            created: Some("2024-01-02T03:04:05.123456789Z".to_owned()),
            state: Some(InspectState {
                running: Some(true),
                pid: Some(321),
                ..Default::default()
            }),
            image: Some("sha256:abc".to_owned()),
            hosts_path: Some("/var/lib/docker/containers/c1/hosts".to_owned()),
            log_path: Some("/var/lib/docker/containers/c1/c1-json.log".to_owned()),
            host_config: Some(HostConfig {
                log_config: Some(HostConfigLogConfig {
                    typ: Some("json-file".to_owned()),
                    config: None,
                }),
                ..Default::default()
            }),
            graph_driver: Some(DriverData {
                name: "overlay2".to_owned(),
                data: HashMap::from([(
                    UPPER_DIR_KEY.to_owned(),
                    "/var/lib/docker/overlay2/x/diff".to_owned(),
                )]),
            }),
            mounts: Some(vec![MountPoint {
                source: Some("/data".to_owned()),
                destination: Some("/app/data".to_owned()),
                ..Default::default()
            }]),
            config: Some(ContainerConfig {
                hostname: Some("web-1".to_owned()),
                image: Some("nginx:latest".to_owned()),
                env: Some(vec!["A=1".to_owned()]),
                labels: Some(HashMap::from([("app".to_owned(), "web".to_owned())])),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(HashMap::from([(
                    "bridge".to_owned(),
                    EndpointSettings {
                        ip_address: Some("172.17.0.3".to_owned()),
                        ..Default::default()
                    },
                )])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let spec = spec_from_inspect(info);
        assert_eq!(spec.id, "c1");
        assert_eq!(spec.name, "/web");
        assert_eq!(spec.state, ContainerState::Running);
        assert_eq!(spec.pid, 321);
        assert!(spec.created.is_some());
        assert_eq!(spec.image_id, "sha256:abc");
        assert_eq!(spec.image, "nginx:latest");
        assert_eq!(spec.hostname, "web-1");
        assert_eq!(spec.ip, "172.17.0.3");
        assert_eq!(spec.log_driver, "json-file");
        assert_eq!(spec.upper_dir, "/var/lib/docker/overlay2/x/diff");
        assert_eq!(spec.mounts.len(), 1);
        assert_eq!(spec.mounts[0].destination, "/app/data");
        assert_eq!(spec.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(spec.env, vec!["A=1".to_owned()]);
    }

    #[test]
    fn test_spec_from_empty_inspect() {
        let spec = spec_from_inspect(ContainerInspectResponse::default());
        assert!(spec.id.is_empty());
        assert_eq!(spec.state, ContainerState::Unknown);
        assert!(spec.created.is_none());
    }

    #[test]
    fn test_is_not_found() {
        let err = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_owned(),
        };
        assert!(is_not_found(&err));
        let err = DockerError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_owned(),
        };
        assert!(!is_not_found(&err));
    }
}
