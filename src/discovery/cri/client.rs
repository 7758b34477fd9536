use std::path::{Path, PathBuf};
use std::time::Duration;

use tonic::transport::Channel;

use crate::config::DiscoveryConfig;
use crate::discovery::{Error, Result};
use crate::environment::HostPaths;
use crate::runtime::v1alpha2::runtime_service_client::RuntimeServiceClient;
use crate::runtime::v1alpha2::{
    Container, ContainerStatusRequest, ContainerStatusResponse, ListContainersRequest,
    ListPodSandboxRequest, PodSandbox, PodSandboxStatusRequest, PodSandboxStatusResponse,
    StatusRequest, VersionRequest, VersionResponse,
};

/// Kubelet runtime API version sent with `Version`.
const KUBE_RUNTIME_API_VERSION: &str = "0.1.0";
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Sockets whose presence means kubernetes runs on docker through dockershim.
const DOCKERSHIM_SOCKETS: [&str; 2] = ["/var/run/dockershim.sock", "/run/dockershim.sock"];
const PROBE_ATTEMPTS: usize = 5;
const PROBE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Runtime service client with a deadline on every call.
#[derive(Debug, Clone)]
pub struct CriClient {
    inner: RuntimeServiceClient<Channel>,
    socket: PathBuf,
    timeout: Duration,
}

impl CriClient {
    /// Connects to the runtime listening on `socket`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] if the socket does not accept the connection.
    pub async fn connect(socket: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let socket = socket.as_ref().to_path_buf();
        let channel = crate::grpc::channel_for_unix_socket(&socket, timeout)
            .await
            .map_err(|source| Error::Connect {
                path: socket.clone(),
                source,
            })?;
        let inner = RuntimeServiceClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE);
        Ok(Self {
            inner,
            socket,
            timeout,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn call<T>(
        &self,
        method: &'static str,
        request: impl Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(Error::cri(method, status)),
            Err(_) => Err(Error::Timeout { method }),
        }
    }

    pub async fn version(&self) -> Result<VersionResponse> {
        let mut client = self.inner.clone();
        self.call(
            "Version",
            client.version(VersionRequest {
                version: KUBE_RUNTIME_API_VERSION.to_owned(),
            }),
        )
        .await
    }

    pub async fn status(&self) -> Result<()> {
        let mut client = self.inner.clone();
        self.call("Status", client.status(StatusRequest { verbose: false }))
            .await
            .map(|_| ())
    }

    pub async fn list_containers(&self) -> Result<Vec<Container>> {
        let mut client = self.inner.clone();
        self.call(
            "ListContainers",
            client.list_containers(ListContainersRequest { filter: None }),
        )
        .await
        .map(|response| response.containers)
    }

    pub async fn list_pod_sandboxes(&self) -> Result<Vec<PodSandbox>> {
        let mut client = self.inner.clone();
        self.call(
            "ListPodSandbox",
            client.list_pod_sandbox(ListPodSandboxRequest { filter: None }),
        )
        .await
        .map(|response| response.items)
    }

    /// Status of one container including the runtime's verbose `info`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the runtime does not know `id`.
    pub async fn container_status(&self, id: &str) -> Result<ContainerStatusResponse> {
        let mut client = self.inner.clone();
        let request = client.container_status(ContainerStatusRequest {
            container_id: id.to_owned(),
            verbose: true,
        });
        match self.call("ContainerStatus", request).await {
            Err(Error::Cri { source, .. }) if source.code() == tonic::Code::NotFound => {
                Err(Error::not_found(id))
            }
            result => result,
        }
    }

    pub async fn pod_sandbox_status(&self, id: &str) -> Result<PodSandboxStatusResponse> {
        let mut client = self.inner.clone();
        self.call(
            "PodSandboxStatus",
            client.pod_sandbox_status(PodSandboxStatusRequest {
                pod_sandbox_id: id.to_owned(),
                verbose: true,
            }),
        )
        .await
    }
}

/// Returns true if a dockershim socket exists, i.e. kubernetes drives docker and the docker
/// adapter covers the node.
pub fn dockershim_present(host_paths: &HostPaths) -> bool {
    DOCKERSHIM_SOCKETS
        .iter()
        .any(|socket| exists_not_dir(&host_paths.translate(socket)))
}

fn exists_not_dir(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|metadata| !metadata.is_dir())
}

/// Connects to the CRI runtime if the node runs one that this agent should use.
///
/// With `USE_CONTAINERD` set the runtime is taken as valid once connected. Otherwise a
/// dockershim socket disqualifies the runtime, and the runtime must answer `Status` and
/// `ListContainers` within a few attempts.
///
/// # Errors
///
/// Returns [`Error::CriUnavailable`] if the runtime should not be used, or the connect error.
pub async fn probe(config: &DiscoveryConfig, host_paths: &HostPaths) -> Result<CriClient> {
    let socket = host_paths.translate(&config.containerd_sock_path);
    let unavailable = || Error::CriUnavailable {
        path: socket.clone(),
    };
    if config.use_containerd {
        return CriClient::connect(&socket, config.request_timeout).await;
    }
    if dockershim_present(host_paths) {
        log::info!("dockershim socket found, not using the CRI runtime");
        return Err(unavailable());
    }
    if !exists_not_dir(&socket) {
        log::debug!("CRI socket `{}` does not exist", socket.display());
        return Err(unavailable());
    }

    let client = CriClient::connect(&socket, config.request_timeout).await?;
    let mut status_ok = false;
    for attempt in 1..=PROBE_ATTEMPTS {
        match client.status().await {
            Ok(()) => {
                status_ok = true;
                break;
            }
            Err(Error::Cri { source, .. }) if source.code() == tonic::Code::Unimplemented => {
                log::debug!("CRI runtime does not implement Status: {source}");
                return Err(unavailable());
            }
            Err(err) => log::debug!("CRI Status failed (attempt {attempt}): {err}"),
        }
        tokio::time::sleep(PROBE_RETRY_DELAY).await;
    }
    if !status_ok {
        return Err(unavailable());
    }
    for attempt in 1..=PROBE_ATTEMPTS {
        match client.list_containers().await {
            Ok(containers) => {
                log::debug!("CRI runtime lists {} containers", containers.len());
                return Ok(client);
            }
            Err(err) => log::debug!("CRI ListContainers failed (attempt {attempt}): {err}"),
        }
        tokio::time::sleep(PROBE_RETRY_DELAY).await;
    }
    Err(unavailable())
}
