//! gRPC channels to container runtimes listening on unix sockets.
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint};

/// Authority sent to the runtime. Runtimes serving on a socket ignore it.
const SOCKET_AUTHORITY: &str = "http://localhost";

/// Connector that dials the runtime socket for every connection; the URI only names the authority.
#[derive(Debug, Clone)]
struct RuntimeSocket {
    path: Arc<PathBuf>,
}

impl tower::Service<hyper::Uri> for RuntimeSocket {
    type Response = TokioIo<UnixStream>;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = std::io::Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: hyper::Uri) -> Self::Future {
        let path = Arc::clone(&self.path);
        Box::pin(async move { UnixStream::connect(path.as_path()).await.map(TokioIo::new) })
    }
}

/// Opens a gRPC channel to the runtime socket at `path`.
///
/// The connection attempt and every request on the channel are bounded by `timeout`.
///
/// # Errors
///
/// Returns an error if the socket does not accept a connection within `timeout`.
pub async fn channel_for_unix_socket(
    path: impl AsRef<Path>,
    timeout: Duration,
) -> Result<Channel, tonic::transport::Error> {
    let path = path.as_ref();
    log::debug!("dialing runtime socket {}", path.display());
    let connector = RuntimeSocket {
        path: Arc::new(path.to_path_buf()),
    };
    let channel = Endpoint::from_static(SOCKET_AUTHORITY)
        .connect_timeout(timeout)
        .timeout(timeout)
        .connect_with_connector(connector)
        .await?;
    log::debug!("runtime socket {} connected", path.display());
    Ok(channel)
}
