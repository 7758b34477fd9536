use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("container `{id}` not found")]
    NotFound { id: String },
    #[error("fetch of container `{id}` refused, reaching the maximum fetch count {max} per second")]
    RateLimited { id: String, max: u32 },
    #[error("every container runtime adapter is disabled")]
    AllAdaptersDisabled,
    #[error("failed to read static container info `{path}`: {source}")]
    StaticFileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse static container info `{path}`: {source}")]
    StaticFileInvalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("docker request failed: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("CRI request `{method}` failed: {source}")]
    Cri {
        method: &'static str,
        #[source]
        source: Box<tonic::Status>,
    },
    #[error("failed to connect to socket `{path}`: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("CRI runtime reported no usable info for container `{id}`: {reason}")]
    CriInfo { id: String, reason: String },
    #[error("CRI runtime at `{path}` is not usable")]
    CriUnavailable { path: PathBuf },
    #[error("request `{method}` timed out")]
    Timeout { method: &'static str },
}

impl Error {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn cri(method: &'static str, status: tonic::Status) -> Self {
        Self::Cri {
            method,
            source: Box::new(status),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
