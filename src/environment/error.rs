use std::path::PathBuf;

/// Errors raised by the container detection heuristics.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot resolve pid namespace link `{path}`: {source}")]
    NamespaceLink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot read cgroup membership from `{path}`: {source}")]
    CgroupFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
