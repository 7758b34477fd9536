use std::path::PathBuf;

use crate::fsutil::FileOpenError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to stat file `{path}`: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read file `{path}` at offset {offset}: {source}")]
    Read {
        path: PathBuf,
        offset: u64,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    OpenFile(#[from] FileOpenError),
    #[error("invalid begin line regex `{pattern}`: {source}")]
    BeginLineRegex {
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },
    #[error(transparent)]
    Filter(#[from] crate::filter::Error),
    #[error(transparent)]
    Checkpoint(#[from] crate::checkpoint::Error),
    #[error("reader task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
