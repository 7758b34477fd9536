//! Persistent reader positions.
//!
//! A [`CheckpointRecord`] remembers how far a reader got in a file, together with the identity
//! of that file, so a restarted reader resumes where it stopped. Records are stored as opaque
//! blobs through a [`CheckpointStore`].
mod error;
mod record;
mod store;

pub use error::{Error, Result};
pub use record::{CheckpointRecord, FileState};
pub use store::{CheckpointStore, CheckpointStoreExt, FileCheckpointStore};
