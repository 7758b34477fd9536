use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{Error, Result};

const BLOB_EXTENSION: &str = "json";
const TMP_EXTENSION: &str = "tmp";

/// Key -> opaque blob storage for reader checkpoints.
///
/// Durability is best effort: a crash may lose the last save interval.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, key: &str, blob: &[u8]) -> Result<()>;

    /// Returns the blob stored under `key`, or `None` if there is none.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Deletes every blob whose key is not in `keep`, returning how many were deleted.
    fn delete_unused(&self, keep: &HashSet<String>) -> Result<usize>;
}

/// JSON helpers on top of any [`CheckpointStore`].
pub trait CheckpointStoreExt: CheckpointStore {
    fn save_object<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let blob = serde_json::to_vec(value).map_err(|source| Error::Encode {
            key: key.to_owned(),
            source,
        })?;
        self.save(key, &blob)
    }

    fn load_object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.load(key)? {
            None => Ok(None),
            Some(blob) => serde_json::from_slice(&blob)
                .map(Some)
                .map_err(|source| Error::Decode {
                    key: key.to_owned(),
                    source,
                }),
        }
    }
}

impl<S: CheckpointStore + ?Sized> CheckpointStoreExt for S {}

/// Stores each blob as one file in a directory.
///
/// Writes go to a temporary file that is renamed over the target, so a reader never observes a
/// half-written blob.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Opens the store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CreateDir`] if the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|source| Error::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{BLOB_EXTENSION}", file_name_for_key(key)))
    }
}

/// Maps a key onto a file name that cannot escape the store directory.
fn file_name_for_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_owned()
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, key: &str, blob: &[u8]) -> Result<()> {
        let path = self.blob_path(key);
        let tmp = path.with_extension(TMP_EXTENSION);
        let write_err = |source| Error::Write {
            key: key.to_owned(),
            path: path.clone(),
            source,
        };
        std::fs::write(&tmp, blob).map_err(write_err)?;
        std::fs::rename(&tmp, &path).map_err(write_err)?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(key);
        match std::fs::read(&path) {
            Ok(blob) => Ok(Some(blob)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Error::Read {
                key: key.to_owned(),
                path,
                source,
            }),
        }
    }

    fn delete_unused(&self, keep: &HashSet<String>) -> Result<usize> {
        let keep: HashSet<String> = keep.iter().map(|k| file_name_for_key(k)).collect();
        let list_err = |source| Error::List {
            path: self.dir.clone(),
            source,
        };
        let mut deleted = 0;
        for entry in std::fs::read_dir(&self.dir).map_err(list_err)? {
            let path = entry.map_err(list_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if keep.contains(stem) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    log::debug!("deleted unused checkpoint `{}`", path.display());
                    deleted += 1;
                }
                Err(err) => log::warn!(
                    "failed to delete unused checkpoint `{}`: {}",
                    path.display(),
                    err
                ),
            }
        }
        Ok(deleted)
    }
}
