use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Error that occurs when opening a file fails.
#[derive(Debug, thiserror::Error)]
#[error("failed to open file `{path}`: {source}")]
pub struct FileOpenError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Opens the file at the given path read-only.
///
/// # Errors
///
/// Returns a [`FileOpenError`] if the file cannot be opened.
///
/// # Example
/// ```no_run
/// # use container_stdout_core::fsutil;
/// let file = fsutil::open_file("/var/lib/docker/containers/abc/abc-json.log")?;
/// # Ok::<(), fsutil::FileOpenError>(())
/// ```
pub fn open_file(path: impl AsRef<Path>) -> Result<File, FileOpenError> {
    let path = path.as_ref();
    File::open(path).map_err(|source| FileOpenError {
        path: path.to_path_buf(),
        source,
    })
}

/// Lexically normalizes a slash separated path.
///
/// Repeated separators and `.` elements are dropped and `..` elements remove the preceding
/// element. The result has no trailing separator, except for the root itself. An empty input
/// yields `.`.
///
/// # Example
/// ```
/// # use container_stdout_core::fsutil::clean_path;
/// assert_eq!(clean_path("/var//log/./app/../pods/"), "/var/log/pods");
/// assert_eq!(clean_path("/.."), "/");
/// ```
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_owned(),
        (false, false) => joined,
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_open_file_success() {
        let tmp = tempfile::NamedTempFile::new().expect("failed to create temp file");
        let file = open_file(tmp.path()).expect("should open test file");
        assert!(file.metadata().unwrap().is_file());
    }

    #[test]
    fn test_open_file_error() {
        let result = open_file("/definitely/does/not/exist");
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.path, PathBuf::from("/definitely/does/not/exist"));
        assert_eq!(err.source.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(""), ".");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("/data/"), "/data");
        assert_eq!(clean_path("/data//logs/./a.log"), "/data/logs/a.log");
        assert_eq!(clean_path("/data/tmp/../logs"), "/data/logs");
        assert_eq!(clean_path("../a/../../b"), "../../b");
    }
}
