use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;

/// Identity and size of a file at the time it was last observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileState {
    pub device: u64,
    pub inode: u64,
    pub size: i64,
    /// Modification time in nanoseconds since the unix epoch.
    pub modify_time: i64,
}

impl FileState {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            device: metadata.dev(),
            inode: metadata.ino(),
            size: i64::try_from(metadata.size()).unwrap_or(i64::MAX),
            modify_time: metadata
                .mtime()
                .saturating_mul(1_000_000_000)
                .saturating_add(metadata.mtime_nsec()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Returns true if both states describe the same underlying file, regardless of its size.
    pub fn same_file(&self, other: &FileState) -> bool {
        self.device == other.device && self.inode == other.inode
    }
}

/// Position of a reader in one file.
///
/// Two records are equal iff every field matches; the service only persists records that changed
/// since they were last saved.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckpointRecord {
    pub path: String,
    /// Bytes of the file that were fully consumed.
    pub offset: i64,
    pub state: FileState,
}

impl CheckpointRecord {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_layout() {
        let record = CheckpointRecord {
            path: "/a/b.log".to_owned(),
            offset: 100,
            state: FileState {
                device: 1,
                inode: 5,
                size: 200,
                modify_time: 7,
            },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "Path": "/a/b.log",
                "Offset": 100,
                "State": {"Device": 1, "Inode": 5, "Size": 200, "ModifyTime": 7}
            })
        );
        let back: CheckpointRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_from_metadata() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"12345").unwrap();
        let state = FileState::from_metadata(&std::fs::metadata(file.path()).unwrap());
        assert_eq!(state.size, 5);
        assert!(!state.is_empty());
        assert!(state.same_file(&FileState { size: 0, ..state }));
        assert!(FileState::default().is_empty());
    }
}
