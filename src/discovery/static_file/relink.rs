use std::io;
use std::path::Path;

/// Points the symlink at `link` to the numerically highest `<N>.log` file next to it.
///
/// A regular file at `link` is left alone. The link is replaced atomically through a temporary
/// link and a rename. Returns the new target file name if the link moved.
pub fn relink_latest(link: &Path) -> io::Result<Option<String>> {
    let Some(dir) = link.parent() else {
        return Ok(None);
    };
    if std::fs::symlink_metadata(link).is_ok_and(|metadata| !metadata.file_type().is_symlink()) {
        return Ok(None);
    }
    let link_name = link.file_name().map(|name| name.to_string_lossy().into_owned());

    let mut latest: Option<(u64, String)> = None;
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if Some(&name) == link_name.as_ref() {
            continue;
        }
        let Some(index) = name
            .strip_suffix(".log")
            .and_then(|stem| stem.parse::<u64>().ok())
        else {
            continue;
        };
        if latest.as_ref().is_none_or(|(best, _)| index > *best) {
            latest = Some((index, name));
        }
    }
    let Some((_, target)) = latest else {
        return Ok(None);
    };

    let current = std::fs::read_link(link).ok();
    if current.as_deref() == Some(Path::new(&target)) {
        return Ok(None);
    }
    let mut tmp = link.as_os_str().to_owned();
    tmp.push(".tmp");
    let _ = std::fs::remove_file(&tmp);
    std::os::unix::fs::symlink(&target, &tmp)?;
    std::fs::rename(&tmp, link)?;
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relink_follows_highest_index() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["0.log", "2.log", "10.log.gz", "app.log"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let link = dir.path().join("current.log");

        assert_eq!(relink_latest(&link).unwrap().as_deref(), Some("2.log"));
        assert_eq!(std::fs::read_link(&link).unwrap(), Path::new("2.log"));
        assert_eq!(relink_latest(&link).unwrap(), None);

        std::fs::write(dir.path().join("11.log"), b"").unwrap();
        assert_eq!(relink_latest(&link).unwrap().as_deref(), Some("11.log"));
        assert_eq!(std::fs::read_link(&link).unwrap(), Path::new("11.log"));
    }

    #[test]
    fn test_regular_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0.log"), b"data").unwrap();
        std::fs::write(dir.path().join("1.log"), b"").unwrap();
        let link = dir.path().join("0.log");
        assert_eq!(relink_latest(&link).unwrap(), None);
        assert_eq!(std::fs::read(&link).unwrap(), b"data");
    }
}
