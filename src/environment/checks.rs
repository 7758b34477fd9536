use std::path::Path;
use std::{env, fs};

use super::{Error, Result};

const CONTAINER_CGROUP_MARKERS: [&str; 4] = ["docker", "kubepods", "containerd", "libpod"];

/// Returns true if the pid namespace of `proc_root/self` differs from the one of
/// `proc_root/1`, i.e. the process does not share the init process' pid namespace.
///
/// # Errors
///
/// Returns [`Error::NamespaceLink`] if either namespace link cannot be read.
pub fn is_pid_namespace_isolated(proc_root: &Path) -> Result<bool> {
    let read = |path: &Path| {
        fs::read_link(path).map_err(|source| Error::NamespaceLink {
            path: path.to_path_buf(),
            source,
        })
    };
    let own = read(&proc_root.join("self/ns/pid"))?;
    let init = read(&proc_root.join("1/ns/pid"))?;
    Ok(own != init)
}

/// Returns true if the cgroup membership listed in `cgroup_file` names a container runtime or a
/// 64 character container id.
///
/// # Errors
///
/// Returns [`Error::CgroupFile`] if the file cannot be read.
pub fn cgroup_names_container(cgroup_file: &Path) -> Result<bool> {
    let content = fs::read_to_string(cgroup_file).map_err(|source| Error::CgroupFile {
        path: cgroup_file.to_path_buf(),
        source,
    })?;
    Ok(content.lines().any(|line| {
        CONTAINER_CGROUP_MARKERS.iter().any(|m| line.contains(m))
            || line
                .split(['/', '-', '.'])
                .any(|part| part.len() == 64 && part.chars().all(|c| c.is_ascii_hexdigit()))
    }))
}

/// Returns true if well-known marker files or variables of container runtimes are present.
pub fn has_container_markers(root: &Path) -> bool {
    root.join(".dockerenv").exists()
        || root.join("run/.containerenv").exists()
        || env::var_os("container").is_some()
        || env::var_os("KUBERNETES_SERVICE_HOST").is_some()
}
