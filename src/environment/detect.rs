use std::path::Path;

use super::checks::{cgroup_names_container, has_container_markers, is_pid_namespace_isolated};

/// Where the agent process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnvironment {
    /// Directly on the host; runtime-reported paths can be opened as is.
    Host,
    /// Inside a container; host paths must be translated through the host mount.
    Container,
}

/// Detects whether the current process runs in a container or on the host.
///
/// Checks, in order: pid namespace isolation against init, the cgroup membership of the current
/// process, and runtime marker files or variables. Check failures are logged and treated as
/// "not a container".
pub fn detect_runtime_environment() -> RuntimeEnvironment {
    let proc_root = Path::new("/proc");
    match is_pid_namespace_isolated(proc_root) {
        Ok(true) => return RuntimeEnvironment::Container,
        Ok(false) => {}
        Err(err) => log::debug!("pid namespace check failed: {}", err),
    }

    match cgroup_names_container(&proc_root.join("self/cgroup")) {
        Ok(true) => return RuntimeEnvironment::Container,
        Ok(false) => {}
        Err(err) => log::warn!("cgroup check failed during runtime detection: {}", err),
    }

    if has_container_markers(Path::new("/")) {
        return RuntimeEnvironment::Container;
    }

    RuntimeEnvironment::Host
}
