use std::path::{Component, Path, PathBuf};

use super::RuntimeEnvironment;

/// Default mount point of the host root filesystem inside the agent container.
pub const DEFAULT_MOUNT_PATH: &str = "/logtail_host";

/// Translates host paths into the agent's mount namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPaths {
    prefix: Option<PathBuf>,
}

impl HostPaths {
    /// Creates a translator that prepends `prefix` to every host path, or none for `None`.
    pub fn new(prefix: Option<PathBuf>) -> Self {
        Self { prefix }
    }

    /// Chooses the host mount for the detected environment.
    ///
    /// On the host nothing is translated. In a container the configured mount path is used,
    /// falling back to [`DEFAULT_MOUNT_PATH`]; if that directory does not exist, paths are used
    /// untranslated and a warning is logged.
    pub fn detect(environment: RuntimeEnvironment, configured: Option<PathBuf>) -> Self {
        match environment {
            RuntimeEnvironment::Host => Self::new(None),
            RuntimeEnvironment::Container => {
                let prefix = configured.unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNT_PATH));
                if prefix.is_dir() {
                    log::info!("translating host paths through `{}`", prefix.display());
                    Self::new(Some(prefix))
                } else {
                    log::warn!(
                        "running in a container but host mount `{}` is missing, using host paths as is",
                        prefix.display()
                    );
                    Self::new(None)
                }
            }
        }
    }

    pub fn prefix(&self) -> Option<&Path> {
        self.prefix.as_deref()
    }

    /// Maps an absolute host path into the current mount namespace.
    ///
    /// # Examples
    ///
    /// ```
    /// # use container_stdout_core::environment::HostPaths;
    /// let paths = HostPaths::new(Some("/logtail_host".into()));
    /// assert_eq!(
    ///     paths.translate("/var/lib/docker/a.log"),
    ///     std::path::PathBuf::from("/logtail_host/var/lib/docker/a.log")
    /// );
    /// ```
    pub fn translate(&self, host_path: impl AsRef<Path>) -> PathBuf {
        let host_path = host_path.as_ref();
        match &self.prefix {
            None => host_path.to_path_buf(),
            Some(prefix) => {
                let relative: PathBuf = host_path
                    .components()
                    .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
                    .collect();
                prefix.join(relative)
            }
        }
    }

    /// Returns true if `/proc/<pid>/stat` of the host exists.
    pub fn process_alive(&self, pid: i64) -> bool {
        if pid <= 0 {
            return false;
        }
        self.translate(format!("/proc/{pid}/stat")).exists()
    }

    /// Looks up the address of `hostname` in the container's hosts file.
    ///
    /// Returns the first address whose line lists `hostname` among its names.
    pub fn ip_from_hosts(&self, hosts_path: impl AsRef<Path>, hostname: &str) -> Option<String> {
        if hostname.is_empty() {
            return None;
        }
        let path = self.translate(hosts_path);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                log::debug!("failed to read hosts file `{}`: {}", path.display(), err);
                return None;
            }
        };
        content.lines().find_map(|line| {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let addr = fields.next()?;
            fields.any(|name| name == hostname).then(|| addr.to_owned())
        })
    }
}
