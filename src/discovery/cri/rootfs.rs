use std::path::{Path, PathBuf};

use dashmap::DashMap;

use crate::environment::HostPaths;

const STATE_DIRS: [&str; 2] = ["/run/containerd", "/var/run/containerd"];
const RUNTIME_DIRS: [&str; 3] = [
    "io.containerd.runtime.v2.task",
    "io.containerd.runtime.v1.linux",
    "runc",
];
const NAMESPACE_DIRS: [&str; 2] = ["k8s.io", ""];
const LEAF_DIRS: [&str; 2] = ["rootfs", "root"];

/// Finds and caches the root filesystem directory of CRI containers.
#[derive(Debug)]
pub struct RootfsLookup {
    state_dirs: Vec<PathBuf>,
    host_paths: HostPaths,
    cache: DashMap<String, String>,
}

impl RootfsLookup {
    /// `custom_state_dir` is containerd's configured state directory, searched first.
    pub fn new(custom_state_dir: Option<PathBuf>, host_paths: HostPaths) -> Self {
        let state_dirs = custom_state_dir
            .into_iter()
            .chain(STATE_DIRS.iter().map(PathBuf::from))
            .collect();
        Self {
            state_dirs,
            host_paths,
            cache: DashMap::new(),
        }
    }

    /// Host path of the first existing rootfs directory of container `id`.
    pub fn find(&self, id: &str) -> Option<String> {
        if let Some(dir) = self.cache.get(id) {
            return Some(dir.value().clone());
        }
        let dir = self
            .candidates(id)
            .find(|dir| self.host_paths.translate(dir).is_dir())?
            .to_string_lossy()
            .into_owned();
        log::debug!("rootfs of container {id} is `{dir}`");
        self.cache.insert(id.to_owned(), dir.clone());
        Some(dir)
    }

    /// Search order: state dir, then namespace, then leaf name, then runtime backend.
    fn candidates<'a>(&'a self, id: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
        self.state_dirs.iter().flat_map(move |state| {
            NAMESPACE_DIRS.iter().flat_map(move |namespace| {
                LEAF_DIRS.iter().flat_map(move |leaf| {
                    RUNTIME_DIRS
                        .iter()
                        .map(move |runtime| candidate(state, runtime, namespace, id, leaf))
                })
            })
        })
    }

    /// Drops cached entries whose id `keep` rejects; returns how many were dropped.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) -> usize {
        let before = self.cache.len();
        self.cache.retain(|id, _| keep(id));
        before - self.cache.len()
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

fn candidate(state: &Path, runtime: &str, namespace: &str, id: &str, leaf: &str) -> PathBuf {
    let mut dir = state.join(runtime);
    if !namespace.is_empty() {
        dir.push(namespace);
    }
    dir.push(id);
    dir.push(leaf);
    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mkdir(root: &Path, host_path: &str) {
        std::fs::create_dir_all(root.join(host_path.trim_start_matches('/'))).unwrap();
    }

    #[test]
    fn test_find_in_search_order() {
        let dir = tempfile::tempdir().unwrap();
        mkdir(dir.path(), "/run/containerd/io.containerd.runtime.v2.task/c1/rootfs");
        mkdir(
            dir.path(),
            "/run/containerd/io.containerd.runtime.v1.linux/k8s.io/c1/rootfs",
        );
        let lookup = RootfsLookup::new(None, HostPaths::new(Some(dir.path().to_path_buf())));

        assert_eq!(
            lookup.find("c1").as_deref(),
            Some("/run/containerd/io.containerd.runtime.v1.linux/k8s.io/c1/rootfs")
        );
        assert_eq!(lookup.find("c2"), None);
    }

    #[test]
    fn test_custom_state_dir_first() {
        let dir = tempfile::tempdir().unwrap();
        mkdir(dir.path(), "/home/containerd/runc/c1/root");
        mkdir(dir.path(), "/run/containerd/io.containerd.runtime.v2.task/k8s.io/c1/rootfs");
        let lookup = RootfsLookup::new(
            Some(PathBuf::from("/home/containerd")),
            HostPaths::new(Some(dir.path().to_path_buf())),
        );
        assert_eq!(
            lookup.find("c1").as_deref(),
            Some("/home/containerd/runc/c1/root")
        );
    }

    #[test]
    fn test_cache_and_retain() {
        let dir = tempfile::tempdir().unwrap();
        mkdir(dir.path(), "/run/containerd/runc/k8s.io/c1/rootfs");
        mkdir(dir.path(), "/run/containerd/runc/k8s.io/c2/rootfs");
        let lookup = RootfsLookup::new(None, HostPaths::new(Some(dir.path().to_path_buf())));
        let first = lookup.find("c1");
        lookup.find("c2");
        std::fs::remove_dir_all(dir.path().join("run")).unwrap();
        assert_eq!(lookup.find("c1"), first);
        assert_eq!(lookup.cached(), 2);

        assert_eq!(lookup.retain(|id| id == "c2"), 1);
        assert_eq!(lookup.find("c1"), None);
    }
}
