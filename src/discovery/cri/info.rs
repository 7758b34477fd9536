use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::Deserialize;

use crate::container::{CONTAINERD_LOG_DRIVER, ContainerSpec, ContainerState, Mount};
use crate::environment::HostPaths;
use crate::runtime::v1alpha2::{ContainerState as CriState, ContainerStatus};

/// Key of the verbose status map that holds the runtime's JSON info.
pub const INFO_KEY: &str = "info";

const HOSTS_MOUNT: &str = "/etc/hosts";
const HOSTNAME_MOUNT: &str = "/etc/hostname";

/// The part of containerd's verbose container info the adapter reads.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerInfo {
    pub pid: i64,
    #[serde(rename = "sandboxID")]
    pub sandbox_id: String,
    pub runtime_spec: Option<RuntimeSpec>,
    pub config: InfoConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeSpec {
    pub process: Option<SpecProcess>,
    pub mounts: Vec<SpecMount>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SpecProcess {
    pub env: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SpecMount {
    pub destination: String,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InfoConfig {
    pub envs: Vec<KeyValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl ContainerInfo {
    /// Decodes the `info` entry of a verbose status map.
    pub fn from_verbose(info: &HashMap<String, String>) -> Result<Self, String> {
        let raw = info
            .get(INFO_KEY)
            .ok_or_else(|| "verbose status has no info".to_owned())?;
        serde_json::from_str(raw).map_err(|err| format!("malformed info: {err}"))
    }

    /// Process environment, falling back to the configured env when the runtime spec is missing.
    fn env(&self) -> Vec<String> {
        match self.runtime_spec.as_ref().and_then(|spec| spec.process.as_ref()) {
            Some(process) => process.env.clone(),
            None => self
                .config
                .envs
                .iter()
                .map(|kv| format!("{}={}", kv.key, kv.value))
                .collect(),
        }
    }
}

/// Builds the runtime neutral spec of a CRI container.
///
/// The container counts as running only while the runtime says so and its process exists.
pub fn spec_from_status(
    status: &ContainerStatus,
    info: &ContainerInfo,
    host_paths: &HostPaths,
) -> ContainerSpec {
    let state = if status.state() == CriState::ContainerRunning && host_paths.process_alive(info.pid)
    {
        ContainerState::Running
    } else {
        ContainerState::Exited
    };

    let image = status
        .image
        .as_ref()
        .map(|image| image.image.clone())
        .filter(|image| !image.is_empty())
        .unwrap_or_else(|| status.image_ref.clone());

    let mut hosts_path = String::new();
    let mut hostname_path = String::new();
    let mut mounts = Vec::new();
    for mount in info.runtime_spec.iter().flat_map(|spec| &spec.mounts) {
        match mount.destination.as_str() {
            HOSTS_MOUNT => hosts_path = mount.source.clone(),
            HOSTNAME_MOUNT => hostname_path = mount.source.clone(),
            _ => {}
        }
        mounts.push(Mount {
            source: mount.source.clone(),
            destination: mount.destination.clone(),
            driver: mount.kind.clone(),
        });
    }
    let hostname = if hostname_path.is_empty() {
        String::new()
    } else {
        std::fs::read_to_string(host_paths.translate(&hostname_path))
            .map(|name| name.trim_matches(['\t', ' ', '\n']).to_owned())
            .unwrap_or_default()
    };

    ContainerSpec {
        id: status.id.clone(),
        name: status
            .metadata
            .as_ref()
            .map(|metadata| metadata.name.clone())
            .unwrap_or_default(),
        created: created_at(status.created_at),
        state,
        pid: info.pid,
        image_id: status.image_ref.clone(),
        image,
        hostname,
        hosts_path,
        ip: String::new(),
        labels: status.labels.clone(),
        env: info.env(),
        mounts,
        log_path: status.log_path.clone(),
        log_driver: CONTAINERD_LOG_DRIVER.to_owned(),
        upper_dir: String::new(),
        pod_labels: None,
    }
}

fn created_at(nanos: i64) -> Option<SystemTime> {
    let nanos = u64::try_from(nanos).ok().filter(|n| *n > 0)?;
    SystemTime::UNIX_EPOCH.checked_add(Duration::from_nanos(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::v1alpha2::{ContainerMetadata, ImageSpec};

    const INFO: &str = r#"{
        "sandboxID": "sandbox-1",
        "pid": 4242,
        "runtimeSpec": {
            "process": {"env": ["PATH=/bin", "aliyun_logs_app=stdout"]},
            "mounts": [
                {"destination": "/etc/hosts", "source": "/var/lib/kubelet/pods/p/etc-hosts", "type": "bind"},
                {"destination": "/etc/hostname", "source": "/var/lib/containerd/sandboxes/s/hostname", "type": "bind"},
                {"destination": "/data", "source": "/mnt/data", "type": "bind"}
            ]
        },
        "config": {"envs": [{"key": "IGNORED", "value": "1"}]}
    }"#;

    fn status() -> ContainerStatus {
        ContainerStatus {
            id: "c1".to_owned(),
            metadata: Some(ContainerMetadata {
                name: "app".to_owned(),
                attempt: 0,
            }),
            state: CriState::ContainerRunning as i32,
            created_at: 1_700_000_000_000_000_000,
            image: Some(ImageSpec {
                image: String::new(),
                annotations: HashMap::new(),
            }),
            image_ref: "docker.io/library/nginx@sha256:abc".to_owned(),
            labels: HashMap::from([("io.kubernetes.pod.name".to_owned(), "web-0".to_owned())]),
            log_path: "/var/log/pods/ns_web-0_uid/app/0.log".to_owned(),
            ..Default::default()
        }
    }

    fn host_with_process(pid: i64) -> (tempfile::TempDir, HostPaths) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(format!("proc/{pid}"))).unwrap();
        std::fs::write(dir.path().join(format!("proc/{pid}/stat")), b"").unwrap();
        std::fs::create_dir_all(dir.path().join("var/lib/containerd/sandboxes/s")).unwrap();
        std::fs::write(
            dir.path().join("var/lib/containerd/sandboxes/s/hostname"),
            b"web-0\n",
        )
        .unwrap();
        let paths = HostPaths::new(Some(dir.path().to_path_buf()));
        (dir, paths)
    }

    #[test]
    fn test_decode_verbose_info() {
        let info =
            ContainerInfo::from_verbose(&HashMap::from([(INFO_KEY.to_owned(), INFO.to_owned())]))
                .unwrap();
        assert_eq!(info.pid, 4242);
        assert_eq!(info.sandbox_id, "sandbox-1");
        assert_eq!(info.env(), vec!["PATH=/bin", "aliyun_logs_app=stdout"]);

        assert!(ContainerInfo::from_verbose(&HashMap::new()).is_err());
        let bad = HashMap::from([(INFO_KEY.to_owned(), "{".to_owned())]);
        assert!(ContainerInfo::from_verbose(&bad).is_err());
    }

    #[test]
    fn test_env_falls_back_to_config() {
        let info: ContainerInfo =
            serde_json::from_str(r#"{"config": {"envs": [{"key": "A", "value": "1"}]}}"#).unwrap();
        assert_eq!(info.env(), vec!["A=1"]);
    }

    #[test]
    fn test_spec_from_status() {
        let (_dir, paths) = host_with_process(4242);
        let info: ContainerInfo = serde_json::from_str(INFO).unwrap();
        let spec = spec_from_status(&status(), &info, &paths);

        assert_eq!(spec.id, "c1");
        assert_eq!(spec.name, "app");
        assert_eq!(spec.state, ContainerState::Running);
        assert_eq!(spec.pid, 4242);
        assert_eq!(spec.image, "docker.io/library/nginx@sha256:abc");
        assert_eq!(spec.hostname, "web-0");
        assert_eq!(spec.hosts_path, "/var/lib/kubelet/pods/p/etc-hosts");
        assert_eq!(spec.mounts.len(), 3);
        assert_eq!(spec.mounts[2].driver, "bind");
        assert_eq!(spec.log_driver, CONTAINERD_LOG_DRIVER);
        assert_eq!(
            spec.created
                .unwrap()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap()
                .as_secs(),
            1_700_000_000
        );
    }

    #[test]
    fn test_dead_process_is_exited() {
        let (_dir, paths) = host_with_process(1);
        let info: ContainerInfo = serde_json::from_str(INFO).unwrap();
        let spec = spec_from_status(&status(), &info, &paths);
        assert_eq!(spec.state, ContainerState::Exited);
    }
}
