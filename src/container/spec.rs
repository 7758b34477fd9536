use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use super::{
    CONTAINER_IP_TAG, CONTAINER_NAME_TAG, ContainerDetail, ContainerID, ContainerState,
    IMAGE_NAME_TAG, K8sInfo, Mount, NAMESPACE_TAG, POD_NAME_TAG, POD_UID_TAG, Result,
    StdoutFraming, env_config, pod_labels,
};
use crate::environment::HostPaths;

/// What a runtime adapter observed about one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub id: String,
    pub name: String,
    pub created: Option<SystemTime>,
    pub state: ContainerState,
    pub pid: i64,
    pub image_id: String,
    /// Image as configured for the container, used when the image id cannot be resolved.
    pub image: String,
    pub hostname: String,
    pub hosts_path: String,
    pub ip: String,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub log_path: String,
    pub log_driver: String,
    /// Writable layer of an overlay filesystem.
    pub upper_dir: String,
    /// Labels of the pod sandbox, when the runtime reports them separately.
    pub pod_labels: Option<HashMap<String, String>>,
}

/// Context needed to derive a [`ContainerDetail`] from a [`ContainerSpec`].
#[derive(Debug, Clone, Default)]
pub struct DetailOptions {
    pub env_config_prefix: String,
    pub env_tags: Vec<(String, String)>,
    pub host_paths: HostPaths,
    /// Display name of the image, resolved through the image cache.
    pub image_name: Option<String>,
    /// Address known from an earlier observation of the same container.
    pub previous_ip: Option<String>,
    /// Root path to use when the spec has no writable layer.
    pub root_path_fallback: Option<String>,
}

impl ContainerDetail {
    /// Builds a registry record, deriving tags, k8s info and env configs from the spec.
    ///
    /// # Errors
    ///
    /// Returns [`super::Error::InvalidContainerID`] if the spec's id is not a valid id.
    pub fn from_spec(spec: ContainerSpec, opts: &DetailOptions, now_nanos: i64) -> Result<Self> {
        let id = ContainerID::new(&spec.id)?;
        let ip = opts
            .previous_ip
            .clone()
            .filter(|ip| !ip.is_empty())
            .or_else(|| Some(spec.ip.clone()).filter(|ip| !ip.is_empty()))
            .or_else(|| {
                if spec.hosts_path.is_empty() {
                    return None;
                }
                opts.host_paths.ip_from_hosts(&spec.hosts_path, &spec.hostname)
            })
            .unwrap_or_default();

        let mut tags = BTreeMap::new();
        let image_name = opts
            .image_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| spec.image.clone());
        tags.insert(IMAGE_NAME_TAG.to_owned(), image_name.clone());

        let k8s = K8sInfo::from_name_and_labels(&spec.name, &spec.labels);
        let mut k8s_labels = HashMap::new();
        match &k8s {
            Some(info) => {
                tags.insert(CONTAINER_NAME_TAG.to_owned(), info.container_name.clone());
                tags.insert(POD_NAME_TAG.to_owned(), info.pod.clone());
                tags.insert(NAMESPACE_TAG.to_owned(), info.namespace.clone());
                tags.insert(POD_UID_TAG.to_owned(), info.pod_uid.clone());
                if info.paused {
                    k8s_labels = pod_labels(&spec.labels);
                }
                if let Some(sandbox_labels) = &spec.pod_labels {
                    k8s_labels.extend(pod_labels(sandbox_labels));
                }
            }
            None => {
                tags.insert(
                    CONTAINER_NAME_TAG.to_owned(),
                    spec.name.trim_start_matches('/').to_owned(),
                );
            }
        }
        if !ip.is_empty() {
            tags.insert(CONTAINER_IP_TAG.to_owned(), ip.clone());
        }

        let found = env_config::find_all(&spec.env, &opts.env_config_prefix, &opts.env_tags);
        tags.extend(found.tags);

        let default_root_path = if spec.upper_dir.is_empty() {
            opts.root_path_fallback.clone().unwrap_or_default()
        } else {
            spec.upper_dir
        };
        log::debug!(
            "container(id: {}, name: {}) default root path is `{}`",
            id.short(),
            spec.name,
            default_root_path
        );

        Ok(Self {
            id,
            name: spec.name,
            image: image_name,
            image_id: spec.image_id,
            created: spec.created,
            state: spec.state,
            pid: spec.pid,
            labels: spec.labels,
            env: spec.env,
            mounts: spec.mounts,
            stdout_log_path: spec.log_path,
            stdout_framing: StdoutFraming::for_log_driver(&spec.log_driver),
            log_driver: spec.log_driver,
            default_root_path,
            ip,
            hostname: spec.hostname,
            k8s,
            tags,
            env_config: found.configs,
            k8s_labels: RwLock::new(Arc::new(k8s_labels)),
            match_cache: Mutex::new(HashMap::new()),
            last_update: AtomicI64::new(now_nanos),
            deleted: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::K8S_POD_NAME_LABEL;

    #[test]
    fn test_plain_docker_container() {
        let detail = ContainerDetail::from_spec(
            ContainerSpec {
                id: "abc".to_owned(),
                name: "/web".to_owned(),
                image: "nginx".to_owned(),
                ip: "172.17.0.2".to_owned(),
                log_driver: "json-file".to_owned(),
                env: vec!["aliyun_logs_web_tags=app=nginx".to_owned()],
                ..Default::default()
            },
            &DetailOptions {
                env_config_prefix: "aliyun_logs_".to_owned(),
                image_name: Some("nginx:1.25".to_owned()),
                ..Default::default()
            },
            5,
        )
        .unwrap();
        assert!(detail.k8s.is_none());
        assert_eq!(detail.tags[CONTAINER_NAME_TAG], "web");
        assert_eq!(detail.tags[IMAGE_NAME_TAG], "nginx:1.25");
        assert_eq!(detail.tags[CONTAINER_IP_TAG], "172.17.0.2");
        assert_eq!(detail.tags["app"], "nginx");
        assert_eq!(detail.stdout_framing, StdoutFraming::DockerJson);
        assert_eq!(detail.last_update_nanos(), 5);
        assert!(!detail.is_deleted());
    }

    #[test]
    fn test_ip_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts");
        std::fs::write(&hosts, "10.0.0.3 web-0\n").unwrap();
        let spec = ContainerSpec {
            id: "abc".to_owned(),
            hostname: "web-0".to_owned(),
            hosts_path: hosts.to_string_lossy().into_owned(),
            ..Default::default()
        };

        let from_hosts =
            ContainerDetail::from_spec(spec.clone(), &DetailOptions::default(), 0).unwrap();
        assert_eq!(from_hosts.ip, "10.0.0.3");

        let reported = ContainerDetail::from_spec(
            ContainerSpec {
                ip: "10.0.0.4".to_owned(),
                ..spec.clone()
            },
            &DetailOptions::default(),
            0,
        )
        .unwrap();
        assert_eq!(reported.ip, "10.0.0.4");

        let previous = ContainerDetail::from_spec(
            ContainerSpec {
                ip: "10.0.0.4".to_owned(),
                ..spec
            },
            &DetailOptions {
                previous_ip: Some("10.0.0.5".to_owned()),
                ..Default::default()
            },
            0,
        )
        .unwrap();
        assert_eq!(previous.ip, "10.0.0.5");
    }

    #[test]
    fn test_cri_container_with_sandbox_labels() {
        let detail = ContainerDetail::from_spec(
            ContainerSpec {
                id: "abc".to_owned(),
                name: "app".to_owned(),
                log_driver: "containerd".to_owned(),
                labels: HashMap::from([
                    (K8S_POD_NAME_LABEL.to_owned(), "web-0".to_owned()),
                    ("io.kubernetes.pod.namespace".to_owned(), "prod".to_owned()),
                ]),
                pod_labels: Some(HashMap::from([
                    ("app".to_owned(), "web".to_owned()),
                    ("io.kubernetes.pod.uid".to_owned(), "u".to_owned()),
                ])),
                ..Default::default()
            },
            &DetailOptions {
                root_path_fallback: Some("/run/containerd/abc/rootfs".to_owned()),
                ..Default::default()
            },
            0,
        )
        .unwrap();
        let k8s = detail.k8s.as_ref().unwrap();
        assert_eq!(k8s.namespace, "prod");
        assert_eq!(k8s.container_name, "app");
        assert!(!k8s.paused);
        assert_eq!(detail.tags[POD_NAME_TAG], "web-0");
        assert_eq!(detail.tags[POD_UID_TAG], "");
        assert_eq!(detail.k8s_labels().len(), 1);
        assert_eq!(detail.stdout_framing, StdoutFraming::CriText);
        assert_eq!(detail.default_root_path, "/run/containerd/abc/rootfs");
    }

    #[test]
    fn test_invalid_id() {
        assert!(ContainerDetail::from_spec(ContainerSpec::default(), &DetailOptions::default(), 0).is_err());
    }
}
