use std::collections::{BTreeMap, HashMap};

use crate::container::{ContainerDetail, ContainerState, Mount, StdoutFraming};

/// Row of the container listing.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub log_path: String,
    pub tags: BTreeMap<String, String>,
    pub delete_flag: bool,
}

impl From<&ContainerDetail> for ContainerSummary {
    fn from(detail: &ContainerDetail) -> Self {
        Self {
            id: detail.id.to_string(),
            name: detail.name.clone(),
            state: detail.state,
            log_path: detail.stdout_log_path.clone(),
            tags: detail.tags.clone(),
            delete_flag: detail.is_deleted(),
        }
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sView {
    pub namespace: String,
    pub pod: String,
    pub container_name: String,
    pub labels: HashMap<String, String>,
    pub paused: bool,
}

/// Everything known about one container.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerView {
    #[serde(flatten)]
    pub summary: ContainerSummary,
    pub image: String,
    pub ip: String,
    pub hostname: String,
    pub log_driver: String,
    pub framing: StdoutFraming,
    pub default_root_path: String,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub k8s: Option<K8sView>,
}

impl From<&ContainerDetail> for ContainerView {
    fn from(detail: &ContainerDetail) -> Self {
        let k8s = detail.k8s.as_ref().map(|info| K8sView {
            namespace: info.namespace.clone(),
            pod: info.pod.clone(),
            container_name: info.container_name.clone(),
            labels: detail.k8s_labels().as_ref().clone(),
            paused: info.paused,
        });
        Self {
            summary: ContainerSummary::from(detail),
            image: detail.image.clone(),
            ip: detail.ip.clone(),
            hostname: detail.hostname.clone(),
            log_driver: detail.log_driver.clone(),
            framing: detail.stdout_framing,
            default_root_path: detail.default_root_path.clone(),
            labels: detail.labels.clone(),
            env: detail.env.clone(),
            mounts: detail.mounts.clone(),
            k8s,
        }
    }
}
