use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use crate::container::{ContainerSpec, ContainerState, Mount};
use crate::discovery::parse_rfc3339;
use crate::environment::HostPaths;

/// One element of the static container info file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct StaticContainer {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub host_name: String,
    #[serde(rename = "IP")]
    pub ip: String,
    pub image: String,
    pub log_path: String,
    pub labels: HashMap<String, String>,
    pub log_type: String,
    pub upper_dir: String,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub created: String,
    pub state: Option<StaticState>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct StaticState {
    pub pid: i64,
    pub status: String,
}

impl StaticContainer {
    /// Whether the record describes a live container.
    ///
    /// Records without a state, an empty status or no pid are taken as running.
    pub fn is_running(&self, host_paths: &HostPaths) -> bool {
        let Some(state) = &self.state else {
            return true;
        };
        let status_ok = state.status.is_empty()
            || ContainerState::from_status(&state.status) == ContainerState::Running;
        status_ok && (state.pid <= 0 || host_paths.process_alive(state.pid))
    }

    pub fn to_spec(&self) -> ContainerSpec {
        ContainerSpec {
            id: self.id.clone(),
            name: self.name.clone(),
            created: parse_rfc3339(&self.created),
            state: ContainerState::Running,
            pid: self.state.as_ref().map(|state| state.pid).unwrap_or_default(),
            image_id: String::new(),
            image: self.image.clone(),
            hostname: self.host_name.clone(),
            hosts_path: String::new(),
            ip: self.ip.clone(),
            labels: self.labels.clone(),
            env: self.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            mounts: self.mounts.clone(),
            log_path: self.log_path.clone(),
            log_driver: self.log_type.clone(),
            upper_dir: self.upper_dir.clone(),
            pod_labels: None,
        }
    }
}
