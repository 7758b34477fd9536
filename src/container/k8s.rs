use std::collections::HashMap;

pub const K8S_POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
pub const K8S_POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";
pub const K8S_POD_UID_LABEL: &str = "io.kubernetes.pod.uid";
pub const K8S_SANDBOX_ID_LABEL: &str = "io.kubernetes.sandbox.id";

const K8S_INNER_LABEL_PREFIX: &str = "io.kubernetes";
const K8S_INNER_ANNOTATION_PREFIX: &str = "annotation.";

/// Names of the infrastructure container every pod runs.
const SANDBOX_CONTAINER_NAMES: [&str; 2] = ["POD", "pause"];

/// Identity of a container inside its pod.
///
/// Every record carries one; for containers that are not managed by kubernetes all fields are
/// empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct K8sInfo {
    pub namespace: String,
    pub pod: String,
    pub container_name: String,
    pub pod_uid: String,
    /// True for the pod's sandbox container, which is never a log source.
    pub paused: bool,
}

impl K8sInfo {
    /// Derives the pod identity from a runtime container name or, failing that, from the labels
    /// kubelet puts on every container.
    ///
    /// Names in kubelet's docker format look like
    /// `k8s_<container>_<pod>_<namespace>_<uid>_<attempt>`.
    pub fn from_name_and_labels(name: &str, labels: &HashMap<String, String>) -> Option<Self> {
        let info = if is_kubelet_name(name) {
            let parts: Vec<&str> = name.splitn(6, '_').collect();
            let base = usize::from(parts.len() == 6);
            if parts.len() < base + 4 {
                return None;
            }
            Self {
                container_name: parts[base].to_owned(),
                pod: parts[base + 1].to_owned(),
                namespace: parts[base + 2].to_owned(),
                pod_uid: parts[base + 3].to_owned(),
                paused: false,
            }
        } else if let Some(pod) = labels.get(K8S_POD_NAME_LABEL) {
            let label = |key: &str| labels.get(key).cloned().unwrap_or_default();
            Self {
                container_name: name.trim_start_matches('/').to_owned(),
                pod: pod.clone(),
                namespace: label(K8S_POD_NAMESPACE_LABEL),
                pod_uid: label(K8S_POD_UID_LABEL),
                paused: false,
            }
        } else {
            return None;
        };
        Some(Self {
            paused: SANDBOX_CONTAINER_NAMES.contains(&info.container_name.as_str()),
            ..info
        })
    }

    pub fn is_empty(&self) -> bool {
        self.namespace.is_empty() && self.pod.is_empty() && self.container_name.is_empty()
    }

    /// Key shared by every container of the same pod, `None` outside kubernetes.
    pub fn pod_key(&self) -> Option<String> {
        if self.pod.is_empty() {
            return None;
        }
        Some(format!("{}@{}", self.namespace, self.pod))
    }
}

fn is_kubelet_name(name: &str) -> bool {
    name.starts_with("/k8s_")
        || name.starts_with("k8s_")
        || name.bytes().filter(|b| *b == b'_').count() >= 4
}

/// Returns true for labels kubelet adds for its own bookkeeping.
pub fn is_inner_label(key: &str) -> bool {
    key.starts_with(K8S_INNER_LABEL_PREFIX) || key.starts_with(K8S_INNER_ANNOTATION_PREFIX)
}

/// The user visible pod labels among a sandbox's labels.
pub fn pod_labels(labels: &HashMap<String, String>) -> HashMap<String, String> {
    labels
        .iter()
        .filter(|(k, _)| !is_inner_label(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_kubelet_docker_name() {
        let info = K8sInfo::from_name_and_labels(
            "/k8s_php-redis_frontend-2337258262-154p7_default_d8a2e2dd-3617-11e7-a4b0-ecf4bbe5d414_0",
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(info.container_name, "php-redis");
        assert_eq!(info.pod, "frontend-2337258262-154p7");
        assert_eq!(info.namespace, "default");
        assert_eq!(info.pod_uid, "d8a2e2dd-3617-11e7-a4b0-ecf4bbe5d414");
        assert!(!info.paused);
        assert_eq!(
            info.pod_key().as_deref(),
            Some("default@frontend-2337258262-154p7")
        );
    }

    #[test]
    fn test_name_without_prefix() {
        let info = K8sInfo::from_name_and_labels(
            "terway_terway-multi-ip-mgslw_kube-system_b07b491e_8",
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(info.container_name, "terway");
        assert_eq!(info.namespace, "kube-system");
    }

    #[test]
    fn test_short_kubelet_name_is_not_k8s() {
        assert_eq!(K8sInfo::from_name_and_labels("k8s_a_b", &HashMap::new()), None);
    }

    #[test]
    fn test_from_labels_and_sandbox() {
        let labels = labels(&[
            (K8S_POD_NAME_LABEL, "web-0"),
            (K8S_POD_NAMESPACE_LABEL, "prod"),
            (K8S_POD_UID_LABEL, "uid-1"),
        ]);
        let info = K8sInfo::from_name_and_labels("POD", &labels).unwrap();
        assert!(info.paused);
        assert_eq!(info.pod, "web-0");
        assert_eq!(info.namespace, "prod");
        assert_eq!(info.pod_uid, "uid-1");

        assert_eq!(K8sInfo::from_name_and_labels("/nginx", &HashMap::new()), None);
    }

    #[test]
    fn test_pod_labels_drop_inner_keys() {
        let all = labels(&[
            ("app", "web"),
            ("io.kubernetes.pod.name", "web-0"),
            ("annotation.io.kubernetes.container.hash", "1"),
        ]);
        assert_eq!(pod_labels(&all), labels(&[("app", "web")]));
    }
}
