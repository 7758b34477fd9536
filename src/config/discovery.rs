use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_FETCH_ALL_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_FETCH_ALL_SUCCESS_TIMEOUT: Duration = Duration::from_secs(6000);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_FETCH_ONE_MAX_PER_SECOND: u32 = 200;
const DEFAULT_CRI_SYNC_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_SYNC_CONTAINERS_PERIOD: Duration = Duration::from_secs(3);
const MAX_FETCH_ALL_INTERVAL_SECS: u64 = 86400;

const DEFAULT_CONTAINERD_SOCK_PATH: &str = "/run/containerd/containerd.sock";
const DEFAULT_ENV_CONFIG_PREFIX: &str = "aliyun_logs_";

/// Environment variables that set the CRI sync period, from lowest to highest precedence.
const CRI_SYNC_INTERVAL_KEYS: [&str; 3] = [
    "CONTAINERD_LISTEN_LOOP_INTERVAL",
    "docker_config_update_interval",
    "ALIYUN_LOGTAIL_DOCKER_CONFIG_UPDATE_INTERVAL",
];

/// Settings of the discovery controller and the runtime adapters.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Period of the full re-list of every enabled adapter.
    pub fetch_all_interval: Duration,
    /// Age of the last successful full fetch after which timed out containers are dropped even
    /// if the runtime is unreachable.
    pub fetch_all_success_timeout: Duration,
    /// Deadline for every request against a runtime.
    pub request_timeout: Duration,
    pub fetch_one_max_per_second: u32,
    pub cri_sync_interval: Duration,
    /// Containers younger than this are kept without a pid liveness check.
    pub sync_containers_period: Duration,
    pub container_info_timeout_max: Duration,
    pub container_info_deleted_timeout: Duration,
    pub event_listener_timeout: Duration,
    pub static_container_info: Option<PathBuf>,
    pub mount_path: Option<PathBuf>,
    pub use_containerd: bool,
    pub containerd_sock_path: PathBuf,
    pub containerd_state_dir: Option<PathBuf>,
    /// `(name, value)` pairs added to every container's env config tags.
    pub env_tags: Vec<(String, String)>,
    pub env_config_prefix: String,
    pub containerd_log_scan: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            fetch_all_interval: DEFAULT_FETCH_ALL_INTERVAL,
            fetch_all_success_timeout: DEFAULT_FETCH_ALL_SUCCESS_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            fetch_one_max_per_second: DEFAULT_FETCH_ONE_MAX_PER_SECOND,
            cri_sync_interval: DEFAULT_CRI_SYNC_INTERVAL,
            sync_containers_period: DEFAULT_SYNC_CONTAINERS_PERIOD,
            container_info_timeout_max: Duration::from_secs(450),
            container_info_deleted_timeout: Duration::from_secs(30),
            event_listener_timeout: Duration::from_secs(3600),
            static_container_info: None,
            mount_path: None,
            use_containerd: false,
            containerd_sock_path: PathBuf::from(DEFAULT_CONTAINERD_SOCK_PATH),
            containerd_state_dir: None,
            env_tags: Vec::new(),
            env_config_prefix: DEFAULT_ENV_CONFIG_PREFIX.to_owned(),
            containerd_log_scan: false,
        }
    }
}

impl DiscoveryConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, falling back to defaults for missing or
    /// invalid values. Invalid values are logged.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(secs) = parse_value::<u64>(&lookup, "DOCKER_FETCH_ALL_INTERVAL") {
            if secs > 0 && secs < MAX_FETCH_ALL_INTERVAL_SECS {
                config.fetch_all_interval = Duration::from_secs(secs);
            } else {
                log::warn!(
                    "DOCKER_FETCH_ALL_INTERVAL={secs} is out of range (0, {MAX_FETCH_ALL_INTERVAL_SECS}), using default"
                );
            }
        }
        if let Some(secs) = parse_value::<u64>(&lookup, "DOCKER_FETCH_ALL_SUCCESS_TIMEOUT") {
            config.fetch_all_success_timeout = Duration::from_secs(secs);
        }
        if config.fetch_all_success_timeout <= config.fetch_all_interval {
            log::warn!(
                "fetch all success timeout {:?} must exceed fetch all interval {:?}, using defaults",
                config.fetch_all_success_timeout,
                config.fetch_all_interval
            );
            config.fetch_all_interval = DEFAULT_FETCH_ALL_INTERVAL;
            config.fetch_all_success_timeout = DEFAULT_FETCH_ALL_SUCCESS_TIMEOUT;
        }
        if let Some(secs) = parse_value::<u64>(&lookup, "DOCKER_CLIENT_REQUEST_TIMEOUT") {
            if secs > 0 {
                config.request_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(max) = parse_value::<u32>(&lookup, "CONTAINER_FETCH_ONE_MAX_COUNT_PER_SECOND") {
            if max > 0 {
                config.fetch_one_max_per_second = max;
            } else {
                log::warn!("CONTAINER_FETCH_ONE_MAX_COUNT_PER_SECOND must be positive, using default");
            }
        }
        for key in CRI_SYNC_INTERVAL_KEYS {
            if let Some(secs) = parse_value::<u64>(&lookup, key) {
                if secs > 0 {
                    config.cri_sync_interval = Duration::from_secs(secs);
                }
            }
        }

        config.static_container_info = non_empty(&lookup, "ALIYUN_LOG_STATIC_CONTAINER_INFO")
            .map(PathBuf::from);
        config.mount_path = non_empty(&lookup, "ALIYUN_LOGTAIL_MOUNT_PATH").map(PathBuf::from);
        config.use_containerd = non_empty(&lookup, "USE_CONTAINERD").is_some();
        if let Some(path) = non_empty(&lookup, "CONTAINERD_SOCK_PATH") {
            config.containerd_sock_path = PathBuf::from(path);
        }
        config.containerd_state_dir = non_empty(&lookup, "CONTAINERD_STATE_DIR").map(PathBuf::from);
        config.containerd_log_scan = non_empty(&lookup, "CONTAINERD_LOG_SYMLINK_SCAN")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        if let Some(names) = non_empty(&lookup, "ALIYUN_LOG_ENV_TAGS") {
            config.env_tags = names
                .split('|')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .filter_map(|name| lookup(name).map(|value| (name.to_owned(), value)))
                .collect();
        }

        config
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn parse_value<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = non_empty(lookup, key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring invalid value `{raw}` of environment variable `{key}`");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DiscoveryConfig::from_lookup(|_| None);
        assert_eq!(config.fetch_all_interval, Duration::from_secs(300));
        assert_eq!(config.fetch_all_success_timeout, Duration::from_secs(6000));
        assert_eq!(config.fetch_one_max_per_second, 200);
        assert_eq!(
            config.containerd_sock_path,
            PathBuf::from("/run/containerd/containerd.sock")
        );
        assert!(config.static_container_info.is_none());
        assert!(!config.use_containerd);
    }

    #[test]
    fn test_fetch_all_interval_validation() {
        let config = DiscoveryConfig::from_lookup(lookup_from(&[(
            "DOCKER_FETCH_ALL_INTERVAL",
            "86400",
        )]));
        assert_eq!(config.fetch_all_interval, Duration::from_secs(300));

        let config = DiscoveryConfig::from_lookup(lookup_from(&[
            ("DOCKER_FETCH_ALL_INTERVAL", "60"),
            ("DOCKER_FETCH_ALL_SUCCESS_TIMEOUT", "30"),
        ]));
        assert_eq!(config.fetch_all_interval, Duration::from_secs(300));
        assert_eq!(config.fetch_all_success_timeout, Duration::from_secs(6000));

        let config = DiscoveryConfig::from_lookup(lookup_from(&[
            ("DOCKER_FETCH_ALL_INTERVAL", "60"),
            ("DOCKER_FETCH_ALL_SUCCESS_TIMEOUT", "600"),
        ]));
        assert_eq!(config.fetch_all_interval, Duration::from_secs(60));
        assert_eq!(config.fetch_all_success_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_fetch_one_limit_must_be_positive() {
        let config = DiscoveryConfig::from_lookup(lookup_from(&[(
            "CONTAINER_FETCH_ONE_MAX_COUNT_PER_SECOND",
            "0",
        )]));
        assert_eq!(config.fetch_one_max_per_second, 200);

        let config = DiscoveryConfig::from_lookup(lookup_from(&[(
            "CONTAINER_FETCH_ONE_MAX_COUNT_PER_SECOND",
            "abc",
        )]));
        assert_eq!(config.fetch_one_max_per_second, 200);
    }

    #[test]
    fn test_cri_sync_interval_last_synonym_wins() {
        let config = DiscoveryConfig::from_lookup(lookup_from(&[
            ("CONTAINERD_LISTEN_LOOP_INTERVAL", "5"),
            ("ALIYUN_LOGTAIL_DOCKER_CONFIG_UPDATE_INTERVAL", "7"),
        ]));
        assert_eq!(config.cri_sync_interval, Duration::from_secs(7));
    }

    #[test]
    fn test_env_tags() {
        let config = DiscoveryConfig::from_lookup(lookup_from(&[
            ("ALIYUN_LOG_ENV_TAGS", "node_name|node_ip|missing"),
            ("node_name", "worker-1"),
            ("node_ip", "10.0.0.1"),
        ]));
        assert_eq!(
            config.env_tags,
            vec![
                ("node_name".to_owned(), "worker-1".to_owned()),
                ("node_ip".to_owned(), "10.0.0.1".to_owned()),
            ]
        );
    }
}
