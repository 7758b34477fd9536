use std::collections::{BTreeMap, HashMap};

/// Env variable that marks a container as configuring the agent itself.
pub(super) const SELF_ENV_CONFIG_KEY: &str = "ALICLOUD_LOG_DOCKER_ENV_CONFIG_SELF";

const TAGS_ITEM: &str = "tags";

/// A named collection config declared through container env variables, e.g.
/// `aliyun_logs_catalina=stdout` and `aliyun_logs_catalina_tags=app=tomcat`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct EnvConfig {
    pub name: String,
    /// Item name -> value; the empty item name holds the value of the bare config variable.
    pub items: BTreeMap<String, String>,
}

/// Result of scanning a container's env for env configs.
#[derive(Debug, Default, PartialEq, Eq)]
pub(super) struct EnvConfigs {
    pub configs: BTreeMap<String, EnvConfig>,
    /// Tags declared through `<prefix><name>_tags` items.
    pub tags: Vec<(String, String)>,
}

/// Collects every env config whose variable starts with `prefix`.
///
/// Tags that are already part of the agent's own env tags are not repeated. A container that sets
/// [`SELF_ENV_CONFIG_KEY`] has no env configs.
pub(super) fn find_all(env: &[String], prefix: &str, env_tags: &[(String, String)]) -> EnvConfigs {
    let mut found = EnvConfigs::default();
    if prefix.is_empty() {
        return found;
    }
    let mut self_config = false;
    for item in env {
        let Some((key, value)) = item.split_once('=') else {
            continue;
        };
        if key == SELF_ENV_CONFIG_KEY && (value == "true" || value == "TRUE") {
            self_config = true;
            continue;
        }
        let Some(env_key) = key.strip_prefix(prefix) else {
            continue;
        };
        let (name, item_key) = match env_key.rfind('_') {
            Some(idx) if idx + 1 == env_key.len() => continue,
            Some(idx) => (&env_key[..idx], &env_key[idx + 1..]),
            None => (env_key, ""),
        };
        if name.is_empty() {
            continue;
        }
        let config = found
            .configs
            .entry(name.to_owned())
            .or_insert_with(|| EnvConfig {
                name: name.to_owned(),
                items: BTreeMap::new(),
            });
        config.items.insert(item_key.to_owned(), value.to_owned());
        if item_key == TAGS_ITEM {
            let (tag_key, tag_value) = value.split_once('=').unwrap_or((value, value));
            if env_tags.iter().any(|(k, v)| k == tag_key && v == tag_value) {
                log::info!("skip env config tag `{tag_key}`, it is one of the agent's env tags");
            } else {
                found.tags.push((tag_key.to_owned(), tag_value.to_owned()));
            }
        }
    }
    if self_config {
        log::debug!("container carries {SELF_ENV_CONFIG_KEY}, ignoring its env configs");
        found.configs.clear();
    }
    found
}

/// Splits `KEY=VALUE` items; an item without `=` maps its key to an empty value.
pub(super) fn env_map(env: &[String]) -> HashMap<String, String> {
    env.iter()
        .map(|item| match item.split_once('=') {
            Some((k, v)) => (k.to_owned(), v.to_owned()),
            None => (item.clone(), String::new()),
        })
        .collect()
}
