use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use regex::Regex;

use super::{Error, LabelMatcher, Result};
use crate::alarm::{self, AlarmType};
use crate::container::K8sInfo;

/// Selector over the pod identity and pod labels of a container.
#[derive(Debug, Clone)]
pub struct K8sFilter {
    namespace: Option<Regex>,
    pod: Option<Regex>,
    container: Option<Regex>,
    labels: LabelMatcher,
}

impl K8sFilter {
    /// Compiles a filter, returning `None` if every part is empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRegex`] if one of the regexes does not compile.
    pub fn new(
        namespace: &str,
        pod: &str,
        container: &str,
        include_labels: &HashMap<String, String>,
        exclude_labels: &HashMap<String, String>,
    ) -> Result<Option<Self>> {
        let filter = Self {
            namespace: compile("K8sNamespaceRegex", namespace)?,
            pod: compile("K8sPodRegex", pod)?,
            container: compile("K8sContainerRegex", container)?,
            labels: LabelMatcher::new(include_labels, exclude_labels)?,
        };
        if filter.namespace.is_none()
            && filter.pod.is_none()
            && filter.container.is_none()
            && filter.labels.is_empty()
        {
            return Ok(None);
        }
        Ok(Some(filter))
    }

    pub fn matches(&self, info: &K8sInfo, pod_labels: &HashMap<String, String>) -> bool {
        let is_match = |regex: &Option<Regex>, value: &str| {
            regex.as_ref().is_none_or(|regex| regex.is_match(value))
        };
        is_match(&self.namespace, &info.namespace)
            && is_match(&self.pod, &info.pod)
            && is_match(&self.container, &info.container_name)
            && self.labels.matches(pod_labels)
    }
}

impl Hash for K8sFilter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for regex in [&self.namespace, &self.pod, &self.container] {
            regex.as_ref().map(Regex::as_str).unwrap_or_default().hash(state);
            "$$$".hash(state);
        }
        self.labels.hash(state);
    }
}

fn compile(key: &str, pattern: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern).map(Some).map_err(|source| {
        alarm::raise(
            AlarmType::InvalidRegex,
            format_args!("invalid regex `{pattern}` for key `{key}`: {source}"),
        );
        Error::InvalidRegex {
            key: key.to_owned(),
            pattern: pattern.to_owned(),
            source: Box::new(source),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(namespace: &str, pod: &str, container: &str) -> K8sInfo {
        K8sInfo {
            namespace: namespace.to_owned(),
            pod: pod.to_owned(),
            container_name: container.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_filter_is_none() {
        let filter = K8sFilter::new("", "", "", &HashMap::new(), &HashMap::new()).unwrap();
        assert!(filter.is_none());
    }

    #[test]
    fn test_regex_and_labels() {
        let filter = K8sFilter::new(
            "^prod$",
            "^web-",
            "",
            &HashMap::from([("app".to_owned(), String::new())]),
            &HashMap::new(),
        )
        .unwrap()
        .unwrap();
        let labels = HashMap::from([("app".to_owned(), "web".to_owned())]);
        assert!(filter.matches(&info("prod", "web-0", "nginx"), &labels));
        assert!(!filter.matches(&info("dev", "web-0", "nginx"), &labels));
        assert!(!filter.matches(&info("prod", "api-0", "nginx"), &labels));
        assert!(!filter.matches(&info("prod", "web-0", "nginx"), &HashMap::new()));
    }

    #[test]
    fn test_invalid_regex() {
        let err = K8sFilter::new("(", "", "", &HashMap::new(), &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("K8sNamespaceRegex"));
    }

    #[test]
    fn test_invalid_regex_raises_alarm() {
        let before = alarm::raised_count(AlarmType::InvalidRegex);
        let err = K8sFilter::new("", "[web", "", &HashMap::new(), &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("K8sPodRegex"));
        assert!(alarm::raised_count(AlarmType::InvalidRegex) > before);
    }
}
