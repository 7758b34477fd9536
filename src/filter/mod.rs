//! Container selection.
//!
//! A [`ContainerFilter`] is compiled once per pipeline from its configuration and evaluated
//! against registry records. Results are memoized on the record, keyed by the filter's hash, until
//! the record's pod labels change.
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

mod error;
mod k8s;
mod label;

pub use error::{Error, Result};
pub use k8s::K8sFilter;
pub use label::LabelMatcher;

use crate::config::StdoutConfig;
use crate::container::{ContainerDetail, K8sInfo};

/// Compiled predicate over container labels, env variables and pod identity.
#[derive(Debug, Clone)]
pub struct ContainerFilter {
    container_labels: LabelMatcher,
    env: LabelMatcher,
    k8s: Option<K8sFilter>,
    hash: u64,
}

impl ContainerFilter {
    /// Compiles the filter described by a pipeline configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRegex`] naming the offending key if any regex does not compile.
    pub fn from_config(config: &StdoutConfig) -> Result<Self> {
        Ok(Self::new(
            LabelMatcher::new(
                &config.include_container_label,
                &config.exclude_container_label,
            )?,
            LabelMatcher::new(&config.include_env, &config.exclude_env)?,
            K8sFilter::new(
                &config.k8s_namespace_regex,
                &config.k8s_pod_regex,
                &config.k8s_container_regex,
                &config.include_k8s_label,
                &config.exclude_k8s_label,
            )?,
        ))
    }

    pub fn new(
        container_labels: LabelMatcher,
        env: LabelMatcher,
        k8s: Option<K8sFilter>,
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        container_labels.hash(&mut hasher);
        "$$$".hash(&mut hasher);
        env.hash(&mut hasher);
        "$$$".hash(&mut hasher);
        k8s.hash(&mut hasher);
        Self {
            container_labels,
            env,
            k8s,
            hash: hasher.finish(),
        }
    }

    /// Identifies the filter in per-record memo tables.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Evaluates the filter, reusing the record's memoized result when there is one.
    ///
    /// Pod sandbox containers never match.
    pub fn matches(&self, detail: &ContainerDetail) -> bool {
        if detail.is_k8s_sandbox() {
            return false;
        }
        detail.cached_match(self.hash, |detail| self.evaluate(detail))
    }

    fn evaluate(&self, detail: &ContainerDetail) -> bool {
        if !self.container_labels.matches(&detail.labels) {
            return false;
        }
        if !self.env.is_empty() && !self.env.matches(&detail.env_map()) {
            return false;
        }
        match &self.k8s {
            None => true,
            Some(filter) => {
                let empty = K8sInfo::default();
                filter.matches(
                    detail.k8s.as_ref().unwrap_or(&empty),
                    &detail.k8s_labels(),
                )
            }
        }
    }
}

/// Matches every container except pod sandboxes.
impl Default for ContainerFilter {
    fn default() -> Self {
        let mut hasher = DefaultHasher::new();
        "match-all".hash(&mut hasher);
        Self {
            container_labels: LabelMatcher::default(),
            env: LabelMatcher::default(),
            k8s: None,
            hash: hasher.finish(),
        }
    }
}
