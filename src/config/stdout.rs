use std::collections::HashMap;
use std::path::Path;

use super::{Error, Result};

const MIN_MAX_LOG_SIZE: usize = 1024;
const MAX_MAX_LOG_SIZE: usize = 20 * 1024 * 1024;
const MIN_CLOSE_UNCHANGED_SEC: u64 = 10;

/// Settings of one stdout collection pipeline.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StdoutConfig {
    pub flush_interval_ms: u64,
    pub save_check_point_sec: u64,
    pub read_interval_ms: u64,
    pub stdout: bool,
    pub stderr: bool,
    pub begin_line_regex: Option<String>,
    pub begin_line_timeout_ms: u64,
    pub begin_line_check_length: usize,
    pub max_log_size: usize,
    pub close_un_changed_sec: u64,
    pub start_log_max_offset: u64,
    pub max_read_block_size: usize,
    pub include_label: HashMap<String, String>,
    pub exclude_label: HashMap<String, String>,
    pub include_env: HashMap<String, String>,
    pub exclude_env: HashMap<String, String>,
    pub include_container_label: HashMap<String, String>,
    pub exclude_container_label: HashMap<String, String>,
    pub include_k8s_label: HashMap<String, String>,
    pub exclude_k8s_label: HashMap<String, String>,
    pub k8s_namespace_regex: String,
    pub k8s_pod_regex: String,
    pub k8s_container_regex: String,
    /// Env var name -> tag name.
    pub external_env_tag: HashMap<String, String>,
    /// K8s label key -> tag name.
    pub external_k8s_label_tag: HashMap<String, String>,
}

impl Default for StdoutConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 3000,
            save_check_point_sec: 60,
            read_interval_ms: 1000,
            stdout: true,
            stderr: true,
            begin_line_regex: None,
            begin_line_timeout_ms: 3000,
            begin_line_check_length: 10 * 1024,
            max_log_size: 512 * 1024,
            close_un_changed_sec: 60,
            start_log_max_offset: 128 * 1024,
            max_read_block_size: 512 * 1024,
            include_label: HashMap::new(),
            exclude_label: HashMap::new(),
            include_env: HashMap::new(),
            exclude_env: HashMap::new(),
            include_container_label: HashMap::new(),
            exclude_container_label: HashMap::new(),
            include_k8s_label: HashMap::new(),
            exclude_k8s_label: HashMap::new(),
            k8s_namespace_regex: String::new(),
            k8s_pod_regex: String::new(),
            k8s_container_regex: String::new(),
            external_env_tag: HashMap::new(),
            external_k8s_label_tag: HashMap::new(),
        }
    }
}

impl StdoutConfig {
    /// Clamps out-of-range values and folds the legacy label maps into the container label maps.
    pub fn normalized(mut self) -> Self {
        self.max_log_size = self.max_log_size.clamp(MIN_MAX_LOG_SIZE, MAX_MAX_LOG_SIZE);
        self.close_un_changed_sec = self.close_un_changed_sec.max(MIN_CLOSE_UNCHANGED_SEC);
        if self.max_read_block_size == 0 {
            self.max_read_block_size = Self::default().max_read_block_size;
        }
        if self.read_interval_ms == 0 {
            self.read_interval_ms = Self::default().read_interval_ms;
        }
        if self.flush_interval_ms == 0 {
            self.flush_interval_ms = Self::default().flush_interval_ms;
        }
        if self.save_check_point_sec == 0 {
            self.save_check_point_sec = Self::default().save_check_point_sec;
        }
        if self
            .begin_line_regex
            .as_deref()
            .is_some_and(|r| r.trim().is_empty())
        {
            self.begin_line_regex = None;
        }
        for (k, v) in self.include_label.drain() {
            self.include_container_label.entry(k).or_insert(v);
        }
        for (k, v) in self.exclude_label.drain() {
            self.exclude_container_label.entry(k).or_insert(v);
        }
        self
    }
}

/// One pipeline entry of the pipelines file.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PipelineConfig {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub logstore: String,
    pub config_name: String,
    #[serde(default)]
    pub input: StdoutConfig,
}

/// Loads and normalizes the pipelines file at `path`.
///
/// # Errors
///
/// Returns [`Error::ReadFile`] or [`Error::Parse`] if the file cannot be read or decoded, and
/// [`Error::InvalidPipeline`] for an empty or duplicate config name.
pub fn load_pipelines(path: impl AsRef<Path>) -> Result<Vec<PipelineConfig>> {
    let path = path.as_ref();
    let raw = std::fs::read(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    let mut pipelines: Vec<PipelineConfig> =
        serde_json::from_slice(&raw).map_err(|source| Error::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let mut seen = std::collections::HashSet::new();
    for pipeline in pipelines.iter_mut() {
        if pipeline.config_name.trim().is_empty() {
            return Err(Error::InvalidPipeline {
                config: pipeline.config_name.clone(),
                reason: "config name must not be empty".to_owned(),
            });
        }
        if !seen.insert(pipeline.config_name.clone()) {
            return Err(Error::InvalidPipeline {
                config: pipeline.config_name.clone(),
                reason: "duplicate config name".to_owned(),
            });
        }
        pipeline.input = std::mem::take(&mut pipeline.input).normalized();
    }

    Ok(pipelines)
}
