//! Container stdout core: discovers containers across Docker, CRI and static runtimes and tails
//! their stdout logs into logical records.
//!
//! The [`discovery`] controller keeps the [`registry`] of containers current; every stdout
//! pipeline selects containers with its [`filter`] and runs one reader per match.
use std::path::PathBuf;
use std::sync::Arc;

use config::{DiscoveryConfig, PipelineConfig};
use discovery::Discovery;
use error::ResultOkLogExt;
use metrics::MetricsRegistry;
use registry::{Registry, RegistryTimeouts};
use stdout::{ChannelCollector, ServiceDeps, StdoutService};

pub mod alarm;
pub mod api;
pub mod backoff;
pub mod checkpoint;
pub mod config;
pub mod container;
pub mod discovery;
pub mod environment;
pub mod error;
pub mod filter;
pub mod fsutil;
pub mod grpc;
pub mod metrics;
pub mod registry;
pub mod shutdown;
pub mod stdout;
pub mod task;

pub mod runtime {
    pub mod v1alpha2 {
        tonic::include_proto!("runtime.v1alpha2");
    }
}

const PIPELINES_CONFIG_ENV: &str = "STDOUT_PIPELINES_CONFIG";
const CHECKPOINT_DIR_ENV: &str = "STDOUT_CHECKPOINT_DIR";
const DEFAULT_CHECKPOINT_DIR: &str = "/var/lib/container-stdout/checkpoints";
const API_LISTEN_ADDR_ENV: &str = "API_LISTEN_ADDR";
const DISCOVERY_INIT_TRY_TIMES: usize = 3;

/// Pipeline used when no pipelines file is configured: every container, default settings.
fn default_pipeline() -> PipelineConfig {
    PipelineConfig {
        project: String::new(),
        logstore: String::new(),
        config_name: "default".to_owned(),
        input: Default::default(),
    }
}

/// Runs discovery, the stdout pipelines and the API server until `SIGINT`.
///
/// Collected records are written to stdout as JSON lines.
///
/// # Errors
///
/// Possible errors include:
/// - No container runtime adapter could be initialized.
/// - The static container file is configured but unreadable.
/// - The pipelines file cannot be read or decoded.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let runtime_env = environment::detect_runtime_environment();
    log::info!("runtime environment: {runtime_env:?}");
    let config = Arc::new(DiscoveryConfig::from_env());
    let host_paths = environment::HostPaths::detect(runtime_env, config.mount_path.clone());
    let registry = Arc::new(Registry::new(RegistryTimeouts::from(config.as_ref())));
    let (trigger, shutdown) = shutdown::channel();

    let discovery = Arc::new(
        Discovery::new(Arc::clone(&registry), Arc::clone(&config), host_paths.clone()).await,
    );
    discovery.init(DISCOVERY_INIT_TRY_TIMES).await?;
    let mut handles = discovery.start(&shutdown);
    log::debug!("started container discovery");

    let pipelines = match std::env::var_os(PIPELINES_CONFIG_ENV) {
        Some(path) => config::load_pipelines(path)?,
        None => vec![default_pipeline()],
    };
    let checkpoint_root = std::env::var_os(CHECKPOINT_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_DIR));
    let metrics = Arc::new(MetricsRegistry::default());
    let (collector, mut records) = ChannelCollector::new();
    let deps = ServiceDeps {
        registry,
        host_paths,
        metrics: Arc::clone(&metrics),
        collector: Arc::new(collector),
        checkpoint_root,
    };
    for pipeline in &pipelines {
        let Some(service) = StdoutService::new(pipeline, deps.clone())
            .ok_log_with(format_args!("skipping stdout pipeline {}", pipeline.config_name))
        else {
            continue;
        };
        log::info!("starting stdout pipeline {}", service.context());
        let name = format!("stdout {}", service.context());
        handles.push(task::spawn_guarded(name, service.run(shutdown.clone())));
    }
    drop(deps);

    handles.push(task::spawn_guarded("record printer", async move {
        while let Some((context, record)) = records.recv().await {
            let fields: serde_json::Map<String, serde_json::Value> = record
                .fields
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect();
            let line = serde_json::json!({ "context": context, "fields": fields });
            println!("{line}");
        }
    }));

    {
        let addr = std::env::var(API_LISTEN_ADDR_ENV)
            .unwrap_or_else(|_| api::DEFAULT_LISTEN_ADDR.to_owned());
        let server = api::APIServer::new(api::ApiState {
            discovery: Arc::clone(&discovery),
            metrics,
        });
        let shutdown = shutdown.clone();
        handles.push(task::spawn_guarded("api server", async move {
            if let Err(err) = server.listen(addr, shutdown).await {
                log::error!("API server failed: {err}");
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    log::info!("interrupted, shutting down");
    trigger.trigger();
    for handle in handles {
        if let Err(err) = handle.await {
            log::error!("task failed during shutdown: {err}");
        }
    }
    log::info!("shut down");
    Ok(())
}
