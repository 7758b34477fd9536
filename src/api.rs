//! Read only HTTP view of the registry and the metrics.
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::ToSocketAddrs;

use crate::discovery::Discovery;
use crate::metrics::{MetricSample, MetricsRegistry};
use crate::shutdown::Shutdown;

mod models;

pub use models::{ContainerSummary, ContainerView, K8sView};

/// Default address of the API server.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

#[derive(Clone)]
pub struct ApiState {
    pub discovery: Arc<Discovery>,
    pub metrics: Arc<MetricsRegistry>,
}

async fn list_containers(state: State<ApiState>) -> Json<Vec<ContainerSummary>> {
    let mut containers = Vec::with_capacity(state.discovery.registry().len());
    state
        .discovery
        .registry()
        .for_each(|detail| containers.push(ContainerSummary::from(detail.as_ref())));
    containers.sort_by(|a, b| a.id.cmp(&b.id));
    Json(containers)
}

async fn get_container(state: State<ApiState>, Path(id): Path<String>) -> Response {
    match state.discovery.container_meta(&id).await {
        Some(detail) => Json(ContainerView::from(detail.as_ref())).into_response(),
        None => (StatusCode::NOT_FOUND, format!("no metadata for container {id}")).into_response(),
    }
}

async fn export_metrics(state: State<ApiState>) -> Json<Vec<MetricSample>> {
    Json(state.metrics.snapshot())
}

pub struct APIServer {
    router: axum::Router,
}

impl APIServer {
    pub fn new(state: ApiState) -> Self {
        let router = axum::Router::new()
            .route("/containers", get(list_containers))
            .route("/containers/{id}", get(get_container))
            .route("/metrics", get(export_metrics))
            .with_state(state);
        Self { router }
    }

    /// Serves until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if `addr` cannot be bound.
    pub async fn listen(self, addr: impl ToSocketAddrs, mut shutdown: Shutdown) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!("API listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await
    }
}
