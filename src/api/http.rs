//! HTTP API Server
//!
//! The replication endpoints peers stream snapshots through, plus status,
//! volume and transfer queries and event submission.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Json, Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::cluster::{ContainerInfo, DirtyInfo, StateEntry};
use crate::config::ApiConfig;
use crate::context::NodeContext;
use crate::error::{Error, Result};
use crate::transfer::coordinator::{self, error_response, status_for};
use crate::transfer::proxy;
use crate::volume::{Event, Origin, Snapshot, Transition};

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    ctx: Arc<NodeContext>,
}

impl HttpServer {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            config: ctx.config.api.clone(),
            ctx,
        }
    }

    /// Create the router
    pub fn create_router(ctx: Arc<NodeContext>) -> Router {
        let cors_enabled = ctx.config.api.cors_enabled;
        let router = Router::new()
            // Replication
            .route(
                "/filesystems/:fs/:from/:to",
                get(handle_send).post(handle_receive),
            )
            // Volumes
            .route("/volumes/:fs", get(handle_volume).put(handle_create_volume))
            .route("/volumes/:fs/snapshots", get(handle_snapshots))
            .route("/volumes/:fs/events", post(handle_event))
            .route("/transfers/:id", get(handle_transfer))
            // Status and info
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .with_state(ctx)
            .layer(TraceLayer::new_for_http());

        if cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            shutdown.cancelled().await;
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.ctx));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub volumes: Vec<VolumeSummary>,
    pub mastered: usize,
}

/// One volume as seen from this node
#[derive(Debug, Serialize)]
pub struct VolumeSummary {
    pub filesystem: String,
    pub master: Option<String>,
    pub state: Option<StateEntry>,
}

/// Volume details
#[derive(Debug, Serialize)]
pub struct VolumeResponse {
    pub filesystem: String,
    pub master: Option<String>,
    pub states: HashMap<String, StateEntry>,
    pub snapshots: Vec<Snapshot>,
    pub dirty: Option<DirtyInfo>,
    pub containers: Option<ContainerInfo>,
    /// Snapshot this volume was cloned from, if any
    pub origin: Option<Origin>,
    /// Latest transition of this node's actor, if one is running
    pub transition: Option<Transition>,
}

// ============ Handlers ============

async fn handle_send(
    State(ctx): State<Arc<NodeContext>>,
    Path((filesystem, from, to)): Path<(String, String, String)>,
) -> Response {
    coordinator::serve_send(ctx, filesystem, from, to).await
}

async fn handle_receive(
    State(ctx): State<Arc<NodeContext>>,
    Path((filesystem, from, to)): Path<(String, String, String)>,
    body: Body,
) -> Response {
    coordinator::serve_receive(ctx, filesystem, from, to, body).await
}

async fn handle_volume(
    State(ctx): State<Arc<NodeContext>>,
    Path(filesystem): Path<String>,
) -> impl IntoResponse {
    Json(volume_response(&ctx, filesystem).await)
}

/// Start the volume's actor here, claiming it when no node masters it yet
async fn handle_create_volume(
    State(ctx): State<Arc<NodeContext>>,
    Path(filesystem): Path<String>,
) -> impl IntoResponse {
    if ctx.volumes.get(&filesystem).is_none() {
        tracing::info!("Creating volume {}", filesystem);
    }
    ctx.volume(&filesystem);
    Json(volume_response(&ctx, filesystem).await)
}

async fn volume_response(ctx: &Arc<NodeContext>, filesystem: String) -> VolumeResponse {
    let origin = match ctx.metadata.origin(&filesystem).await {
        Ok(origin) => origin,
        Err(e) => {
            tracing::warn!("Failed to read origin of {}: {}", filesystem, e);
            None
        }
    };
    VolumeResponse {
        master: ctx.cache.master_for(&filesystem),
        states: ctx.cache.states_for(&filesystem),
        snapshots: ctx.cache.master_snapshots(&filesystem),
        dirty: ctx.cache.dirty_for(&filesystem),
        containers: ctx.cache.containers_for(&filesystem),
        transition: ctx.volumes.get(&filesystem).map(|h| h.current()),
        origin,
        filesystem,
    }
}

/// Snapshots held by the master, answered here or by the master itself
async fn handle_snapshots(
    State(ctx): State<Arc<NodeContext>>,
    Path(filesystem): Path<String>,
) -> Response {
    match ctx.cache.master_for(&filesystem) {
        Some(master) if master != ctx.node_id => {
            let path = format!("/volumes/{}/snapshots", filesystem);
            proxy::forward(&ctx, &filesystem, Method::GET, &path, None).await
        }
        _ => match ctx.metadata.snapshots(&filesystem).await {
            Ok(snapshots) => Json(snapshots).into_response(),
            Err(e) => error_response(status_for(&e), &e),
        },
    }
}

async fn handle_event(
    State(ctx): State<Arc<NodeContext>>,
    Path(filesystem): Path<String>,
    Json(event): Json<Event>,
) -> Response {
    tracing::debug!("Event {} submitted for {}", event.name, filesystem);
    let handle = match ctx.volumes.get(&filesystem) {
        Some(handle) => handle,
        None if ctx.cache.master_for(&filesystem).is_some() => ctx.volume(&filesystem),
        None => {
            let e = Error::UnknownVolume(filesystem);
            return error_response(status_for(&e), &e);
        }
    };
    match handle.submit(event).await {
        Ok(answer) => Json(answer).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

async fn handle_transfer(
    State(ctx): State<Arc<NodeContext>>,
    Path(id): Path<Uuid>,
) -> Response {
    match ctx.transfers.get(&id) {
        Some(result) => Json(result).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            &Error::Transfer(format!("unknown transfer {}", id)),
        ),
    }
}

async fn handle_status(State(ctx): State<Arc<NodeContext>>) -> impl IntoResponse {
    let volumes: Vec<VolumeSummary> = ctx
        .cache
        .known_volumes()
        .into_iter()
        .map(|filesystem| VolumeSummary {
            master: ctx.cache.master_for(&filesystem),
            state: ctx.cache.current_state(&filesystem).ok(),
            filesystem,
        })
        .collect();

    Json(StatusResponse {
        node_id: ctx.node_id.clone(),
        mastered: ctx.cache.mastered_volumes().len(),
        volumes,
    })
}

async fn handle_health(State(ctx): State<Arc<NodeContext>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: ctx.node_id.clone(),
    })
}
