//! HTTP server implementation using Axum.

use crate::error::Error;
use crate::lifecycle::{DeleteOutcome, DeleteReason};
use crate::record::ContainerRecord;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        Method,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

// Request/Response types
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CreateContainerRequest {
    ttl_seconds: Option<u64>,
    port_count: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateContainerResponse {
    id: String,
    ports: Vec<u16>,
    expires_at: DateTime<Utc>,
}

/// Build the router. Everything except `/health` sits behind the auth check.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION]);

    let api = Router::new()
        .route("/create-container", post(create_container))
        .route("/delete-container/:id", delete(delete_container))
        .route("/containers", get(list_containers))
        .route("/containers/:id", get(get_container))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        // Health check
        .route("/health", get(health))
        .merge(api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn run_server<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn require_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if state.auth.permits(header) {
        next.run(req).await
    } else {
        warn!(method = %req.method(), path = %req.uri().path(), "Unauthorized request");
        Error::Unauthorized.into_response()
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn create_container(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CreateContainerResponse>, Error> {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        CreateContainerRequest::default()
    } else {
        serde_json::from_slice::<CreateContainerRequest>(&body)
            .map_err(|e| Error::Validation(e.to_string()))?
    };

    let config = state.manager.config();
    let ttl = req
        .ttl_seconds
        .map(Duration::from_secs)
        .unwrap_or(config.default_ttl);
    let port_count = req.port_count.unwrap_or(config.default_port_count);
    info!("POST /create-container - ttl={:?} ports={}", ttl, port_count);

    let record = state.manager.create_container(ttl, port_count).await?;
    Ok(Json(CreateContainerResponse {
        id: record.id,
        ports: record.ports,
        expires_at: record.expires_at,
    }))
}

async fn delete_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let message = match state
        .manager
        .delete_container(&id, DeleteReason::Manual)
        .await?
    {
        DeleteOutcome::Deleted => format!("Container {} deleted successfully", id),
        DeleteOutcome::NoOp => format!("Container {} is already being deleted", id),
    };
    Ok(Json(json!({ "message": message })))
}

async fn list_containers(
    State(state): State<AppState>,
) -> Result<Json<Vec<ContainerRecord>>, Error> {
    Ok(Json(state.manager.list_active()?))
}

async fn get_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ContainerRecord>, Error> {
    Ok(Json(state.manager.get(&id)?))
}
