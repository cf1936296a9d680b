//! HTTP API Server
//!
//! REST API on the monitor for state queries and operator commands; this is
//! what `stewardctl` talks to. Keepers use the framed TCP protocol instead.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::monitor::orchestrator::Orchestrator;

/// Shared application state
pub struct AppState {
    /// Assignment engine
    pub orchestrator: Arc<Orchestrator>,
}

/// HTTP API server
pub struct HttpServer {
    bind_address: String,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(bind_address: String, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            bind_address,
            state: Arc::new(AppState { orchestrator }),
        }
    }

    /// Create the router
    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            // Status and info
            .route("/health", get(handle_health))
            .route("/state", get(handle_state))
            .route("/formations/:formation/settings", get(handle_get_settings))
            // Operator commands
            .route("/formations/:formation/settings", post(handle_set_settings))
            .route("/formations/:formation/secondary", post(handle_set_secondary))
            .route(
                "/formations/:formation/groups/:group/failover",
                post(handle_failover),
            )
            .route("/nodes/:node_id/settings", post(handle_node_settings))
            .route("/nodes/:node_id/maintenance", post(handle_maintenance))
            .route("/nodes/:node_id", delete(handle_drop_node))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

#[derive(Debug, Deserialize)]
struct StateQuery {
    formation: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GroupSettingsRequest {
    pub number_sync_standbys: i32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SecondaryRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NodeSettingsRequest {
    pub candidate_priority: Option<i32>,
    pub replication_quorum: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MaintenanceRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
struct AckResponse {
    success: bool,
    message: String,
}

fn ack() -> Json<AckResponse> {
    Json(AckResponse {
        success: true,
        message: String::new(),
    })
}

/// Map a monitor error to an HTTP status + body
fn error_response(e: Error) -> (StatusCode, Json<AckResponse>) {
    let status = match &e {
        Error::NodeNotFound(_) | Error::Monitor(_) => StatusCode::NOT_FOUND,
        Error::InvalidSetting(_) | Error::NameCollision(_) | Error::GroupFull { .. } => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(AckResponse {
            success: false,
            message: e.to_string(),
        }),
    )
}

// ============ Handlers ============

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_state(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StateQuery>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .current_state(query.formation.as_deref())
        .await
    {
        Ok(nodes) => Json(serde_json::json!({ "nodes": nodes })).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_get_settings(
    State(state): State<Arc<AppState>>,
    Path(formation): Path<String>,
) -> impl IntoResponse {
    let store = state.orchestrator.store();
    match store.get_formation(&formation).await {
        Ok(Some(record)) => Json(serde_json::json!({
            "formation": record.name,
            "kind": record.kind,
            "dbname": record.dbname,
            "has_secondary": record.has_secondary,
            "number_sync_standbys": record.number_sync_standbys,
        }))
        .into_response(),
        Ok(None) => error_response(Error::Monitor(format!("formation {formation} not found")))
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_set_settings(
    State(state): State<Arc<AppState>>,
    Path(formation): Path<String>,
    Json(request): Json<GroupSettingsRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .set_group_settings(&formation, request.number_sync_standbys)
        .await
    {
        Ok(()) => ack().into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_set_secondary(
    State(state): State<Arc<AppState>>,
    Path(formation): Path<String>,
    Json(request): Json<SecondaryRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .store()
        .set_has_secondary(&formation, request.enabled)
        .await
    {
        Ok(()) => ack().into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_failover(
    State(state): State<Arc<AppState>>,
    Path((formation, group)): Path<(String, i32)>,
) -> impl IntoResponse {
    match state.orchestrator.perform_failover(&formation, group).await {
        Ok(()) => ack().into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_node_settings(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<i64>,
    Json(request): Json<NodeSettingsRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .set_node_settings(node_id, request.candidate_priority, request.replication_quorum)
        .await
    {
        Ok(()) => ack().into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_maintenance(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<i64>,
    Json(request): Json<MaintenanceRequest>,
) -> impl IntoResponse {
    let result = if request.enabled {
        state.orchestrator.start_maintenance(node_id).await
    } else {
        state.orchestrator.stop_maintenance(node_id).await
    };
    match result {
        Ok(()) => ack().into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn handle_drop_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<i64>,
) -> impl IntoResponse {
    match state.orchestrator.remove_node(node_id).await {
        Ok(()) => ack().into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::orchestrator::OrchestratorConfig;
    use crate::monitor::store::MonitorStore;

    #[tokio::test]
    async fn test_router_builds() {
        let store = Arc::new(MonitorStore::in_memory().unwrap());
        let orch = Arc::new(Orchestrator::new(store, OrchestratorConfig::default()));
        let state = Arc::new(AppState { orchestrator: orch });
        let _router = HttpServer::create_router(state);
    }
}
