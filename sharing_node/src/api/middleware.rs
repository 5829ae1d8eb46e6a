//! Middleware HTTP surface

use axum::{
    extract::{Path, State},
    http::Method,
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use super::errors::ApiError;
use crate::middleware::{CreateRequest, CreatedRequest, RequestService, StateUpdate};
use crate::storage::TrackedRequest;

#[derive(Clone)]
pub struct MiddlewareState {
    pub service: Arc<RequestService>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdateResponse {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub update: StateUpdate,
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": "sharing_middleware" }))
}

async fn create_request(
    State(state): State<MiddlewareState>,
    Json(body): Json<CreateRequest>,
) -> Result<Json<CreatedRequest>, ApiError> {
    Ok(Json(state.service.create(body).await?))
}

async fn update_request_state(
    State(state): State<MiddlewareState>,
    Path((settlement_ref, new_state)): Path<(String, String)>,
) -> Result<Json<StateUpdateResponse>, ApiError> {
    let update = state.service.update_state(&settlement_ref, &new_state).await?;
    Ok(Json(StateUpdateResponse {
        success: true,
        message: format!("Request state updated to {}", update.state),
        update,
    }))
}

async fn reconcile_request(
    State(state): State<MiddlewareState>,
    Path(settlement_ref): Path<String>,
) -> Result<Json<TrackedRequest>, ApiError> {
    Ok(Json(state.service.reconcile(&settlement_ref).await?))
}

async fn get_request(
    State(state): State<MiddlewareState>,
    Path(settlement_ref): Path<String>,
) -> Result<Json<TrackedRequest>, ApiError> {
    Ok(Json(state.service.get(&settlement_ref).await?))
}

async fn list_requests(
    State(state): State<MiddlewareState>,
) -> Result<Json<Vec<TrackedRequest>>, ApiError> {
    Ok(Json(state.service.list().await?))
}

pub fn create_router(state: MiddlewareState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/request", post(create_request))
        .route("/api/request/:ref", get(get_request))
        .route("/api/request/:ref/reconcile", post(reconcile_request))
        .route("/api/request/:ref/:state", patch(update_request_state))
        .route("/api/requests", get(list_requests))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PATCH])
                .allow_headers(Any),
        )
        .with_state(state)
}
