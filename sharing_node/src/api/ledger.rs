//! Ledger node HTTP surface.
//!
//! Reads are open; writes carry `Authorization: Bearer <credential>` and act
//! as the identity the credential maps to.

use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, Method},
    routing::{get, post},
    Json, Router,
};
use ethers::types::{Address, H256, U256};
use ethers::utils::{format_ether, parse_ether};
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use super::errors::ApiError;
use crate::ledger::{
    check_contract_address, CredentialRegistry, EscrowRequest, NewRequest, RequestLedger,
    RequestStatus, StatusChange,
};

#[derive(Clone)]
pub struct LedgerState {
    pub ledger: Arc<dyn RequestLedger>,
    pub credentials: Arc<CredentialRegistry>,
}

/// Request as shown to the panels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestView {
    pub id: u64,
    pub requester: Address,
    pub num_users: u32,
    pub duration_minutes: u32,
    pub order_digest: H256,
    pub status: String,
    /// RFC 3339
    pub created_at: String,
    /// In ether
    pub amount_escrowed: String,
    pub settlement_ref: String,
}

impl From<EscrowRequest> for RequestView {
    fn from(request: EscrowRequest) -> Self {
        Self {
            id: request.id,
            requester: request.requester,
            num_users: request.num_users,
            duration_minutes: request.duration_minutes,
            order_digest: request.order_digest,
            status: request.status.label().to_string(),
            created_at: request.created_at.to_rfc3339(),
            amount_escrowed: format_ether(request.amount_escrowed),
            settlement_ref: request.settlement_ref,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeView {
    pub success: bool,
    pub id: u64,
    pub settlement_ref: String,
    pub status: String,
    pub payee: Address,
    pub amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<StatusChange> for StatusChangeView {
    fn from(change: StatusChange) -> Self {
        Self {
            success: true,
            id: change.id,
            settlement_ref: change.settlement_ref,
            status: change.status.label().to_string(),
            payee: change.payee,
            amount: format_ether(change.amount),
            reason: change.reason,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBody {
    pub contract_address: String,
    pub num_users: u32,
    pub duration_mins: u32,
    #[serde(default)]
    pub order_digest: H256,
    /// Payment in ether; the quote when omitted
    pub payment: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    pub success: bool,
    pub request_id: u64,
    pub settlement_ref: String,
    pub amount_escrowed: String,
    pub required_payment: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteQuery {
    pub num_users: u32,
    pub duration_mins: u32,
}

fn caller(state: &LedgerState, headers: &HeaderMap) -> Result<Address, ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing Authorization header"))?;
    state
        .credentials
        .resolve_header(header)
        .ok_or_else(|| ApiError::unauthorized("Unknown credential"))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": "ledger_node" }))
}

async fn create_request(
    State(state): State<LedgerState>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Result<Json<CreateResponse>, ApiError> {
    let requester = caller(&state, &headers)?;
    check_contract_address(&body.contract_address, state.ledger.address())?;

    let required = state.ledger.required_payment(body.num_users, body.duration_mins)?;
    let payment: U256 = match body.payment.as_deref() {
        Some(ether) => parse_ether(ether).map_err(|e| {
            ApiError::bad_request(&format!("Invalid payment amount {}: {}", ether, e))
        })?,
        None => required,
    };

    let request = state
        .ledger
        .create_request(
            NewRequest {
                requester,
                num_users: body.num_users,
                duration_minutes: body.duration_mins,
                order_digest: body.order_digest,
            },
            payment,
        )
        .await?;

    Ok(Json(CreateResponse {
        success: true,
        request_id: request.id,
        settlement_ref: request.settlement_ref,
        amount_escrowed: format_ether(request.amount_escrowed),
        required_payment: format_ether(required),
    }))
}

async fn confirm_request(
    State(state): State<LedgerState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<Json<StatusChangeView>, ApiError> {
    let caller = caller(&state, &headers)?;
    let change = state.ledger.confirm_request(caller, id).await?;
    Ok(Json(change.into()))
}

async fn cancel_request(
    State(state): State<LedgerState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    body: Option<Json<CancelBody>>,
) -> Result<Json<StatusChangeView>, ApiError> {
    let caller = caller(&state, &headers)?;
    let reason = body.map(|Json(body)| body.reason).unwrap_or_default();
    let change = state.ledger.cancel_request(caller, id, &reason).await?;
    Ok(Json(change.into()))
}

async fn get_request(
    State(state): State<LedgerState>,
    Path(id): Path<u64>,
) -> Result<Json<RequestView>, ApiError> {
    Ok(Json(state.ledger.get_request(id).await?.into()))
}

async fn list_requests(
    State(state): State<LedgerState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Vec<RequestView>>, ApiError> {
    let statuses = match query.status.as_deref() {
        Some(status) => vec![status.parse::<RequestStatus>()?],
        None => RequestStatus::all().to_vec(),
    };

    let mut requests = Vec::new();
    for status in statuses {
        requests.extend(state.ledger.list_by_status(status).await?);
    }
    requests.sort_by_key(|request| request.id);
    Ok(Json(requests.into_iter().map(RequestView::from).collect()))
}

async fn quote(
    State(state): State<LedgerState>,
    Query(query): Query<QuoteQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let required = state.ledger.required_payment(query.num_users, query.duration_mins)?;
    Ok(Json(serde_json::json!({
        "numUsers": query.num_users,
        "durationMins": query.duration_mins,
        "requiredPayment": format_ether(required),
        "requiredPaymentWei": required.to_string(),
    })))
}

pub fn create_router(state: LedgerState) -> Router {
    info!("Ledger surface for contract {:?}", state.ledger.address());
    Router::new()
        .route("/health", get(health_check))
        .route("/api/create", post(create_request))
        .route("/api/quote", get(quote))
        .route("/api/requests", get(list_requests))
        .route("/api/requests/:id", get(get_request))
        .route("/api/requests/:id/confirm", post(confirm_request))
        .route("/api/requests/:id/cancel", post(cancel_request))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any),
        )
        .with_state(state)
}
