//! API error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErrorClass;
use crate::ledger::LedgerError;
use crate::middleware::ServiceError;
use crate::orchestrator::OrchestratorError;
use crate::storage::StorageError;

/// Error body returned by both HTTP surfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u16,
    /// Taxonomy name, e.g. `StateConflictError`
    pub error: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub timestamp: u64,
}

impl ApiError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            code: class.http_status(),
            error: class.to_string(),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().timestamp() as u64,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(ErrorClass::Validation, message)
    }

    /// Missing or unknown credential
    pub fn unauthorized(message: &str) -> Self {
        Self {
            code: 401,
            ..Self::new(ErrorClass::Authorization, message)
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(ErrorClass::NotFound, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "API Error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        let details = match &e {
            LedgerError::InsufficientPayment { required, provided } => Some(serde_json::json!({
                "required": ethers::utils::format_ether(*required),
                "provided": ethers::utils::format_ether(*provided),
            })),
            LedgerError::InvalidState { id, status } => Some(serde_json::json!({
                "id": id,
                "status": status.label(),
            })),
            _ => None,
        };
        let error = ApiError::new(e.class(), e.to_string());
        match details {
            Some(details) => error.with_details(details),
            None => error,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::new(e.class(), e.to_string())
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        let error = ApiError::new(e.class(), e.to_string());
        match e.step() {
            Some(step) => error.with_details(serde_json::json!({ "step": step.to_string() })),
            None => error,
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Orchestrator(e) => e.into(),
            other => ApiError::new(other.class(), other.to_string()),
        }
    }
}
