//! Error classification shared by every component.
//!
//! Each module keeps its own `thiserror` enum; `ErrorClass` is the common
//! taxonomy the HTTP surfaces and the callers branch on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure category of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input, rejected before any state change
    Validation,
    /// Wrong caller, no state change
    Authorization,
    /// Operation invalid for the current status, no state change
    StateConflict,
    /// Payment or refund rejected, operation fully aborted
    Transfer,
    /// Bridge exhausted its retries; the ledger state stands
    SyncDelivery,
    /// An orchestration step failed; the record stays Accepted
    DownstreamConfig,
    /// Unknown id or reference
    NotFound,
    /// A collaborator (the ledger node) is unreachable or answered with an error
    Upstream,
    /// Local fault, such as a broken store backend
    Internal,
}

impl ErrorClass {
    /// HTTP status code used when the error crosses an API boundary
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorClass::Validation => 400,
            ErrorClass::Authorization => 403,
            ErrorClass::StateConflict => 409,
            ErrorClass::Transfer => 502,
            ErrorClass::SyncDelivery => 502,
            ErrorClass::DownstreamConfig => 502,
            ErrorClass::NotFound => 404,
            ErrorClass::Upstream => 502,
            ErrorClass::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Validation => "ValidationError",
            ErrorClass::Authorization => "AuthorizationError",
            ErrorClass::StateConflict => "StateConflictError",
            ErrorClass::Transfer => "TransferError",
            ErrorClass::SyncDelivery => "SyncDeliveryError",
            ErrorClass::DownstreamConfig => "DownstreamConfigError",
            ErrorClass::NotFound => "NotFound",
            ErrorClass::Upstream => "UpstreamError",
            ErrorClass::Internal => "InternalError",
        };
        write!(f, "{}", name)
    }
}
