//! Request Store
//!
//! Off-chain mirror of every request, keyed by an internal id and by the
//! settlement reference the ledger hands out. State moves only forward along
//!
//! ```text
//! Created ─▶ Pending ─▶ Accepted ─▶ Completed ─▶ Expired
//!    │          │                       └──▶ RestoreFailed ─▶ Expired
//!    └──────────┴──▶ Rejected
//! ```
//!
//! A write that would move a record backwards is ignored as stale, so a late
//! or duplicated delivery can never undo a more advanced state.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryRequestStore;
pub use sled_store::SledRequestStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::agent::ManagedEndpoint;
use crate::error::ErrorClass;

/// Mirror-side state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    Created,
    Pending,
    Accepted,
    Rejected,
    Completed,
    RestoreFailed,
    Expired,
}

/// Outcome of a state write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// The record moved to the new state
    Applied,
    /// The record already was in that state
    Unchanged,
    /// The record is further along; the write was ignored
    Stale,
}

impl RequestState {
    /// Position in the monotonic order; Accepted and Rejected share a rank
    pub fn rank(&self) -> u8 {
        match self {
            RequestState::Created => 0,
            RequestState::Pending => 1,
            RequestState::Accepted | RequestState::Rejected => 2,
            RequestState::Completed => 3,
            RequestState::RestoreFailed => 4,
            RequestState::Expired => 5,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RequestState::Created => "Created",
            RequestState::Pending => "Pending",
            RequestState::Accepted => "Accepted",
            RequestState::Rejected => "Rejected",
            RequestState::Completed => "Completed",
            RequestState::RestoreFailed => "RestoreFailed",
            RequestState::Expired => "Expired",
        }
    }

    /// Path segment used by the state-update endpoint
    pub fn as_path(&self) -> String {
        self.label().to_lowercase()
    }

    fn is_accepted_branch(&self) -> bool {
        matches!(
            self,
            RequestState::Accepted
                | RequestState::Completed
                | RequestState::RestoreFailed
                | RequestState::Expired
        )
    }

    fn is_decided(&self) -> bool {
        self.rank() >= 2
    }

    fn has_edge_to(&self, to: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, to),
            (Created, Pending)
                | (Created, Accepted)
                | (Created, Rejected)
                | (Pending, Accepted)
                | (Pending, Rejected)
                | (Accepted, Completed)
                | (Completed, RestoreFailed)
                | (Completed, Expired)
                | (RestoreFailed, Expired)
        )
    }

    /// Decide how a write of `to` applies to a record currently in `self`
    pub fn check_transition(&self, to: RequestState) -> Result<TransitionOutcome> {
        if *self == to {
            return Ok(TransitionOutcome::Unchanged);
        }
        if self.is_decided() && to.is_decided() && self.is_accepted_branch() != to.is_accepted_branch() {
            return Err(StorageError::Conflict { from: *self, to });
        }
        if to.rank() < self.rank() {
            return Ok(TransitionOutcome::Stale);
        }
        if self.has_edge_to(to) {
            Ok(TransitionOutcome::Applied)
        } else {
            Err(StorageError::Conflict { from: *self, to })
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RequestState {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "created" => Ok(RequestState::Created),
            "pending" => Ok(RequestState::Pending),
            "accepted" => Ok(RequestState::Accepted),
            "rejected" => Ok(RequestState::Rejected),
            "completed" => Ok(RequestState::Completed),
            "restorefailed" | "restore_failed" => Ok(RequestState::RestoreFailed),
            "expired" => Ok(RequestState::Expired),
            other => Err(StorageError::InvalidState(other.to_string())),
        }
    }
}

/// Tenant order as submitted to the middleware
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantOrder {
    pub contract_address: String,
    /// Tracking area lent to the tenant
    pub shared_tac: u32,
    /// IMSIs of the tenant's own UEs; they are never restricted
    pub ue_imsis: Vec<String>,
    pub duration_mins: Option<u32>,
    pub tenant_plmn: Option<String>,
    pub tenant_amf_ip: Option<String>,
    pub tenant_amf_port: Option<u16>,
    pub tenant_nssai: Option<serde_json::Value>,
}

impl TenantOrder {
    /// `ip:port` when a port is given, the bare ip otherwise
    pub fn tenant_amf_address(&self) -> Option<String> {
        let ip = self.tenant_amf_ip.as_deref().filter(|ip| !ip.is_empty())?;
        Some(match self.tenant_amf_port {
            Some(port) => format!("{}:{}", ip, port),
            None => ip.to_string(),
        })
    }
}

/// Mirror record of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedRequest {
    pub id: String,
    /// Settlement reference; set once the request is forwarded to the ledger
    #[serde(rename = "ref")]
    pub settlement_ref: Option<String>,
    pub ledger_request_id: Option<u64>,
    pub state: RequestState,
    pub order: TenantOrder,
    /// Endpoint configuration captured before restrictions were applied
    #[serde(default)]
    pub original_endpoints: Option<Vec<ManagedEndpoint>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedRequest {
    pub fn new(order: TenantOrder) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            settlement_ref: None,
            ledger_request_id: None,
            state: RequestState::Created,
            order,
            original_endpoints: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a state write in place
    pub fn apply(&mut self, to: RequestState) -> Result<TransitionOutcome> {
        let outcome = self.state.check_transition(to)?;
        if outcome == TransitionOutcome::Applied {
            self.state = to;
            self.updated_at = Utc::now();
        }
        Ok(outcome)
    }

    /// Attach the ledger reference and move to Pending
    pub fn attach(&mut self, settlement_ref: &str, ledger_request_id: u64) -> Result<TransitionOutcome> {
        if let Some(existing) = &self.settlement_ref {
            if existing != settlement_ref {
                return Err(StorageError::ReferenceTaken(existing.clone()));
            }
        }
        self.settlement_ref = Some(settlement_ref.to_string());
        self.ledger_request_id = Some(ledger_request_id);
        self.updated_at = Utc::now();
        self.apply(RequestState::Pending)
    }
}

/// Result of a keyed transition
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub outcome: TransitionOutcome,
    /// Record after the write
    pub request: TrackedRequest,
}

/// Storage error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("Request not found: {0}")]
    NotFound(String),

    #[error("Request already exists: {0}")]
    Duplicate(String),

    #[error("Settlement reference already bound: {0}")]
    ReferenceTaken(String),

    #[error("Invalid transition {from} -> {to}")]
    Conflict { from: RequestState, to: RequestState },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::NotFound(_) => ErrorClass::NotFound,
            StorageError::Duplicate(_)
            | StorageError::ReferenceTaken(_)
            | StorageError::Conflict { .. } => ErrorClass::StateConflict,
            StorageError::InvalidState(_) => ErrorClass::Validation,
            StorageError::Backend(_) | StorageError::Serialization(_) => ErrorClass::Internal,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Keyed mirror table. Every write is atomic per record.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a freshly created record
    async fn insert(&self, request: TrackedRequest) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<TrackedRequest>>;

    async fn find_by_ref(&self, settlement_ref: &str) -> Result<Option<TrackedRequest>>;

    /// Bind a settlement reference to record `id` and move it to Pending
    async fn attach_ref(
        &self,
        id: &str,
        settlement_ref: &str,
        ledger_request_id: u64,
    ) -> Result<TrackedRequest>;

    /// Move the record bound to `settlement_ref` to `to`
    async fn transition(&self, settlement_ref: &str, to: RequestState) -> Result<Transition>;

    /// Remember the pre-restriction endpoint configuration; the first capture wins
    async fn record_original_endpoints(
        &self,
        settlement_ref: &str,
        endpoints: Vec<ManagedEndpoint>,
    ) -> Result<TrackedRequest>;

    /// Full table, oldest first
    async fn list(&self) -> Result<Vec<TrackedRequest>>;
}
