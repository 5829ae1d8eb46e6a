//! Escrow Ledger
//!
//! The ledger owns one record per resource-sharing request. A request escrows
//! its payment at creation; the owner either confirms it (payment goes to the
//! owner) or cancels it (payment is refunded to the requester). Both
//! transitions are terminal and each request pays out exactly once.

pub mod auth;
pub mod escrow;
pub mod payment;
pub mod pricing;

pub use auth::CredentialRegistry;
pub use escrow::EscrowLedger;
pub use payment::{InMemoryRail, PaymentRail, TransferError};
pub use pricing::PricingRule;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;

use crate::error::ErrorClass;

/// Ledger-side status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    Created,
    Confirmed,
    Cancelled,
}

impl RequestStatus {
    /// Human-readable label used by the query surface
    pub fn label(&self) -> &'static str {
        match self {
            RequestStatus::Created => "Created",
            RequestStatus::Confirmed => "Confirmed",
            RequestStatus::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Created)
    }

    pub fn all() -> [RequestStatus; 3] {
        [
            RequestStatus::Created,
            RequestStatus::Confirmed,
            RequestStatus::Cancelled,
        ]
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RequestStatus {
    type Err = LedgerError;

    /// Accepts the labels and the panel aliases (`pending`, `completed`)
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "created" | "pending" => Ok(RequestStatus::Created),
            "confirmed" | "completed" => Ok(RequestStatus::Confirmed),
            "cancelled" | "canceled" => Ok(RequestStatus::Cancelled),
            other => Err(LedgerError::InvalidStatus(other.to_string())),
        }
    }
}

/// A request as recorded by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowRequest {
    pub id: u64,
    pub requester: Address,
    pub num_users: u32,
    pub duration_minutes: u32,
    /// Digest of the off-chain order payload
    pub order_digest: H256,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub amount_escrowed: U256,
    /// Correlates mirror updates with this request's transitions
    pub settlement_ref: String,
}

/// Input of `create_request`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRequest {
    pub requester: Address,
    pub num_users: u32,
    pub duration_minutes: u32,
    pub order_digest: H256,
}

/// A committed Created → Confirmed/Cancelled transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub id: u64,
    pub settlement_ref: String,
    pub status: RequestStatus,
    /// Party that received the escrowed amount
    pub payee: Address,
    pub amount: U256,
    /// Audit string attached to cancellations
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Events emitted by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerEvent {
    RequestCreated {
        id: u64,
        requester: Address,
        amount: U256,
        settlement_ref: String,
    },
    StatusChanged(StatusChange),
}

/// Ledger operation error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("Invalid requester: the zero address cannot submit requests")]
    InvalidRequester,

    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),

    #[error("Insufficient payment: required {required} wei, provided {provided}")]
    InsufficientPayment { required: U256, provided: U256 },

    #[error("Unauthorized caller {caller:?}: only the ledger owner may finalize requests")]
    Unauthorized { caller: Address },

    #[error("Request {id} is {status}, expected Created")]
    InvalidState { id: u64, status: RequestStatus },

    #[error("Request {0} not found")]
    NotFound(u64),

    #[error("Transfer failed: {0}")]
    TransferFailed(#[from] TransferError),

    #[error("Invalid status filter: {0}")]
    InvalidStatus(String),

    #[error("Wrong contract: {0}")]
    WrongContract(String),
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::InvalidRequester
            | LedgerError::InvalidCapacity(_)
            | LedgerError::InsufficientPayment { .. }
            | LedgerError::InvalidStatus(_)
            | LedgerError::WrongContract(_) => ErrorClass::Validation,
            LedgerError::Unauthorized { .. } => ErrorClass::Authorization,
            LedgerError::InvalidState { .. } => ErrorClass::StateConflict,
            LedgerError::NotFound(_) => ErrorClass::NotFound,
            LedgerError::TransferFailed(_) => ErrorClass::Transfer,
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Keyed request table with atomic per-request transitions
#[async_trait]
pub trait RequestLedger: Send + Sync {
    /// Address the ledger is deployed at
    fn address(&self) -> Address;

    /// The only identity allowed to confirm or cancel
    fn owner(&self) -> Address;

    /// Quote for the given capacity
    fn required_payment(&self, num_users: u32, duration_minutes: u32) -> Result<U256>;

    /// Record a request and escrow `payment`
    async fn create_request(&self, request: NewRequest, payment: U256) -> Result<EscrowRequest>;

    /// Created → Confirmed, escrow paid to the owner
    async fn confirm_request(&self, caller: Address, id: u64) -> Result<StatusChange>;

    /// Created → Cancelled, escrow refunded to the requester
    async fn cancel_request(&self, caller: Address, id: u64, reason: &str) -> Result<StatusChange>;

    async fn get_request(&self, id: u64) -> Result<EscrowRequest>;

    /// All requests with `status`, ascending id
    async fn list_by_status(&self, status: RequestStatus) -> Result<Vec<EscrowRequest>>;

    /// Stream of ledger events
    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent>;
}

/// Check that a client-supplied contract address names the ledger at `ledger`
pub fn check_contract_address(contract_address: &str, ledger: Address) -> Result<()> {
    let parsed: Address = contract_address
        .trim()
        .parse()
        .map_err(|_| LedgerError::WrongContract(format!("{} is not an address", contract_address)))?;
    if parsed != ledger {
        return Err(LedgerError::WrongContract(format!(
            "{:?} is not the ledger at {:?}",
            parsed, ledger
        )));
    }
    Ok(())
}

/// Opaque reference binding a request to its ledger and content
pub fn settlement_ref(ledger: Address, id: u64, requester: Address, order_digest: H256) -> String {
    let mut preimage = Vec::with_capacity(20 + 8 + 20 + 32);
    preimage.extend_from_slice(ledger.as_bytes());
    preimage.extend_from_slice(&id.to_be_bytes());
    preimage.extend_from_slice(requester.as_bytes());
    preimage.extend_from_slice(order_digest.as_bytes());
    format!("0x{}", hex::encode(keccak256(preimage)))
}
