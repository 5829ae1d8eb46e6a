//! 5G resource-sharing node
//!
//! Negotiates resource-sharing agreements between mobile operators. A tenant
//! operator submits a request that escrows payment on the ledger; the host
//! operator confirms (payout) or cancels (refund) it. The middleware keeps an
//! off-chain mirror of every request and, once a request is accepted, drives
//! the network control agent to admit the tenant.
//!
//! # Architecture
//!
//! - **Escrow Ledger** ([`ledger`]): one record per request, one-way status
//!   transitions, funds held between creation and finalisation.
//! - **Request Store** ([`storage`]): durable mirror keyed by settlement
//!   reference with a monotonic state order.
//! - **Sync Bridge** ([`bridges`]): relays ledger status changes to the mirror
//!   with bounded retry and exponential backoff.
//! - **Lifecycle Orchestrator** ([`orchestrator`]): reconfigures the network
//!   element and restricts non-tenant endpoints, then marks the request
//!   Completed.
//!
//! ```text
//! client ─▶ ledger.create ─▶ owner confirm/cancel ─▶ LedgerEvent
//!                                                     │
//!                          SyncBridge (retry/backoff) ◀┘
//!                                  │
//!                          RequestStore ─▶ LifecycleOrchestrator ─▶ agent
//! ```

pub mod agent;
pub mod api;
pub mod bridges;
pub mod config;
pub mod error;
pub mod ledger;
pub mod middleware;
pub mod orchestrator;
pub mod storage;

pub use bridges::{RetryPolicy, SyncBridge, SyncDeliveryError};
pub use config::NodeConfig;
pub use error::ErrorClass;
pub use ledger::{EscrowLedger, EscrowRequest, LedgerError, LedgerEvent, RequestLedger, RequestStatus};
pub use orchestrator::{LifecycleOrchestrator, OrchestratorError};
pub use storage::{RequestState, RequestStore, TrackedRequest, TransitionOutcome};
