//! Operator middleware
//!
//! Accepts tenant orders, records them in the Request Store, forwards them to
//! the ledger and applies the state updates the Sync Bridge delivers.

pub mod gateway;
pub mod service;

pub use gateway::{
    GatewayError, LedgerGateway, LedgerReceipt, LedgerSubmission, LocalLedgerGateway,
    NodeServerClient,
};
pub use service::{
    CreateRequest, CreatedRequest, RequestService, ServiceError, ServiceSink, StateUpdate,
};
