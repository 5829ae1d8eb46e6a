//! HTTP surfaces of the ledger node and the middleware

pub mod errors;
pub mod ledger;
pub mod middleware;

pub use errors::ApiError;
pub use ledger::LedgerState;
pub use middleware::MiddlewareState;
