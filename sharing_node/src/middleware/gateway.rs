//! Forwarding tenant requests to the escrow ledger.

use async_trait::async_trait;
use ethers::types::{H256, U256};
use ethers::utils::format_ether;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ErrorClass;
use crate::ledger::{check_contract_address, CredentialRegistry, LedgerError, NewRequest, RequestLedger};

/// What the middleware asks the ledger to record
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSubmission {
    /// Bearer credential identifying the requester on the ledger
    pub credential: String,
    pub contract_address: String,
    pub num_users: u32,
    pub duration_minutes: u32,
    pub order_digest: H256,
}

/// Ledger answer to a successful creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReceipt {
    pub request_id: u64,
    pub settlement_ref: String,
    /// Escrowed value, in ether
    pub amount_escrowed: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Credential not accepted by the ledger")]
    Unauthorized,

    #[error("Ledger node unreachable: {0}")]
    Transport(String),

    #[error("Ledger node answered {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed ledger node response: {0}")]
    Decode(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl GatewayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::Unauthorized => ErrorClass::Authorization,
            GatewayError::Ledger(e) => e.class(),
            GatewayError::Transport(_) | GatewayError::Rejected { .. } | GatewayError::Decode(_) => {
                ErrorClass::Upstream
            }
        }
    }
}

#[async_trait]
pub trait LedgerGateway: Send + Sync {
    async fn submit(&self, submission: LedgerSubmission) -> Result<LedgerReceipt, GatewayError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody<'a> {
    contract_address: &'a str,
    num_users: u32,
    duration_mins: u32,
    order_digest: H256,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Talks to a ledger node over HTTP: `POST {node}/create`
pub struct NodeServerClient {
    http: reqwest::Client,
    create_url: String,
}

impl NodeServerClient {
    pub fn new(node_server_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            create_url: format!("{}/create", node_server_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl LedgerGateway for NodeServerClient {
    async fn submit(&self, submission: LedgerSubmission) -> Result<LedgerReceipt, GatewayError> {
        let response = self
            .http
            .post(&self.create_url)
            .bearer_auth(&submission.credential)
            .json(&CreateBody {
                contract_address: &submission.contract_address,
                num_users: submission.num_users,
                duration_mins: submission.duration_minutes,
                order_digest: submission.order_digest,
            })
            .send()
            .await
            .map_err(|e| {
                error!("Error forwarding to ledger node at {}: {}", self.create_url, e);
                GatewayError::Transport(e.to_string())
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(GatewayError::Unauthorized);
        }
        if !status.is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .map(|body| body.message)
                .unwrap_or_default();
            error!("Ledger node returned status {}: {}", status, message);
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<LedgerReceipt>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

/// Submits straight to an in-process ledger, paying the quoted amount
pub struct LocalLedgerGateway {
    ledger: Arc<dyn RequestLedger>,
    credentials: CredentialRegistry,
}

impl LocalLedgerGateway {
    pub fn new(ledger: Arc<dyn RequestLedger>, credentials: CredentialRegistry) -> Self {
        Self { ledger, credentials }
    }
}

#[async_trait]
impl LedgerGateway for LocalLedgerGateway {
    async fn submit(&self, submission: LedgerSubmission) -> Result<LedgerReceipt, GatewayError> {
        let requester = self
            .credentials
            .resolve(&submission.credential)
            .ok_or(GatewayError::Unauthorized)?;
        check_contract_address(&submission.contract_address, self.ledger.address())?;

        let payment: U256 = self
            .ledger
            .required_payment(submission.num_users, submission.duration_minutes)?;
        let request = self
            .ledger
            .create_request(
                NewRequest {
                    requester,
                    num_users: submission.num_users,
                    duration_minutes: submission.duration_minutes,
                    order_digest: submission.order_digest,
                },
                payment,
            )
            .await?;

        info!("Submitted request {} to the local ledger", request.id);
        Ok(LedgerReceipt {
            request_id: request.id,
            settlement_ref: request.settlement_ref,
            amount_escrowed: format_ether(request.amount_escrowed),
        })
    }
}
