use async_trait::async_trait;
use ethers::types::H256;
use ethers::utils::keccak256;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::gateway::{GatewayError, LedgerGateway, LedgerSubmission};
use crate::bridges::{DeliveryError, StateSink};
use crate::error::ErrorClass;
use crate::orchestrator::{LifecycleOrchestrator, OrchestratorError};
use crate::storage::{
    RequestState, RequestStore, StorageError, TenantOrder, TrackedRequest, TransitionOutcome,
};

/// States a caller may push through the state endpoint
pub const ACCEPTED_UPDATES: [&str; 3] = ["accepted", "rejected", "completed"];

/// Body of `POST /api/request`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRequest {
    pub credential: Option<String>,
    #[serde(rename = "contractAddress")]
    pub contract_address: Option<String>,
    #[serde(rename = "sharedTAC")]
    pub shared_tac: Option<u32>,
    #[serde(rename = "ueImsis")]
    pub ue_imsis: Option<Vec<String>>,
    #[serde(rename = "durationMins")]
    pub duration_mins: Option<u32>,
    #[serde(rename = "tenantPLMN")]
    pub tenant_plmn: Option<String>,
    #[serde(rename = "tenantAMFIP")]
    pub tenant_amf_ip: Option<String>,
    #[serde(rename = "tenantAMFPort")]
    pub tenant_amf_port: Option<u16>,
    #[serde(rename = "tenantNSSAI")]
    pub tenant_nssai: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRequest {
    pub id: String,
    pub settlement_ref: String,
    pub ledger_request_id: u64,
    pub state: RequestState,
    pub amount_escrowed: String,
}

/// Result of a state update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub settlement_ref: String,
    pub requested: RequestState,
    /// State of the record after the update
    pub state: RequestState,
    pub outcome: TransitionOutcome,
    /// Set when the record was accepted but could not be completed yet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalization_error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("Request with reference '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StorageError),

    #[error("Failed to forward request: {0}")]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl ServiceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ServiceError::Validation(_) => ErrorClass::Validation,
            ServiceError::NotFound(_) => ErrorClass::NotFound,
            ServiceError::Store(e) => e.class(),
            ServiceError::Gateway(e) => e.class(),
            ServiceError::Orchestrator(e) => e.class(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Digest the ledger stores in place of the order itself
pub fn order_digest(order: &TenantOrder) -> Result<H256> {
    let canonical = serde_json::to_vec(order).map_err(StorageError::from)?;
    Ok(H256::from(keccak256(canonical)))
}

fn validate(request: CreateRequest) -> Result<(String, TenantOrder)> {
    let mut missing = Vec::new();
    if request.credential.as_deref().map_or(true, str::is_empty) {
        missing.push("credential");
    }
    if request.contract_address.as_deref().map_or(true, str::is_empty) {
        missing.push("contractAddress");
    }
    if request.shared_tac.map_or(true, |tac| tac == 0) {
        missing.push("sharedTAC");
    }
    if request.ue_imsis.as_ref().map_or(true, Vec::is_empty) {
        missing.push("ueImsis");
    }
    if !missing.is_empty() {
        return Err(ServiceError::Validation(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )));
    }
    if request.duration_mins.map_or(true, |mins| mins == 0) {
        return Err(ServiceError::Validation(
            "durationMins must be a positive number of minutes".to_string(),
        ));
    }

    let order = TenantOrder {
        contract_address: request.contract_address.unwrap_or_default(),
        shared_tac: request.shared_tac.unwrap_or_default(),
        ue_imsis: request.ue_imsis.unwrap_or_default(),
        duration_mins: request.duration_mins,
        tenant_plmn: request.tenant_plmn,
        tenant_amf_ip: request.tenant_amf_ip,
        tenant_amf_port: request.tenant_amf_port,
        tenant_nssai: request.tenant_nssai,
    };
    Ok((request.credential.unwrap_or_default(), order))
}

/// Request creation and state handling
pub struct RequestService {
    store: Arc<dyn RequestStore>,
    gateway: Arc<dyn LedgerGateway>,
    orchestrator: Arc<LifecycleOrchestrator>,
}

impl RequestService {
    pub fn new(
        store: Arc<dyn RequestStore>,
        gateway: Arc<dyn LedgerGateway>,
        orchestrator: Arc<LifecycleOrchestrator>,
    ) -> Self {
        Self {
            store,
            gateway,
            orchestrator,
        }
    }

    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    /// Record a tenant order and forward it to the ledger.
    ///
    /// If the ledger cannot be reached the record stays Created.
    pub async fn create(&self, request: CreateRequest) -> Result<CreatedRequest> {
        let (credential, order) = validate(request)?;
        let digest = order_digest(&order)?;
        let submission = LedgerSubmission {
            credential,
            contract_address: order.contract_address.clone(),
            num_users: u32::try_from(order.ue_imsis.len()).unwrap_or(u32::MAX),
            duration_minutes: order.duration_mins.unwrap_or_default(),
            order_digest: digest,
        };

        let tracked = TrackedRequest::new(order);
        let id = tracked.id.clone();
        self.store.insert(tracked).await?;
        info!("Created request {}", id);

        let receipt = match self.gateway.submit(submission).await {
            Ok(receipt) => receipt,
            Err(e) => {
                error!("Request {} not forwarded, staying Created: {}", id, e);
                return Err(e.into());
            }
        };

        let record = self
            .store
            .attach_ref(&id, &receipt.settlement_ref, receipt.request_id)
            .await?;
        info!(
            "Request {} pending on the ledger as #{} ({})",
            id, receipt.request_id, receipt.settlement_ref
        );

        Ok(CreatedRequest {
            id,
            settlement_ref: receipt.settlement_ref,
            ledger_request_id: receipt.request_id,
            state: record.state,
            amount_escrowed: receipt.amount_escrowed,
        })
    }

    /// Apply `state` (accepted, rejected or completed, any case) to the
    /// record bound to `settlement_ref`.
    ///
    /// An accepted record is driven to Completed right away. If that fails
    /// the update itself still succeeds with the record left Accepted, so the
    /// sender does not redeliver; `reconcile` retries the completion.
    pub async fn update_state(&self, settlement_ref: &str, state: &str) -> Result<StateUpdate> {
        let lowered = state.trim().to_lowercase();
        if !ACCEPTED_UPDATES.contains(&lowered.as_str()) {
            return Err(ServiceError::Validation(format!(
                "Invalid state. Must be one of: {}",
                ACCEPTED_UPDATES.join(", ")
            )));
        }
        let requested: RequestState = lowered.parse()?;

        let current = self
            .store
            .find_by_ref(settlement_ref)
            .await?
            .ok_or_else(|| ServiceError::NotFound(settlement_ref.to_string()))?;

        let (outcome, record) = match requested {
            RequestState::Completed if current.state == RequestState::Accepted => {
                let record = self.orchestrator.finalize(settlement_ref).await?;
                (TransitionOutcome::Applied, record)
            }
            _ => {
                let transition = self.store.transition(settlement_ref, requested).await?;
                (transition.outcome, transition.request)
            }
        };

        let mut update = StateUpdate {
            settlement_ref: settlement_ref.to_string(),
            requested,
            state: record.state,
            outcome,
            finalization_error: None,
        };

        if record.state == RequestState::Accepted {
            match self.orchestrator.finalize(settlement_ref).await {
                Ok(finished) => update.state = finished.state,
                Err(e) => {
                    warn!("Request {} accepted but not completed: {}", settlement_ref, e);
                    update.finalization_error = Some(e.to_string());
                }
            }
        }

        info!(
            "Request {} update to {}: {:?}, now {}",
            settlement_ref, requested, update.outcome, update.state
        );
        Ok(update)
    }

    /// Retry the completion of an Accepted request
    pub async fn reconcile(&self, settlement_ref: &str) -> Result<TrackedRequest> {
        if self.store.find_by_ref(settlement_ref).await?.is_none() {
            return Err(ServiceError::NotFound(settlement_ref.to_string()));
        }
        Ok(self.orchestrator.finalize(settlement_ref).await?)
    }

    pub async fn get(&self, settlement_ref: &str) -> Result<TrackedRequest> {
        self.store
            .find_by_ref(settlement_ref)
            .await?
            .ok_or_else(|| ServiceError::NotFound(settlement_ref.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<TrackedRequest>> {
        Ok(self.store.list().await?)
    }
}

/// Delivers bridge updates straight into a co-located [`RequestService`]
pub struct ServiceSink {
    service: Arc<RequestService>,
}

impl ServiceSink {
    pub fn new(service: Arc<RequestService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl StateSink for ServiceSink {
    async fn deliver(
        &self,
        settlement_ref: &str,
        state: RequestState,
    ) -> std::result::Result<(), DeliveryError> {
        self.service
            .update_state(settlement_ref, &state.as_path())
            .await
            .map(|_| ())
            .map_err(|e| DeliveryError::Rejected {
                status: e.class().http_status(),
                body: e.to_string(),
            })
    }
}
