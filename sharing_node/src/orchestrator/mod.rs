//! Lifecycle Orchestrator
//!
//! Takes an Accepted request to Completed:
//!
//! 1. restart the managed element with the tenant parameters
//! 2. enumerate the managed endpoints
//! 3. forbid the shared TAC on every non-tenant endpoint
//! 4. mark the record Completed
//!
//! Any failure leaves the record Accepted and the whole sequence can be run
//! again: a restart with the same parameters changes nothing, the TAC
//! restriction is set-like and the endpoint snapshot used for restoration is
//! only captured once.

pub mod restore;

pub use restore::RestorationScheduler;

use dashmap::DashMap;
use log::{error, info};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::agent::{add_tac_restriction, AgentError, NetworkControlAgent, TenantConfig};
use crate::error::ErrorClass;
use crate::storage::{RequestState, RequestStore, StorageError, TrackedRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestrationStep {
    Restart,
    ListEndpoints,
    RestrictEndpoints,
    RestoreRestart,
    RestoreEndpoints,
}

impl fmt::Display for OrchestrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrchestrationStep::Restart => "restart",
            OrchestrationStep::ListEndpoints => "list endpoints",
            OrchestrationStep::RestrictEndpoints => "restrict endpoints",
            OrchestrationStep::RestoreRestart => "restore restart",
            OrchestrationStep::RestoreEndpoints => "restore endpoints",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{step} failed: {source}")]
    Downstream {
        step: OrchestrationStep,
        #[source]
        source: AgentError,
    },

    #[error("Request {settlement_ref} is {state}")]
    InvalidState {
        settlement_ref: String,
        state: RequestState,
    },

    #[error(transparent)]
    Store(#[from] StorageError),
}

impl OrchestratorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OrchestratorError::Downstream { .. } => ErrorClass::DownstreamConfig,
            OrchestratorError::InvalidState { .. } => ErrorClass::StateConflict,
            OrchestratorError::Store(e) => e.class(),
        }
    }

    /// The step that failed, for downstream failures
    pub fn step(&self) -> Option<OrchestrationStep> {
        match self {
            OrchestratorError::Downstream { step, .. } => Some(*step),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

pub struct LifecycleOrchestrator {
    store: Arc<dyn RequestStore>,
    agent: Arc<dyn NetworkControlAgent>,
    default_plmn: String,
    restoration: Option<Arc<RestorationScheduler>>,
    running: DashMap<String, Arc<Mutex<()>>>,
}

impl LifecycleOrchestrator {
    pub fn new(
        store: Arc<dyn RequestStore>,
        agent: Arc<dyn NetworkControlAgent>,
        default_plmn: impl Into<String>,
    ) -> Self {
        Self {
            store,
            agent,
            default_plmn: default_plmn.into(),
            restoration: None,
            running: DashMap::new(),
        }
    }

    /// Schedule a restoration once a request with a duration completes
    pub fn with_restoration(mut self, scheduler: Arc<RestorationScheduler>) -> Self {
        self.restoration = Some(scheduler);
        self
    }

    pub fn restoration(&self) -> Option<&Arc<RestorationScheduler>> {
        self.restoration.as_ref()
    }

    /// Run the completion sequence for an Accepted request.
    ///
    /// A request that already completed (or went further) is returned as is.
    pub async fn finalize(&self, settlement_ref: &str) -> Result<TrackedRequest> {
        let lock = self
            .running
            .entry(settlement_ref.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _serial = lock.lock().await;
            self.finalize_serialised(settlement_ref).await
        };
        drop(lock);
        self.running
            .remove_if(settlement_ref, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// References with a finalisation running or queued
    pub fn in_progress(&self) -> usize {
        self.running.len()
    }

    async fn finalize_serialised(&self, settlement_ref: &str) -> Result<TrackedRequest> {
        let request = self
            .store
            .find_by_ref(settlement_ref)
            .await?
            .ok_or_else(|| StorageError::NotFound(settlement_ref.to_string()))?;

        match request.state {
            RequestState::Accepted => {}
            RequestState::Completed | RequestState::RestoreFailed | RequestState::Expired => {
                info!("Request {} already {}, nothing to do", settlement_ref, request.state);
                return Ok(request);
            }
            state => {
                return Err(OrchestratorError::InvalidState {
                    settlement_ref: settlement_ref.to_string(),
                    state,
                })
            }
        }

        let result = self.run_steps(&request).await;
        if let Err(e) = &result {
            error!(
                "Orchestration of {} stopped, request stays Accepted: {}",
                settlement_ref, e
            );
        }
        result
    }

    async fn run_steps(&self, request: &TrackedRequest) -> Result<TrackedRequest> {
        let settlement_ref = request
            .settlement_ref
            .as_deref()
            .ok_or_else(|| StorageError::NotFound(request.id.clone()))?;
        let order = &request.order;

        let tenant = TenantConfig::from_order(order);
        self.agent
            .restart(Some(&tenant))
            .await
            .map_err(|source| OrchestratorError::Downstream {
                step: OrchestrationStep::Restart,
                source,
            })?;
        info!("Restarted element with tenant parameters for {}", settlement_ref);

        let endpoints = self
            .agent
            .list_endpoints()
            .await
            .map_err(|source| OrchestratorError::Downstream {
                step: OrchestrationStep::ListEndpoints,
                source,
            })?;

        let non_tenant: Vec<_> = endpoints
            .into_iter()
            .filter(|endpoint| !order.ue_imsis.contains(&endpoint.imsi))
            .collect();
        self.store
            .record_original_endpoints(settlement_ref, non_tenant.clone())
            .await?;

        let plmn = order
            .tenant_plmn
            .as_deref()
            .filter(|plmn| !plmn.is_empty())
            .unwrap_or(self.default_plmn.as_str());
        let updates: Vec<_> = non_tenant
            .into_iter()
            .filter_map(|mut endpoint| {
                add_tac_restriction(&mut endpoint, order.shared_tac, plmn).then_some(endpoint)
            })
            .collect();

        if updates.is_empty() {
            info!("No endpoints to restrict for {}", settlement_ref);
        } else {
            self.agent
                .apply_endpoints(&updates)
                .await
                .map_err(|source| OrchestratorError::Downstream {
                    step: OrchestrationStep::RestrictEndpoints,
                    source,
                })?;
            info!(
                "Restricted TAC {} on {} endpoints for {}",
                order.shared_tac,
                updates.len(),
                settlement_ref
            );
        }

        let transition = self
            .store
            .transition(settlement_ref, RequestState::Completed)
            .await?;
        info!("Request {} completed", settlement_ref);

        if let (Some(scheduler), Some(minutes)) = (&self.restoration, order.duration_mins) {
            if minutes > 0 {
                scheduler.schedule(settlement_ref, Duration::from_secs(u64::from(minutes) * 60));
            }
        }

        Ok(transition.request)
    }
}
