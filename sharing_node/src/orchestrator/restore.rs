//! Post-agreement restoration.
//!
//! Once a tenant's duration runs out the element is restarted without tenant
//! parameters and every endpoint captured before restriction is written
//! back. Success ends the record in Expired; a failure leaves it in
//! RestoreFailed, from which a later restore can still reach Expired.

use dashmap::DashMap;
use log::{error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{OrchestrationStep, OrchestratorError, Result};
use crate::agent::NetworkControlAgent;
use crate::storage::{RequestState, RequestStore};

pub struct RestorationScheduler {
    store: Arc<dyn RequestStore>,
    agent: Arc<dyn NetworkControlAgent>,
    /// Pending timers by reference, tagged with a generation so a replaced
    /// timer never removes its successor
    scheduled: DashMap<String, (u64, CancellationToken)>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl RestorationScheduler {
    pub fn new(store: Arc<dyn RequestStore>, agent: Arc<dyn NetworkControlAgent>) -> Self {
        Self {
            store,
            agent,
            scheduled: DashMap::new(),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of restorations still waiting
    pub fn pending(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_scheduled(&self, settlement_ref: &str) -> bool {
        self.scheduled.contains_key(settlement_ref)
    }

    /// Drop the pending restoration for `settlement_ref`, if any
    pub fn cancel(&self, settlement_ref: &str) -> bool {
        match self.scheduled.remove(settlement_ref) {
            Some((_, (_, token))) => {
                token.cancel();
                info!("Cancelled restoration for {}", settlement_ref);
                true
            }
            None => false,
        }
    }

    /// Cancel every pending restoration
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Restore `settlement_ref` after `after`. Scheduling an already pending
    /// reference replaces the earlier timer.
    pub fn schedule(
        self: &Arc<Self>,
        settlement_ref: &str,
        after: Duration,
    ) -> JoinHandle<Option<RequestState>> {
        let token = self.shutdown.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some((_, previous)) = self
            .scheduled
            .insert(settlement_ref.to_string(), (generation, token.clone()))
        {
            previous.cancel();
        }
        info!("Scheduled restoration of {} in {:?}", settlement_ref, after);

        let scheduler = Arc::clone(self);
        let settlement_ref = settlement_ref.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {}
                _ = token.cancelled() => return None,
            }
            scheduler
                .scheduled
                .remove_if(&settlement_ref, |_, (current, _)| *current == generation);

            match scheduler.restore_now(&settlement_ref).await {
                Ok(state) => Some(state),
                Err(e) => {
                    error!("Restoration of {} failed: {}", settlement_ref, e);
                    scheduler
                        .store
                        .find_by_ref(&settlement_ref)
                        .await
                        .ok()
                        .flatten()
                        .map(|request| request.state)
                }
            }
        })
    }

    /// Restore right away. Valid from Completed or RestoreFailed.
    pub async fn restore_now(&self, settlement_ref: &str) -> Result<RequestState> {
        let request = self
            .store
            .find_by_ref(settlement_ref)
            .await?
            .ok_or_else(|| crate::storage::StorageError::NotFound(settlement_ref.to_string()))?;

        match request.state {
            RequestState::Completed | RequestState::RestoreFailed => {}
            RequestState::Expired => return Ok(RequestState::Expired),
            state => {
                return Err(OrchestratorError::InvalidState {
                    settlement_ref: settlement_ref.to_string(),
                    state,
                })
            }
        }

        info!("Restoring host configuration for {}", settlement_ref);
        let result = async {
            self.agent
                .restart(None)
                .await
                .map_err(|source| OrchestratorError::Downstream {
                    step: OrchestrationStep::RestoreRestart,
                    source,
                })?;

            match request.original_endpoints.as_deref() {
                Some(endpoints) if !endpoints.is_empty() => {
                    self.agent
                        .apply_endpoints(endpoints)
                        .await
                        .map_err(|source| OrchestratorError::Downstream {
                            step: OrchestrationStep::RestoreEndpoints,
                            source,
                        })?;
                    info!("Restored {} endpoints for {}", endpoints.len(), settlement_ref);
                }
                _ => info!("No endpoints to restore for {}", settlement_ref),
            }
            Ok::<(), OrchestratorError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.store
                    .transition(settlement_ref, RequestState::Expired)
                    .await?;
                info!("Request {} expired", settlement_ref);
                Ok(RequestState::Expired)
            }
            Err(e) => {
                warn!("Marking {} RestoreFailed: {}", settlement_ref, e);
                if let Err(store_err) = self
                    .store
                    .transition(settlement_ref, RequestState::RestoreFailed)
                    .await
                {
                    error!("Failed to record RestoreFailed for {}: {}", settlement_ref, store_err);
                }
                Err(e)
            }
        }
    }
}
