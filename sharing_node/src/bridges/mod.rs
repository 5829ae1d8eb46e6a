//! Sync Bridge
//!
//! Relays ledger status changes into the Request Store. Each notification
//! runs on its own task with its own backoff timer; deliveries for the same
//! settlement reference are serialised, different references run
//! concurrently. The bridge never touches the ledger: an exhausted delivery
//! is logged and reported, the ledger state stands.

pub mod retry;
pub mod sink;

pub use retry::RetryPolicy;
pub use sink::{DeliveryError, HttpStateSink, StateSink};

use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorClass;
use crate::ledger::{LedgerEvent, RequestStatus};
use crate::storage::RequestState;

/// A delivery that reached the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub settlement_ref: String,
    pub state: RequestState,
    /// Attempts used, including the successful one
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncDeliveryError {
    #[error("delivery of {state} for {settlement_ref} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        settlement_ref: String,
        state: RequestState,
        attempts: u32,
        last_error: DeliveryError,
    },

    #[error("delivery of {state} for {settlement_ref} cancelled")]
    Cancelled {
        settlement_ref: String,
        state: RequestState,
    },
}

impl SyncDeliveryError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::SyncDelivery
    }
}

/// Mirror state for a final ledger status
pub fn mirror_state(status: RequestStatus) -> Option<RequestState> {
    match status {
        RequestStatus::Created => None,
        RequestStatus::Confirmed => Some(RequestState::Accepted),
        RequestStatus::Cancelled => Some(RequestState::Rejected),
    }
}

/// Handle to a spawned notification
pub struct DeliveryHandle {
    token: CancellationToken,
    task: JoinHandle<Result<Delivery, SyncDeliveryError>>,
    settlement_ref: String,
    state: RequestState,
}

impl DeliveryHandle {
    /// Stop retrying; an attempt already on the wire still completes
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<Delivery, SyncDeliveryError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Delivery task for {} aborted: {}", self.settlement_ref, e);
                Err(SyncDeliveryError::Cancelled {
                    settlement_ref: self.settlement_ref,
                    state: self.state,
                })
            }
        }
    }
}

pub struct SyncBridge {
    sink: Arc<dyn StateSink>,
    policy: RetryPolicy,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    shutdown: CancellationToken,
}

impl SyncBridge {
    pub fn new(sink: Arc<dyn StateSink>, policy: RetryPolicy) -> Self {
        Self {
            sink,
            policy,
            in_flight: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Cancel every pending retry and stop the relay
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Deliver `state` for `settlement_ref`, retrying transient failures
    pub async fn notify_state_change(
        &self,
        settlement_ref: &str,
        state: RequestState,
    ) -> Result<Delivery, SyncDeliveryError> {
        self.deliver(settlement_ref, state, &self.shutdown).await
    }

    /// Run [`notify_state_change`](Self::notify_state_change) on its own task
    pub fn spawn_notification(
        self: &Arc<Self>,
        settlement_ref: impl Into<String>,
        state: RequestState,
    ) -> DeliveryHandle {
        let settlement_ref = settlement_ref.into();
        let token = self.shutdown.child_token();
        let bridge = Arc::clone(self);
        let task_ref = settlement_ref.clone();
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            bridge.deliver(&task_ref, state, &task_token).await
        });

        DeliveryHandle {
            token,
            task,
            settlement_ref,
            state,
        }
    }

    /// Forward every final status change from `events` until shutdown
    pub fn spawn_relay(self: &Arc<Self>, mut events: broadcast::Receiver<LedgerEvent>) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            info!("Sync bridge relay started");
            loop {
                let event = tokio::select! {
                    _ = bridge.shutdown.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(LedgerEvent::StatusChanged(change)) => {
                        let Some(state) = mirror_state(change.status) else {
                            continue;
                        };
                        // Dropping the handle detaches the task; it keeps retrying
                        let _ = bridge.spawn_notification(change.settlement_ref, state);
                    }
                    Ok(LedgerEvent::RequestCreated { id, .. }) => {
                        debug!("Request {} created, nothing to relay", id);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Sync bridge relay lagged, {} ledger events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!("Sync bridge relay stopped");
        })
    }

    /// References with a delivery running or waiting for its turn
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn lock_for(&self, settlement_ref: &str) -> Arc<Mutex<()>> {
        self.in_flight
            .entry(settlement_ref.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn deliver(
        &self,
        settlement_ref: &str,
        state: RequestState,
        token: &CancellationToken,
    ) -> Result<Delivery, SyncDeliveryError> {
        let lock = self.lock_for(settlement_ref);
        let result = {
            let _serial = lock.lock().await;
            self.deliver_with_retry(settlement_ref, state, token).await
        };
        drop(lock);
        // Only the map holds the lock now unless another delivery is queued on it
        self.in_flight
            .remove_if(settlement_ref, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn deliver_with_retry(
        &self,
        settlement_ref: &str,
        state: RequestState,
        token: &CancellationToken,
    ) -> Result<Delivery, SyncDeliveryError> {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sink.deliver(settlement_ref, state).await {
                Ok(()) => {
                    info!(
                        "Delivered {} for {} (attempt {}/{})",
                        state, settlement_ref, attempt, max_attempts
                    );
                    return Ok(Delivery {
                        settlement_ref: settlement_ref.to_string(),
                        state,
                        attempts: attempt,
                    });
                }
                Err(e) if attempt >= max_attempts => {
                    error!(
                        "Giving up on {} for {} after {} attempts: {}",
                        state, settlement_ref, attempt, e
                    );
                    return Err(SyncDeliveryError::Exhausted {
                        settlement_ref: settlement_ref.to_string(),
                        state,
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let delay = self.policy.delay_for_retry(attempt);
                    warn!(
                        "Delivery attempt {}/{} of {} for {} failed: {}; retrying in {:?}",
                        attempt, max_attempts, state, settlement_ref, e, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            warn!("Delivery of {} for {} cancelled", state, settlement_ref);
                            return Err(SyncDeliveryError::Cancelled {
                                settlement_ref: settlement_ref.to_string(),
                                state,
                            });
                        }
                    }
                }
            }
        }
    }
}
