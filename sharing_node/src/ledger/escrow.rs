//! In-process escrow ledger.
//!
//! Requests live in an id-ordered table; every record sits behind its own
//! lock, which is held across the status check, the payout and the status
//! write so that at most one finalisation per request can ever succeed.

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, U256};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{
    settlement_ref, EscrowRequest, LedgerError, LedgerEvent, NewRequest, PaymentRail,
    PricingRule, RequestLedger, RequestStatus, Result, StatusChange,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Escrow ledger over a pluggable payment rail
pub struct EscrowLedger {
    address: Address,
    owner: Address,
    pricing: PricingRule,
    rail: Arc<dyn PaymentRail>,
    requests: RwLock<BTreeMap<u64, Arc<Mutex<EscrowRequest>>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<LedgerEvent>,
}

impl EscrowLedger {
    pub fn new(
        address: Address,
        owner: Address,
        pricing: PricingRule,
        rail: Arc<dyn PaymentRail>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            address,
            owner,
            pricing,
            rail,
            requests: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    pub fn pricing(&self) -> PricingRule {
        self.pricing
    }

    /// Number of requests ever created
    pub fn len(&self) -> usize {
        self.requests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, id: u64) -> Result<Arc<Mutex<EscrowRequest>>> {
        self.requests
            .read()
            .get(&id)
            .cloned()
            .ok_or(LedgerError::NotFound(id))
    }

    fn finalize(
        &self,
        caller: Address,
        id: u64,
        target: RequestStatus,
        reason: Option<&str>,
    ) -> Result<StatusChange> {
        if caller != self.owner {
            warn!("Rejected {} of request {} by non-owner {:?}", target, id, caller);
            return Err(LedgerError::Unauthorized { caller });
        }

        let entry = self.entry(id)?;
        let change = {
            let mut request = entry.lock();
            if request.status != RequestStatus::Created {
                return Err(LedgerError::InvalidState {
                    id,
                    status: request.status,
                });
            }

            let payee = match target {
                RequestStatus::Cancelled => request.requester,
                _ => self.owner,
            };

            // Nothing is written until the payout has gone through.
            self.rail.release(payee, request.amount_escrowed)?;
            request.status = target;

            StatusChange {
                id,
                settlement_ref: request.settlement_ref.clone(),
                status: target,
                payee,
                amount: request.amount_escrowed,
                reason: reason.map(str::to_string),
                at: Utc::now(),
            }
        };

        info!(
            "Request {} {} ({} wei to {:?})",
            id,
            target.label().to_lowercase(),
            change.amount,
            change.payee
        );
        if self.events.send(LedgerEvent::StatusChanged(change.clone())).is_err() {
            debug!("No subscribers for status change of request {}", id);
        }

        Ok(change)
    }
}

#[async_trait]
impl RequestLedger for EscrowLedger {
    fn address(&self) -> Address {
        self.address
    }

    fn owner(&self) -> Address {
        self.owner
    }

    fn required_payment(&self, num_users: u32, duration_minutes: u32) -> Result<U256> {
        self.pricing.required_payment(num_users, duration_minutes)
    }

    async fn create_request(&self, request: NewRequest, payment: U256) -> Result<EscrowRequest> {
        if request.requester.is_zero() {
            return Err(LedgerError::InvalidRequester);
        }

        let required = self
            .pricing
            .required_payment(request.num_users, request.duration_minutes)?;
        if payment < required {
            return Err(LedgerError::InsufficientPayment {
                required,
                provided: payment,
            });
        }

        self.rail.escrow(request.requester, payment)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = EscrowRequest {
            id,
            requester: request.requester,
            num_users: request.num_users,
            duration_minutes: request.duration_minutes,
            order_digest: request.order_digest,
            status: RequestStatus::Created,
            created_at: Utc::now(),
            amount_escrowed: payment,
            settlement_ref: settlement_ref(
                self.address,
                id,
                request.requester,
                request.order_digest,
            ),
        };

        self.requests
            .write()
            .insert(id, Arc::new(Mutex::new(record.clone())));

        info!(
            "Request {} created by {:?}: {} users x {} min, {} wei escrowed",
            id, record.requester, record.num_users, record.duration_minutes, payment
        );
        if payment > required {
            debug!("Request {} overpaid by {} wei", id, payment - required);
        }

        let created = LedgerEvent::RequestCreated {
            id,
            requester: record.requester,
            amount: payment,
            settlement_ref: record.settlement_ref.clone(),
        };
        if self.events.send(created).is_err() {
            debug!("No subscribers for creation of request {}", id);
        }

        Ok(record)
    }

    async fn confirm_request(&self, caller: Address, id: u64) -> Result<StatusChange> {
        self.finalize(caller, id, RequestStatus::Confirmed, None)
    }

    async fn cancel_request(&self, caller: Address, id: u64, reason: &str) -> Result<StatusChange> {
        self.finalize(caller, id, RequestStatus::Cancelled, Some(reason))
    }

    async fn get_request(&self, id: u64) -> Result<EscrowRequest> {
        let entry = self.entry(id)?;
        let request = entry.lock().clone();
        Ok(request)
    }

    async fn list_by_status(&self, status: RequestStatus) -> Result<Vec<EscrowRequest>> {
        let entries: Vec<Arc<Mutex<EscrowRequest>>> =
            self.requests.read().values().cloned().collect();

        Ok(entries
            .iter()
            .filter_map(|entry| {
                let request = entry.lock();
                (request.status == status).then(|| request.clone())
            })
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }
}
