/// Sync bridge delivery tests
/// Retry timing under a paused clock, exhaustion, idempotent redelivery,
/// per-reference serialisation and the ledger → mirror relay

mod common;

use async_trait::async_trait;
use ethers::utils::parse_ether;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sharing_node::bridges::{DeliveryError, StateSink};
use sharing_node::ledger::RequestStatus;
use sharing_node::storage::TransitionOutcome;
use sharing_node::{RequestLedger, RequestState, RequestStore, RetryPolicy, SyncBridge, SyncDeliveryError};

use common::{
    create_body, embedded, ledger, memory_store, new_request, order, owner, tenant,
    tracked_in_state, wait_for,
};

/// Writes straight into a store after failing `failures` times
struct FlakyStoreSink {
    store: Arc<dyn RequestStore>,
    failures: Mutex<u32>,
    attempts: Mutex<Vec<tokio::time::Instant>>,
}

impl FlakyStoreSink {
    fn new(store: Arc<dyn RequestStore>, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            store,
            failures: Mutex::new(failures),
            attempts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl StateSink for FlakyStoreSink {
    async fn deliver(&self, settlement_ref: &str, state: RequestState) -> Result<(), DeliveryError> {
        self.attempts.lock().push(tokio::time::Instant::now());
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(DeliveryError::Rejected {
                    status: 503,
                    body: "mirror unavailable".to_string(),
                });
            }
        }
        self.store
            .transition(settlement_ref, state)
            .await
            .map(|_| ())
            .map_err(|e| DeliveryError::Rejected {
                status: e.class().http_status(),
                body: e.to_string(),
            })
    }
}

#[tokio::test(start_paused = true)]
async fn test_two_failures_then_accepted() {
    let (ledger, _) = ledger();
    let request = ledger
        .create_request(new_request(1, 30), parse_ether("1").unwrap())
        .await
        .unwrap();

    let store = memory_store();
    tracked_in_state(&store, &request.settlement_ref, order(Some(30)), RequestState::Pending).await;

    let sink = FlakyStoreSink::new(store.clone(), 2);
    let bridge = SyncBridge::new(sink.clone(), RetryPolicy::default());

    ledger.confirm_request(owner(), request.id).await.unwrap();
    let started = tokio::time::Instant::now();
    let delivery = bridge
        .notify_state_change(&request.settlement_ref, RequestState::Accepted)
        .await
        .unwrap();

    assert_eq!(delivery.attempts, 3);
    assert_eq!(started.elapsed(), Duration::from_secs(3));

    let record = store.find_by_ref(&request.settlement_ref).await.unwrap().unwrap();
    assert_eq!(record.state, RequestState::Accepted);
    let on_ledger = ledger.get_request(request.id).await.unwrap();
    assert_eq!(on_ledger.status, RequestStatus::Confirmed);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_delivery_leaves_ledger_standing() {
    let (ledger, rail) = ledger();
    let request = ledger
        .create_request(new_request(1, 30), parse_ether("1").unwrap())
        .await
        .unwrap();
    ledger.cancel_request(owner(), request.id, "capacity gone").await.unwrap();

    let store = memory_store();
    tracked_in_state(&store, &request.settlement_ref, order(Some(30)), RequestState::Pending).await;
    let sink = FlakyStoreSink::new(store.clone(), u32::MAX);
    let bridge = SyncBridge::new(sink.clone(), RetryPolicy::default());

    let err = bridge
        .notify_state_change(&request.settlement_ref, RequestState::Rejected)
        .await
        .unwrap_err();
    match err {
        SyncDeliveryError::Exhausted { attempts, last_error, .. } => {
            assert_eq!(attempts, 4);
            assert!(matches!(last_error, DeliveryError::Rejected { status: 503, .. }));
        }
        other => panic!("unexpected {:?}", other),
    }

    assert_eq!(sink.attempts.lock().len(), 4);
    let record = store.find_by_ref(&request.settlement_ref).await.unwrap().unwrap();
    assert_eq!(record.state, RequestState::Pending);
    assert_eq!(
        ledger.get_request(request.id).await.unwrap().status,
        RequestStatus::Cancelled
    );
    assert_eq!(rail.balance_of(tenant()), parse_ether("1").unwrap());
}

#[tokio::test]
async fn test_duplicate_delivery_is_idempotent() {
    let store = memory_store();
    tracked_in_state(&store, "0xdup", order(None), RequestState::Pending).await;
    let sink = FlakyStoreSink::new(store.clone(), 0);
    let bridge = SyncBridge::new(sink, RetryPolicy::none());

    bridge.notify_state_change("0xdup", RequestState::Rejected).await.unwrap();
    let first = store.find_by_ref("0xdup").await.unwrap().unwrap();
    bridge.notify_state_change("0xdup", RequestState::Rejected).await.unwrap();
    let second = store.find_by_ref("0xdup").await.unwrap().unwrap();

    assert_eq!(second.state, RequestState::Rejected);
    assert_eq!(first.updated_at, second.updated_at);
    let again = store.transition("0xdup", RequestState::Rejected).await.unwrap();
    assert_eq!(again.outcome, TransitionOutcome::Unchanged);
}

/// Takes `latency` per call and fails the first call for `fail_once`
struct SlowSink {
    latency: Duration,
    fail_once: Mutex<Option<String>>,
    active: Mutex<HashMap<String, u32>>,
    max_active: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<(String, RequestState, tokio::time::Instant, tokio::time::Instant)>>,
}

impl SlowSink {
    fn new(latency: Duration, fail_once: &str) -> Arc<Self> {
        Arc::new(Self {
            latency,
            fail_once: Mutex::new(Some(fail_once.to_string())),
            active: Mutex::new(HashMap::new()),
            max_active: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls_for(&self, settlement_ref: &str) -> Vec<(RequestState, tokio::time::Instant, tokio::time::Instant)> {
        self.calls
            .lock()
            .iter()
            .filter(|(r, ..)| r == settlement_ref)
            .map(|(_, state, start, end)| (*state, *start, *end))
            .collect()
    }
}

#[async_trait]
impl StateSink for SlowSink {
    async fn deliver(&self, settlement_ref: &str, state: RequestState) -> Result<(), DeliveryError> {
        let started = tokio::time::Instant::now();
        {
            let mut active = self.active.lock();
            let count = active.entry(settlement_ref.to_string()).or_insert(0);
            *count += 1;
            let mut max_active = self.max_active.lock();
            let max = max_active.entry(settlement_ref.to_string()).or_insert(0);
            *max = (*max).max(*count);
        }

        tokio::time::sleep(self.latency).await;

        if let Some(count) = self.active.lock().get_mut(settlement_ref) {
            *count -= 1;
        }
        self.calls
            .lock()
            .push((settlement_ref.to_string(), state, started, tokio::time::Instant::now()));

        let mut fail_once = self.fail_once.lock();
        if fail_once.as_deref() == Some(settlement_ref) {
            *fail_once = None;
            return Err(DeliveryError::Transport("connection reset".to_string()));
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_same_reference_serialised_other_references_concurrent() {
    let sink = SlowSink::new(Duration::from_millis(500), "0xa");
    let bridge = Arc::new(SyncBridge::new(sink.clone(), RetryPolicy::default()));

    let first = bridge.spawn_notification("0xa", RequestState::Accepted);
    let second = bridge.spawn_notification("0xa", RequestState::Completed);
    let other = bridge.spawn_notification("0xb", RequestState::Rejected);

    // 0xa failed at 500ms and backs off until 1.5s while holding its turn
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(other.is_finished());
    assert!(!first.is_finished());
    assert!(!second.is_finished());
    assert_eq!(sink.calls_for("0xa").len(), 1);
    assert_eq!(bridge.in_flight(), 1);

    let other = other.join().await.unwrap();
    assert_eq!(other.attempts, 1);
    let first = first.join().await.unwrap();
    let second = second.join().await.unwrap();
    assert_eq!(first.attempts + second.attempts, 3);

    let calls = sink.calls_for("0xa");
    assert_eq!(calls.len(), 3);
    for pair in calls.windows(2) {
        assert!(pair[1].1 >= pair[0].2, "deliveries for one reference overlapped");
    }
    // The notification that hit the failure finished its retry before the other started
    assert_eq!(calls[0].0, calls[1].0);
    assert_ne!(calls[1].0, calls[2].0);
    assert_eq!(sink.max_active.lock().get("0xa"), Some(&1));
    assert_eq!(bridge.in_flight(), 0);
}

#[tokio::test]
async fn test_relay_drives_confirmed_request_to_completed() {
    let node = embedded();
    let created = node.service.create(create_body()).await.unwrap();
    assert_eq!(created.state, RequestState::Pending);
    assert_eq!(created.amount_escrowed, "0.007200000000000000");

    node.ledger
        .confirm_request(owner(), created.ledger_request_id)
        .await
        .unwrap();
    wait_for(&node.service, &created.settlement_ref, RequestState::Completed).await;

    assert_eq!(node.agent.restarts().len(), 1);
    node.bridge.shutdown();
}

#[tokio::test]
async fn test_relay_marks_cancelled_request_rejected() {
    let node = embedded();
    let created = node.service.create(create_body()).await.unwrap();

    node.ledger
        .cancel_request(owner(), created.ledger_request_id, "no capacity")
        .await
        .unwrap();
    wait_for(&node.service, &created.settlement_ref, RequestState::Rejected).await;

    assert!(node.agent.restarts().is_empty());
    node.bridge.shutdown();
}
