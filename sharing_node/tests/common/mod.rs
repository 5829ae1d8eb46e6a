//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::{Address, H256};
use ethers::utils::parse_ether;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sharing_node::agent::{AgentError, ManagedEndpoint, NetworkControlAgent, TenantConfig};
use sharing_node::ledger::{CredentialRegistry, InMemoryRail, NewRequest, PricingRule};
use sharing_node::middleware::{CreateRequest, LocalLedgerGateway, RequestService, ServiceSink};
use sharing_node::storage::{MemoryRequestStore, TenantOrder, TrackedRequest};
use sharing_node::{
    EscrowLedger, LifecycleOrchestrator, RequestLedger, RequestState, RequestStore, RetryPolicy,
    SyncBridge,
};

pub const TENANT_IMSI: &str = "001010000000001";
pub const HOST_IMSIS: [&str; 2] = ["001010000000002", "001010000000003"];

pub fn ledger_address() -> Address {
    Address::repeat_byte(0x5f)
}

pub fn owner() -> Address {
    Address::repeat_byte(0x01)
}

pub fn tenant() -> Address {
    Address::repeat_byte(0x02)
}

/// Ledger at 0.00012 ether per user-minute over an in-memory rail
pub fn ledger() -> (Arc<EscrowLedger>, Arc<InMemoryRail>) {
    let rail = Arc::new(InMemoryRail::new());
    let rate = parse_ether("0.00012").unwrap();
    let ledger = Arc::new(EscrowLedger::new(
        ledger_address(),
        owner(),
        PricingRule::new(rate),
        rail.clone(),
    ));
    (ledger, rail)
}

pub fn new_request(num_users: u32, duration_minutes: u32) -> NewRequest {
    NewRequest {
        requester: tenant(),
        num_users,
        duration_minutes,
        order_digest: H256::repeat_byte(0xaa),
    }
}

pub fn order(duration_mins: Option<u32>) -> TenantOrder {
    TenantOrder {
        contract_address: format!("{:?}", ledger_address()),
        shared_tac: 7,
        ue_imsis: vec![TENANT_IMSI.to_string()],
        duration_mins,
        tenant_plmn: Some("00102".to_string()),
        tenant_amf_ip: Some("10.0.0.1".to_string()),
        tenant_amf_port: Some(38412),
        tenant_nssai: None,
    }
}

/// Insert a record and walk it to `state` under `settlement_ref`
pub async fn tracked_in_state(
    store: &Arc<dyn RequestStore>,
    settlement_ref: &str,
    order: TenantOrder,
    state: RequestState,
) -> TrackedRequest {
    let record = TrackedRequest::new(order);
    let id = record.id.clone();
    store.insert(record).await.unwrap();
    let mut record = store.attach_ref(&id, settlement_ref, 1).await.unwrap();
    if state != RequestState::Pending {
        record = store.transition(settlement_ref, state).await.unwrap().request;
    }
    record
}

pub fn memory_store() -> Arc<dyn RequestStore> {
    Arc::new(MemoryRequestStore::new())
}

/// Middleware with an in-process ledger, relayed through a sync bridge
pub struct Embedded {
    pub ledger: Arc<EscrowLedger>,
    pub service: Arc<RequestService>,
    pub agent: Arc<MockAgent>,
    pub bridge: Arc<SyncBridge>,
}

pub fn embedded() -> Embedded {
    let (ledger, _) = ledger();
    let store = memory_store();
    let agent = MockAgent::with_endpoints();
    let orchestrator = Arc::new(LifecycleOrchestrator::new(store.clone(), agent.clone(), "00101"));

    let mut credentials = CredentialRegistry::default();
    credentials.insert("tenant-token", tenant());
    let gateway = Arc::new(LocalLedgerGateway::new(ledger.clone(), credentials));
    let service = Arc::new(RequestService::new(store, gateway, orchestrator));

    let bridge = Arc::new(SyncBridge::new(
        Arc::new(ServiceSink::new(service.clone())),
        RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100)),
    ));
    bridge.spawn_relay(ledger.subscribe());

    Embedded {
        ledger,
        service,
        agent,
        bridge,
    }
}

pub fn create_body() -> CreateRequest {
    let order = order(None);
    CreateRequest {
        credential: Some("tenant-token".to_string()),
        contract_address: Some(order.contract_address),
        shared_tac: Some(order.shared_tac),
        ue_imsis: Some(order.ue_imsis),
        duration_mins: Some(60),
        tenant_plmn: order.tenant_plmn,
        ..CreateRequest::default()
    }
}

pub async fn wait_for(service: &RequestService, settlement_ref: &str, state: RequestState) {
    for _ in 0..200 {
        let record = service.get(settlement_ref).await.unwrap();
        if record.state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached {}", settlement_ref, state);
}

/// Scripted network control agent
#[derive(Default)]
pub struct MockAgent {
    endpoints: Mutex<Vec<ManagedEndpoint>>,
    restarts: Mutex<Vec<Option<TenantConfig>>>,
    applied: Mutex<Vec<Vec<ManagedEndpoint>>>,
    failures: Mutex<HashMap<&'static str, u32>>,
}

impl MockAgent {
    pub fn with_endpoints() -> Arc<Self> {
        let agent = Self::default();
        {
            let mut endpoints = agent.endpoints.lock();
            endpoints.push(ManagedEndpoint::new(TENANT_IMSI));
            for imsi in HOST_IMSIS {
                endpoints.push(ManagedEndpoint::new(imsi));
            }
        }
        Arc::new(agent)
    }

    /// Fail the next `times` calls of `action`
    /// (`restart`, `get_all_ues` or `update_ues`)
    pub fn fail_next(&self, action: &'static str, times: u32) {
        self.failures.lock().insert(action, times);
    }

    pub fn restarts(&self) -> Vec<Option<TenantConfig>> {
        self.restarts.lock().clone()
    }

    pub fn applied(&self) -> Vec<Vec<ManagedEndpoint>> {
        self.applied.lock().clone()
    }

    pub fn endpoint(&self, imsi: &str) -> Option<ManagedEndpoint> {
        self.endpoints.lock().iter().find(|e| e.imsi == imsi).cloned()
    }

    fn check(&self, action: &'static str) -> Result<(), AgentError> {
        let mut failures = self.failures.lock();
        match failures.get_mut(action) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(AgentError::Status {
                    action: action.to_string(),
                    status: 503,
                    body: "agent busy".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl NetworkControlAgent for MockAgent {
    async fn restart(&self, tenant: Option<&TenantConfig>) -> Result<(), AgentError> {
        self.check("restart")?;
        self.restarts.lock().push(tenant.cloned());
        Ok(())
    }

    async fn list_endpoints(&self) -> Result<Vec<ManagedEndpoint>, AgentError> {
        self.check("get_all_ues")?;
        Ok(self.endpoints.lock().clone())
    }

    async fn apply_endpoints(&self, endpoints: &[ManagedEndpoint]) -> Result<(), AgentError> {
        self.check("update_ues")?;
        let mut current = self.endpoints.lock();
        for update in endpoints {
            match current.iter_mut().find(|e| e.imsi == update.imsi) {
                Some(existing) => *existing = update.clone(),
                None => current.push(update.clone()),
            }
        }
        self.applied.lock().push(endpoints.to_vec());
        Ok(())
    }
}
