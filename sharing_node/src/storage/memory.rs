use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{
    RequestState, RequestStore, Result, StorageError, TrackedRequest, Transition,
};
use crate::agent::ManagedEndpoint;

#[derive(Default)]
struct Tables {
    requests: HashMap<String, TrackedRequest>,
    refs: HashMap<String, String>,
}

/// In-memory request store
#[derive(Default)]
pub struct MemoryRequestStore {
    tables: RwLock<Tables>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update_by_ref<F, T>(&self, settlement_ref: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut TrackedRequest) -> Result<T>,
    {
        let mut tables = self.tables.write();
        let id = tables
            .refs
            .get(settlement_ref)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(settlement_ref.to_string()))?;
        let request = tables
            .requests
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(settlement_ref.to_string()))?;

        // Work on a copy so a failed update leaves the record untouched
        let mut updated = request.clone();
        let out = f(&mut updated)?;
        *request = updated;
        Ok(out)
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn insert(&self, request: TrackedRequest) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.requests.contains_key(&request.id) {
            return Err(StorageError::Duplicate(request.id));
        }
        if let Some(settlement_ref) = &request.settlement_ref {
            if tables.refs.contains_key(settlement_ref) {
                return Err(StorageError::ReferenceTaken(settlement_ref.clone()));
            }
            tables.refs.insert(settlement_ref.clone(), request.id.clone());
        }
        tables.requests.insert(request.id.clone(), request);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<TrackedRequest>> {
        Ok(self.tables.read().requests.get(id).cloned())
    }

    async fn find_by_ref(&self, settlement_ref: &str) -> Result<Option<TrackedRequest>> {
        let tables = self.tables.read();
        Ok(tables
            .refs
            .get(settlement_ref)
            .and_then(|id| tables.requests.get(id))
            .cloned())
    }

    async fn attach_ref(
        &self,
        id: &str,
        settlement_ref: &str,
        ledger_request_id: u64,
    ) -> Result<TrackedRequest> {
        let mut tables = self.tables.write();
        if let Some(owner) = tables.refs.get(settlement_ref) {
            if owner != id {
                return Err(StorageError::ReferenceTaken(settlement_ref.to_string()));
            }
        }

        let request = tables
            .requests
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        let mut updated = request.clone();
        updated.attach(settlement_ref, ledger_request_id)?;
        *request = updated.clone();

        tables.refs.insert(settlement_ref.to_string(), id.to_string());
        Ok(updated)
    }

    async fn transition(&self, settlement_ref: &str, to: RequestState) -> Result<Transition> {
        self.update_by_ref(settlement_ref, |request| {
            let outcome = request.apply(to)?;
            Ok(Transition {
                outcome,
                request: request.clone(),
            })
        })
    }

    async fn record_original_endpoints(
        &self,
        settlement_ref: &str,
        endpoints: Vec<ManagedEndpoint>,
    ) -> Result<TrackedRequest> {
        self.update_by_ref(settlement_ref, |request| {
            if request.original_endpoints.is_none() {
                request.original_endpoints = Some(endpoints);
            }
            Ok(request.clone())
        })
    }

    async fn list(&self) -> Result<Vec<TrackedRequest>> {
        let mut requests: Vec<TrackedRequest> =
            self.tables.read().requests.values().cloned().collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(requests)
    }
}
