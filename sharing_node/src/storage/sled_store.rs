//! Sled-backed request store.
//!
//! Records are stored as JSON in the `requests` tree keyed by id; the `refs`
//! tree maps each settlement reference to its record id. A record and its
//! index entry are written in one transaction.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;

use super::{RequestState, RequestStore, Result, StorageError, TrackedRequest, Transition};
use crate::agent::ManagedEndpoint;

const REQUESTS_TREE: &str = "requests";
const REFS_TREE: &str = "refs";

/// Persistent request store
pub struct SledRequestStore {
    db: sled::Db,
    requests: sled::Tree,
    refs: sled::Tree,
    /// Serialises read-modify-write cycles; reads go straight to the trees
    write_lock: Mutex<()>,
}

fn backend(context: &str, e: sled::Error) -> StorageError {
    StorageError::Backend(format!("{}: {}", context, e))
}

impl SledRequestStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path).map_err(|e| backend("Failed to open sled db", e))?;
        let requests = db
            .open_tree(REQUESTS_TREE)
            .map_err(|e| backend("Failed to open requests tree", e))?;
        let refs = db
            .open_tree(REFS_TREE)
            .map_err(|e| backend("Failed to open refs tree", e))?;

        Ok(Self {
            db,
            requests,
            refs,
            write_lock: Mutex::new(()),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| backend("Failed to flush db", e))?;
        Ok(())
    }

    fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn load(&self, id: &str) -> Result<Option<TrackedRequest>> {
        match self
            .requests
            .get(id.as_bytes())
            .map_err(|e| backend("Failed to read request", e))?
        {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn id_for_ref(&self, settlement_ref: &str) -> Result<Option<String>> {
        Ok(self
            .refs
            .get(settlement_ref.as_bytes())
            .map_err(|e| backend("Failed to read ref index", e))?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn store(&self, request: &TrackedRequest) -> Result<()> {
        self.requests
            .insert(request.id.as_bytes(), Self::serialize(request)?)
            .map_err(|e| backend("Failed to write request", e))?;
        Ok(())
    }

    /// Write `request` and point `settlement_ref` at it, atomically
    fn store_indexed(&self, request: &TrackedRequest, settlement_ref: &str) -> Result<()> {
        let value = Self::serialize(request)?;
        (&self.requests, &self.refs)
            .transaction(|(requests, refs)| {
                requests.insert(request.id.as_bytes(), value.as_slice())?;
                refs.insert(settlement_ref.as_bytes(), request.id.as_bytes())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => backend("Failed to write request and ref index", e),
                TransactionError::Abort(()) => {
                    StorageError::Backend("request write aborted".to_string())
                }
            })
    }

    fn update_by_ref<F, T>(&self, settlement_ref: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut TrackedRequest) -> Result<T>,
    {
        let _guard = self.write_lock.lock();
        let id = self
            .id_for_ref(settlement_ref)?
            .ok_or_else(|| StorageError::NotFound(settlement_ref.to_string()))?;
        let mut request = self
            .load(&id)?
            .ok_or_else(|| StorageError::NotFound(settlement_ref.to_string()))?;

        let out = f(&mut request)?;
        self.store(&request)?;
        Ok(out)
    }
}

#[async_trait]
impl RequestStore for SledRequestStore {
    async fn insert(&self, request: TrackedRequest) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.load(&request.id)?.is_some() {
            return Err(StorageError::Duplicate(request.id));
        }
        match &request.settlement_ref {
            Some(settlement_ref) => {
                if self.id_for_ref(settlement_ref)?.is_some() {
                    return Err(StorageError::ReferenceTaken(settlement_ref.clone()));
                }
                self.store_indexed(&request, settlement_ref)
            }
            None => self.store(&request),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<TrackedRequest>> {
        self.load(id)
    }

    async fn find_by_ref(&self, settlement_ref: &str) -> Result<Option<TrackedRequest>> {
        match self.id_for_ref(settlement_ref)? {
            Some(id) => self.load(&id),
            None => Ok(None),
        }
    }

    async fn attach_ref(
        &self,
        id: &str,
        settlement_ref: &str,
        ledger_request_id: u64,
    ) -> Result<TrackedRequest> {
        let _guard = self.write_lock.lock();
        if let Some(owner) = self.id_for_ref(settlement_ref)? {
            if owner != id {
                return Err(StorageError::ReferenceTaken(settlement_ref.to_string()));
            }
        }

        let mut request = self
            .load(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        request.attach(settlement_ref, ledger_request_id)?;

        self.store_indexed(&request, settlement_ref)?;
        Ok(request)
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
        let mut requests = Vec::new();
        for item in self.requests.iter() {
            let (_, bytes) = item.map_err(|e| backend("Failed to iterate requests", e))?;
            requests.push(Self::deserialize::<TrackedRequest>(&bytes)?);
        }
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(requests)
    }
}
