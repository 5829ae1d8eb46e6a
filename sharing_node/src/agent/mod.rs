//! Network control agent interface.
//!
//! The agent manages one radio element (a gNB) and the endpoints (UEs) it
//! serves. The orchestrator needs three actions from it: restart the element
//! with tenant parameters, list every endpoint and push back endpoint updates.

pub mod client;
pub mod restrictions;

pub use client::AgentClient;
pub use restrictions::add_tac_restriction;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorClass;
use crate::storage::TenantOrder;

/// One entry of an endpoint's forbidden tracking-area list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaiRestriction {
    pub plmn: String,
    #[serde(default)]
    pub areas: Vec<TaiArea>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaiArea {
    #[serde(default)]
    pub tacs: Vec<u32>,
}

/// A UE as the agent reports it.
///
/// Only the fields the orchestrator touches are typed; everything else
/// (keys, algorithms, PDN lists) is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedEndpoint {
    pub imsi: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forbidden_5gs_tais: Option<Vec<TaiRestriction>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ManagedEndpoint {
    pub fn new(imsi: impl Into<String>) -> Self {
        Self {
            imsi: imsi.into(),
            forbidden_5gs_tais: None,
            extra: Map::new(),
        }
    }
}

/// Tenant parameters passed to the element on restart
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TenantConfig {
    pub amf_addr: Option<String>,
    pub nssai: Option<Value>,
    pub plmn: Option<String>,
    pub tac: Option<u32>,
}

impl TenantConfig {
    pub fn from_order(order: &TenantOrder) -> Self {
        Self {
            amf_addr: order.tenant_amf_address(),
            nssai: order.tenant_nssai.clone(),
            plmn: order.tenant_plmn.clone(),
            tac: Some(order.shared_tac),
        }
    }

    /// `PRMT_*` restart parameters; unset values are left out and an empty
    /// set yields `None`
    pub fn action_parameters(&self) -> Option<Value> {
        let mut params = Map::new();
        if let Some(addr) = &self.amf_addr {
            params.insert("PRMT_AMF_ADDR_TENANT".to_string(), Value::from(addr.clone()));
        }
        if let Some(nssai) = &self.nssai {
            params.insert("PRMT_NSSAI_TENANT".to_string(), nssai.clone());
        }
        if let Some(plmn) = &self.plmn {
            params.insert("PRMT_PLMN_TENANT".to_string(), Value::from(plmn.clone()));
        }
        if let Some(tac) = self.tac {
            params.insert("PRMT_TAC_TENANT".to_string(), Value::from(tac));
        }
        (!params.is_empty()).then_some(Value::Object(params))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent unreachable during {action}: {reason}")]
    Transport { action: String, reason: String },

    #[error("Agent rejected {action} with status {status}: {body}")]
    Status {
        action: String,
        status: u16,
        body: String,
    },

    #[error("Malformed agent response to {action}: {reason}")]
    Decode { action: String, reason: String },
}

impl AgentError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::DownstreamConfig
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[async_trait]
pub trait NetworkControlAgent: Send + Sync {
    /// Restart the element; `None` restores the host-only configuration
    async fn restart(&self, tenant: Option<&TenantConfig>) -> Result<()>;

    async fn list_endpoints(&self) -> Result<Vec<ManagedEndpoint>>;

    async fn apply_endpoints(&self, endpoints: &[ManagedEndpoint]) -> Result<()>;
}
