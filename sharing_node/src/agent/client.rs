//! HTTP client for the network control agent.
//!
//! Every action is a `PATCH {agent}/resource/{gnb_id}` carrying an
//! `activation_feature` document:
//!
//! ```json
//! {"activation_feature": [{
//!     "name": "gNodeB_service",
//!     "feature_characteristic": [
//!         {"name": "action", "value": {"value": "restart"}},
//!         {"name": "action_parameters", "value": {"value": {...}}}
//!     ]
//! }]}
//! ```

use async_trait::async_trait;
use log::{debug, error, info};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{AgentError, ManagedEndpoint, NetworkControlAgent, Result, TenantConfig};
use crate::config::AgentConfig;

const ACTION_RESTART: &str = "restart";
const ACTION_GET_ALL_UES: &str = "get_all_ues";
const ACTION_UPDATE_UES: &str = "update_ues";

#[derive(Deserialize)]
struct EndpointList {
    #[serde(default)]
    ues: Vec<ManagedEndpoint>,
}

/// Build the activation document for `action`
pub fn activation_payload(feature: &str, action: &str, parameters: Option<Value>) -> Value {
    let mut characteristics = vec![json!({"name": "action", "value": {"value": action}})];
    if let Some(parameters) = parameters {
        characteristics.push(json!({"name": "action_parameters", "value": {"value": parameters}}));
    }
    json!({
        "activation_feature": [{
            "name": feature,
            "feature_characteristic": characteristics
        }]
    })
}

pub struct AgentClient {
    http: reqwest::Client,
    resource_url: String,
    feature_name: String,
}

impl AgentClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AgentError::Transport {
                action: "init".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            http,
            resource_url: format!("{}/resource/{}", config.url.trim_end_matches('/'), config.gnb_id),
            feature_name: config.feature_name.clone(),
        })
    }

    pub fn resource_url(&self) -> &str {
        &self.resource_url
    }

    async fn call(&self, action: &str, parameters: Option<Value>) -> Result<reqwest::Response> {
        info!("Sending action '{}' to {}", action, self.resource_url);
        debug!("Action '{}' parameters: {:?}", action, parameters);

        let response = self
            .http
            .patch(&self.resource_url)
            .json(&activation_payload(&self.feature_name, action, parameters))
            .send()
            .await
            .map_err(|e| {
                error!("Failed to call agent at {}: {}", self.resource_url, e);
                AgentError::Transport {
                    action: action.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Agent answered '{}' with status {}", action, status);
            return Err(AgentError::Status {
                action: action.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl NetworkControlAgent for AgentClient {
    async fn restart(&self, tenant: Option<&TenantConfig>) -> Result<()> {
        let parameters = tenant.and_then(TenantConfig::action_parameters);
        self.call(ACTION_RESTART, parameters).await?;
        Ok(())
    }

    async fn list_endpoints(&self) -> Result<Vec<ManagedEndpoint>> {
        let response = self.call(ACTION_GET_ALL_UES, None).await?;
        let list: EndpointList = response.json().await.map_err(|e| AgentError::Decode {
            action: ACTION_GET_ALL_UES.to_string(),
            reason: e.to_string(),
        })?;
        Ok(list.ues)
    }

    async fn apply_endpoints(&self, endpoints: &[ManagedEndpoint]) -> Result<()> {
        let parameters = serde_json::to_value(endpoints).map_err(|e| AgentError::Decode {
            action: ACTION_UPDATE_UES.to_string(),
            reason: e.to_string(),
        })?;
        self.call(ACTION_UPDATE_UES, Some(parameters)).await?;
        Ok(())
    }
}
