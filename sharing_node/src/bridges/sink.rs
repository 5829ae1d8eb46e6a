//! Delivery targets for ledger state changes.

use async_trait::async_trait;
use log::debug;
use std::time::Duration;

use crate::storage::RequestState;

/// A single failed delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("target answered {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Receives `(settlement reference, state)` updates
#[async_trait]
pub trait StateSink: Send + Sync {
    async fn deliver(&self, settlement_ref: &str, state: RequestState) -> Result<(), DeliveryError>;
}

/// Pushes updates to the middleware state endpoint:
/// `PATCH {base}/api/request/{ref}/{state}`
pub struct HttpStateSink {
    http: reqwest::Client,
    base_url: String,
}

impl HttpStateSink {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, settlement_ref: &str, state: RequestState) -> String {
        format!("{}/api/request/{}/{}", self.base_url, settlement_ref, state.as_path())
    }
}

#[async_trait]
impl StateSink for HttpStateSink {
    async fn deliver(&self, settlement_ref: &str, state: RequestState) -> Result<(), DeliveryError> {
        let url = self.url_for(settlement_ref, state);
        debug!("PATCH {}", url);

        let response = self
            .http
            .patch(&url)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
