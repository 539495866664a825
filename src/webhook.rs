// webhook.rs - Webhook Dispatcher
//
//! Best-effort push of "new message" events to an agent's callback URL.
//! Each POST runs on its own task; failures are logged and dropped.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::WebhookConfig;
use crate::observability::record_webhook;

/// Webhook errors
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Callback answered HTTP {0}")]
    Status(u16),
}

/// Body posted to the callback URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    pub msg_uid: String,
    pub pw_did: String,
}

/// Posts new-message events over a shared keep-alive client
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: Option<reqwest::Client>,
}

impl WebhookDispatcher {
    pub fn new(config: &WebhookConfig) -> Result<Self, WebhookError> {
        if !config.enabled {
            return Ok(Self::disabled());
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.response_timeout_ms))
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;

        Ok(Self {
            client: Some(client),
        })
    }

    /// A dispatcher that never sends anything
    pub fn disabled() -> Self {
        Self { client: None }
    }

    /// Send the event in the background
    pub fn dispatch(&self, url: &str, event: NewMessageEvent) {
        let Some(client) = self.client.clone() else {
            debug!(url, "Webhooks disabled, dropping event");
            return;
        };
        let url = url.to_string();

        tokio::spawn(async move {
            match post(&client, &url, &event).await {
                Ok(()) => {
                    debug!(url, msg_uid = %event.msg_uid, "Webhook delivered");
                    record_webhook(true);
                }
                Err(e) => {
                    warn!(url, msg_uid = %event.msg_uid, error = %e, "Webhook delivery failed");
                    record_webhook(false);
                }
            }
        });
    }
}

async fn post(client: &reqwest::Client, url: &str, event: &NewMessageEvent) -> Result<(), WebhookError> {
    let response = client
        .post(url)
        .json(event)
        .send()
        .await
        .map_err(|e| WebhookError::Request(e.to_string()))?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(WebhookError::Status(response.status().as_u16()))
    }
}
