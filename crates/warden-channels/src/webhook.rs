use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::Sha256;
use tracing::debug;

use warden_core::config::WebhookTarget;
use warden_core::types::AlertEvent;

use crate::{
    channel::NotificationChannel,
    error::{ChannelError, DeliveryError, Result},
};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>` over the raw JSON body.
pub const SIGNATURE_HEADER: &str = "X-Warden-Signature";

/// POSTs each alert event as JSON to an HTTP endpoint.
pub struct WebhookChannel {
    name: String,
    url: reqwest::Url,
    secret: Option<String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(target: &WebhookTarget) -> Result<Self> {
        let url = reqwest::Url::parse(&target.url).map_err(|e| {
            ChannelError::ConfigError(format!("webhook '{}' has invalid url: {e}", target.name))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ChannelError::ConfigError(format!(
                "webhook '{}' must use http or https",
                target.name
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(target.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            name: target.name.clone(),
            url,
            secret: target.secret.clone().filter(|s| !s.is_empty()),
            client,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &AlertEvent) -> std::result::Result<(), DeliveryError> {
        let body = serde_json::to_vec(event)
            .map_err(|e| DeliveryError::Permanent(format!("cannot encode event: {e}")))?;

        let mut req = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.secret {
            req = req.header(SIGNATURE_HEADER, sign(secret, &body));
        }

        let resp = req.body(body).send().await.map_err(classify_error)?;
        let status = resp.status();
        debug!(channel = %self.name, status = status.as_u16(), "webhook responded");
        classify_status(status)
    }
}

/// `sha256=<hex>` HMAC-SHA256 of `body` keyed with `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length, so this never fails.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// 2xx delivers. 408, 429 and 5xx are worth retrying; any other 4xx
/// means the receiver will never accept this payload.
fn classify_status(status: StatusCode) -> std::result::Result<(), DeliveryError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(DeliveryError::Transient(format!("HTTP {status}")))
    } else {
        Err(DeliveryError::Permanent(format!("HTTP {status}")))
    }
}

fn classify_error(e: reqwest::Error) -> DeliveryError {
    if e.is_builder() {
        DeliveryError::Permanent(e.to_string())
    } else {
        DeliveryError::Transient(e.to_string())
    }
}
