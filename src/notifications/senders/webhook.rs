use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::Deserialize;

use crate::notifications::models::CardMessage;

use super::{NotificationSender, SenderError};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(WEBHOOK_TIMEOUT)
        .build()
        .expect("failed to build webhook HTTP client")
});

/// Some webhook sinks answer 200 with an application-level error envelope;
/// a non-zero `code` is a rejection.
#[derive(Deserialize)]
struct WebhookAck {
    code: i64,
    msg: Option<String>,
}

/// Posts interactive-card payloads to a webhook URL.
pub struct WebhookSender;

impl WebhookSender {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    async fn send(&self, url: &str, message: &CardMessage) -> Result<u16, SenderError> {
        let response = HTTP_CLIENT.post(url).json(message).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(SenderError::Rejected {
                status: Some(status.as_u16()),
                message: body,
            });
        }

        if let Ok(ack) = serde_json::from_str::<WebhookAck>(&body) {
            if ack.code != 0 {
                return Err(SenderError::Rejected {
                    status: Some(status.as_u16()),
                    message: ack.msg.unwrap_or_else(|| format!("webhook code {}", ack.code)),
                });
            }
        }

        Ok(status.as_u16())
    }
}
