use async_trait::async_trait;
use thiserror::Error;

use super::models::CardMessage;

pub mod webhook;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("delivery rejected ({status:?}): {message}")]
    Rejected { status: Option<u16>, message: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl SenderError {
    pub fn response_code(&self) -> Option<u16> {
        match self {
            SenderError::Rejected { status, .. } => *status,
            SenderError::Network(e) => e.status().map(|s| s.as_u16()),
        }
    }
}

/// Delivery boundary for rendered notifications. Returns the HTTP status
/// code on acceptance.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, url: &str, message: &CardMessage) -> Result<u16, SenderError>;
}
