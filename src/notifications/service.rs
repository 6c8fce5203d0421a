use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::audit::{AuditRecord, AuditSink, NotificationLogRecord};
use crate::policy::EffectivePolicy;

use super::models::{render, NotificationEvent};
use super::senders::NotificationSender;

#[derive(Debug, Clone)]
pub struct NotifierSettings {
    /// Base delay between delivery retries; backoff is linear in the retry
    /// number.
    pub retry_delay: Duration,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
        }
    }
}

/// Terminal outcome of one notification dispatch, after retries.
#[derive(Debug, Clone)]
pub struct NotificationAttempt {
    pub event_kind: &'static str,
    pub status: AttemptStatus,
    pub retry_count: u32,
    pub response_code: Option<u16>,
}

/// Renders events and delivers them to the account's webhook target with a
/// bounded retry budget. Delivery failure never escalates past this
/// service; the action being reported has already been carried out or
/// recorded independently.
pub struct NotificationService {
    sender: Arc<dyn NotificationSender>,
    audit: Arc<dyn AuditSink>,
    settings: NotifierSettings,
}

impl NotificationService {
    pub fn new(sender: Arc<dyn NotificationSender>, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_settings(sender, audit, NotifierSettings::default())
    }

    pub fn with_settings(
        sender: Arc<dyn NotificationSender>,
        audit: Arc<dyn AuditSink>,
        settings: NotifierSettings,
    ) -> Self {
        Self {
            sender,
            audit,
            settings,
        }
    }

    async fn log_attempt(
        &self,
        account_id: i64,
        event: &'static str,
        attempt: u32,
        status: AttemptStatus,
        response_code: Option<u16>,
        error_message: Option<String>,
    ) {
        self.audit
            .append(AuditRecord::Notification(NotificationLogRecord {
                account_id,
                event: event.to_string(),
                attempt,
                status: status.as_str().to_string(),
                response_code,
                error_message,
                sent_at: Utc::now(),
            }))
            .await;
    }

    /// Delivers one event. The initial attempt plus `policy.retry_times`
    /// retries with linear backoff; every attempt is audited.
    pub async fn dispatch(
        &self,
        account_id: i64,
        policy: &EffectivePolicy,
        event: NotificationEvent,
    ) -> NotificationAttempt {
        let kind = event.kind();

        let Some(url) = policy.webhook_url.as_deref() else {
            warn!(account_id, event = kind, "No webhook target configured, dropping notification.");
            self.log_attempt(
                account_id,
                kind,
                0,
                AttemptStatus::Failed,
                None,
                Some("no webhook target configured".to_string()),
            )
            .await;
            return NotificationAttempt {
                event_kind: kind,
                status: AttemptStatus::Failed,
                retry_count: 0,
                response_code: None,
            };
        };

        let card = match render(&event) {
            Ok(card) => card,
            Err(e) => {
                error!(account_id, event = kind, error = %e, "Failed to render notification card.");
                self.log_attempt(
                    account_id,
                    kind,
                    0,
                    AttemptStatus::Failed,
                    None,
                    Some(format!("render failed: {e}")),
                )
                .await;
                return NotificationAttempt {
                    event_kind: kind,
                    status: AttemptStatus::Failed,
                    retry_count: 0,
                    response_code: None,
                };
            }
        };

        let mut last_code = None;
        for retry in 0..=policy.retry_times {
            match self.sender.send(url, &card).await {
                Ok(code) => {
                    debug!(account_id, event = kind, retry, "Notification delivered.");
                    self.log_attempt(
                        account_id,
                        kind,
                        retry + 1,
                        AttemptStatus::Success,
                        Some(code),
                        None,
                    )
                    .await;
                    return NotificationAttempt {
                        event_kind: kind,
                        status: AttemptStatus::Success,
                        retry_count: retry,
                        response_code: Some(code),
                    };
                }
                Err(e) => {
                    last_code = e.response_code();
                    warn!(
                        account_id,
                        event = kind,
                        attempt = retry + 1,
                        error = %e,
                        "Notification delivery attempt failed."
                    );
                    self.log_attempt(
                        account_id,
                        kind,
                        retry + 1,
                        AttemptStatus::Failed,
                        last_code,
                        Some(e.to_string()),
                    )
                    .await;
                    if retry < policy.retry_times {
                        tokio::time::sleep(self.settings.retry_delay * (retry + 1)).await;
                    }
                }
            }
        }

        error!(
            account_id,
            event = kind,
            retries = policy.retry_times,
            "Notification delivery failed after exhausting retries."
        );
        NotificationAttempt {
            event_kind: kind,
            status: AttemptStatus::Failed,
            retry_count: policy.retry_times,
            response_code: last_code,
        }
    }
}
