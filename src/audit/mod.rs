use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

/// One append-only audit record. Records are write-once and timestamped at
/// emission; no component ever updates another's rows.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum AuditRecord {
    Monitor(MonitorLogRecord),
    Shutdown(ShutdownLogRecord),
    Notification(NotificationLogRecord),
}

/// Outcome of one traffic evaluation for one instance.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorLogRecord {
    pub account_id: i64,
    pub instance_id: Option<String>,
    pub instance_name: Option<String>,
    pub traffic_total_gb: Option<f64>,
    pub traffic_used_gb: Option<f64>,
    pub traffic_remaining_gb: Option<f64>,
    pub usage_percentage: Option<f64>,
    pub threshold_gb: f64,
    pub is_below_threshold: bool,
    pub message: String,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Terminal state of one shutdown job.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownLogRecord {
    pub job_id: Uuid,
    pub account_id: i64,
    pub instance_id: String,
    pub instance_name: String,
    pub reason: String,
    pub status: String,
    pub provider_job_id: Option<String>,
    pub attempt_count: u32,
    pub traffic_remaining_gb: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
}

/// One webhook delivery attempt.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationLogRecord {
    pub account_id: i64,
    pub event: String,
    pub attempt: u32,
    pub status: String,
    pub response_code: Option<u16>,
    pub error_message: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Append-only sink for audit records. Sink failures are contained and
/// logged; the emitting task never fails because an audit write did.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord);
}

/// Collects records in memory. Used by tests and available as a null sink.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn monitor_records(&self) -> Vec<MonitorLogRecord> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                AuditRecord::Monitor(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn shutdown_records(&self) -> Vec<ShutdownLogRecord> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                AuditRecord::Shutdown(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn notification_records(&self) -> Vec<NotificationLogRecord> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                AuditRecord::Notification(n) => Some(n),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: AuditRecord) {
        self.records.lock().unwrap().push(record);
    }
}

/// Appends one JSON line per record to a file.
pub struct JsonlAuditSink {
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, record: AuditRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to serialize audit record.");
                return;
            }
        };
        let mut file = self.file.lock().unwrap();
        if let Err(e) = writeln!(file, "{line}") {
            error!(error = %e, "Failed to append audit record.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_record() -> MonitorLogRecord {
        MonitorLogRecord {
            account_id: 1,
            instance_id: Some("srv-1".to_string()),
            instance_name: Some("web-1".to_string()),
            traffic_total_gb: Some(100.0),
            traffic_used_gb: Some(92.0),
            traffic_remaining_gb: Some(8.0),
            usage_percentage: Some(92.0),
            threshold_gb: 10.0,
            is_below_threshold: true,
            message: "traffic below threshold".to_string(),
            error_message: None,
            checked_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn jsonl_sink_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("fluxwatch.jsonl");
        let sink = JsonlAuditSink::open(&path).unwrap();

        sink.append(AuditRecord::Monitor(monitor_record())).await;
        sink.append(AuditRecord::Monitor(monitor_record())).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["record"], "monitor");
        assert_eq!(parsed["account_id"], 1);
    }
}
