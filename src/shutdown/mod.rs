use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod orchestrator;
pub mod poller;

pub use orchestrator::{OrchestratorSettings, ShutdownOrchestrator};
pub use poller::{JobOutcome, JobPoller, PollerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    Pending,
    Delaying,
    Submitting,
    Submitted,
    Polling,
    Succeeded,
    Failed,
    Skipped,
}

impl ShutdownStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownStatus::Pending => "pending",
            ShutdownStatus::Delaying => "delaying",
            ShutdownStatus::Submitting => "submitting",
            ShutdownStatus::Submitted => "submitted",
            ShutdownStatus::Polling => "polling",
            ShutdownStatus::Succeeded => "succeeded",
            ShutdownStatus::Failed => "failed",
            ShutdownStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShutdownStatus::Succeeded | ShutdownStatus::Failed | ShutdownStatus::Skipped
        )
    }
}

/// One in-flight power-off attempt. Owned exclusively by its orchestrator
/// task until it reaches a terminal status, at which point it becomes an
/// immutable audit record.
#[derive(Debug, Clone)]
pub struct ShutdownJob {
    pub id: Uuid,
    pub account_id: i64,
    pub instance_id: String,
    pub instance_name: String,
    pub reason: String,
    pub status: ShutdownStatus,
    pub provider_job_id: Option<String>,
    pub attempt_count: u32,
    pub traffic_remaining_gb: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ShutdownJob {
    pub fn new(
        account_id: i64,
        instance_id: String,
        instance_name: String,
        reason: String,
        traffic_remaining_gb: Option<f64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            instance_id,
            instance_name,
            reason,
            status: ShutdownStatus::Pending,
            provider_job_id: None,
            attempt_count: 0,
            traffic_remaining_gb,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}
