use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cloud VM as discovered during one evaluation cycle. Instances are
/// re-enumerated fresh every cycle and are never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Active,
    Shutoff,
    #[serde(untagged)]
    Other(String),
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Active
    }
}

/// Result of one traffic-allowance query.
#[derive(Debug, Clone)]
pub enum TrafficQuery {
    Reading(TrafficReading),
    /// The instance carries no metered traffic package; it is excluded from
    /// shutdown consideration entirely.
    NotApplicable,
}

/// A normalized allowance reading. All figures are in gigabytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficReading {
    pub total_gb: f64,
    pub used_gb: f64,
    pub remaining_gb: f64,
    pub checked_at: DateTime<Utc>,
}

impl TrafficReading {
    pub fn usage_percentage(&self) -> f64 {
        if self.total_gb > 0.0 {
            self.used_gb / self.total_gb * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
    Reboot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Soft,
    Hard,
}

impl PowerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerMode::Soft => "SOFT",
            PowerMode::Hard => "HARD",
        }
    }
}

/// Handle to an asynchronous provider job returned by a power action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Init,
    Running,
    Success,
    Fail,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Fail)
    }
}

/// One observation of a provider job's state.
#[derive(Debug, Clone, Deserialize)]
pub struct JobProbe {
    pub status: JobStatus,
    pub fail_reason: Option<String>,
}
