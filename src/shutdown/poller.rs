use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cloud::{CloudClient, JobHandle, JobStatus};
use crate::policy::Account;

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_attempts: 60,
        }
    }
}

/// Terminal result of tracking one provider job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed { reason: String },
    Cancelled,
}

/// Tracks one asynchronous provider job to a terminal state. One poller
/// call exists per in-flight job; cancellation is observed within one poll
/// interval.
pub struct JobPoller {
    cloud: Arc<dyn CloudClient>,
    settings: PollerSettings,
}

impl JobPoller {
    pub fn new(cloud: Arc<dyn CloudClient>, settings: PollerSettings) -> Self {
        Self { cloud, settings }
    }

    pub async fn wait_for_completion(
        &self,
        account: &Account,
        job: &JobHandle,
        cancel: &mut watch::Receiver<bool>,
    ) -> JobOutcome {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut attempts = 0u32;

        loop {
            tokio::select! {
                changed = cancel.changed() => {
                    // A closed channel means the owner is gone; stop either way.
                    if changed.is_err() || *cancel.borrow() {
                        debug!(job_id = %job.id, "Job polling cancelled.");
                        return JobOutcome::Cancelled;
                    }
                }
                _ = ticker.tick() => {
                    attempts += 1;
                    match self.cloud.poll_job(account, job).await {
                        Ok(probe) => match probe.status {
                            JobStatus::Success => {
                                debug!(job_id = %job.id, attempts, "Provider job succeeded.");
                                return JobOutcome::Succeeded;
                            }
                            JobStatus::Fail => {
                                let reason = probe
                                    .fail_reason
                                    .unwrap_or_else(|| "unknown provider failure".to_string());
                                return JobOutcome::Failed { reason };
                            }
                            JobStatus::Init | JobStatus::Running => {
                                debug!(job_id = %job.id, attempts, "Provider job still running.");
                            }
                        },
                        // Transient poll errors consume attempts like normal
                        // polls, bounding total wall-clock exposure.
                        Err(e) if e.is_transient() => {
                            warn!(job_id = %job.id, attempts, error = %e, "Transient error polling job.");
                        }
                        Err(e) => {
                            return JobOutcome::Failed {
                                reason: format!("job status query failed: {e}"),
                            };
                        }
                    }
                    if attempts >= self.settings.max_attempts {
                        warn!(
                            job_id = %job.id,
                            attempts,
                            "Job did not reach a terminal status within the attempt ceiling."
                        );
                        return JobOutcome::Failed {
                            reason: "timeout".to_string(),
                        };
                    }
                }
            }
        }
    }
}
