use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditRecord, AuditSink, ShutdownLogRecord};
use crate::cloud::{
    CloudClient, Instance, PowerAction, PowerMode, TrafficQuery, TrafficReading,
};
use crate::notifications::{InstanceContext, NotificationEvent, NotificationService};
use crate::policy::{Account, ConfigStore, EffectivePolicy, PolicyResolver};

use super::poller::{JobOutcome, JobPoller, PollerSettings};
use super::{ShutdownJob, ShutdownStatus};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Base for the exponential submission backoff; doubled per attempt
    /// with ±50% jitter.
    pub submit_backoff_base: Duration,
    pub poller: PollerSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            submit_backoff_base: Duration::from_secs(1),
            poller: PollerSettings::default(),
        }
    }
}

type ClaimKey = (i64, String);

/// Releases the (account, instance) claim when the owning task finishes,
/// whatever path it took.
struct ClaimGuard {
    claims: Arc<DashMap<ClaimKey, uuid::Uuid>>,
    key: ClaimKey,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claims.remove(&self.key);
    }
}

enum Recheck {
    Proceed(TrafficReading, EffectivePolicy),
    Skip(String),
}

/// Drives one shutdown decision from detection to a terminal state:
/// `Detected -> (Skipped | Delaying) -> Submitting -> Submitted -> Polling
/// -> Succeeded | Failed`. At most one open job exists per
/// (account, instance); the claim map enforces it.
pub struct ShutdownOrchestrator {
    cloud: Arc<dyn CloudClient>,
    store: Arc<dyn ConfigStore>,
    resolver: Arc<PolicyResolver>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<NotificationService>,
    poller: JobPoller,
    settings: OrchestratorSettings,
    claims: Arc<DashMap<ClaimKey, uuid::Uuid>>,
}

impl ShutdownOrchestrator {
    pub fn new(
        cloud: Arc<dyn CloudClient>,
        store: Arc<dyn ConfigStore>,
        resolver: Arc<PolicyResolver>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<NotificationService>,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        let poller = JobPoller::new(cloud.clone(), settings.poller.clone());
        Arc::new(Self {
            cloud,
            store,
            resolver,
            audit,
            notifier,
            poller,
            settings,
            claims: Arc::new(DashMap::new()),
        })
    }

    pub fn open_job_count(&self) -> usize {
        self.claims.len()
    }

    /// Begins a shutdown decision for a breaching instance. Returns the
    /// owning task's handle, or `None` when nothing was enqueued (shutdown
    /// disabled, or an open job already exists for this instance).
    pub fn handle_breach(
        self: &Arc<Self>,
        account: &Account,
        instance: &Instance,
        reading: &TrafficReading,
        policy: &EffectivePolicy,
        cancel: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        if !policy.auto_shutdown_enabled {
            return None;
        }

        let key = (account.id, instance.id.clone());
        let job = ShutdownJob::new(
            account.id,
            instance.id.clone(),
            instance.name.clone(),
            format!(
                "traffic below threshold ({:.2} GB <= {:.2} GB)",
                reading.remaining_gb, policy.traffic_threshold_gb
            ),
            Some(reading.remaining_gb),
        );

        match self.claims.entry(key.clone()) {
            Entry::Occupied(existing) => {
                debug!(
                    account_id = account.id,
                    instance_id = %instance.id,
                    open_job = %existing.get(),
                    "Shutdown already in flight for this instance, skipping duplicate."
                );
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(job.id);
            }
        }
        let guard = ClaimGuard {
            claims: self.claims.clone(),
            key,
        };

        info!(
            account_id = account.id,
            instance_id = %instance.id,
            job_id = %job.id,
            remaining_gb = reading.remaining_gb,
            threshold_gb = policy.traffic_threshold_gb,
            "Traffic breach detected, shutdown job created."
        );

        let orchestrator = self.clone();
        let account = account.clone();
        let instance = instance.clone();
        let reading = reading.clone();
        let policy = policy.clone();
        Some(tokio::spawn(async move {
            orchestrator
                .run_job(guard, job, account, instance, reading, policy, cancel)
                .await;
        }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_job(
        &self,
        _guard: ClaimGuard,
        mut job: ShutdownJob,
        account: Account,
        instance: Instance,
        mut reading: TrafficReading,
        mut policy: EffectivePolicy,
        mut cancel: watch::Receiver<bool>,
    ) {
        if !policy.shutdown_delay.is_zero() {
            job.status = ShutdownStatus::Delaying;
            info!(
                job_id = %job.id,
                delay_secs = policy.shutdown_delay.as_secs(),
                "Deferring shutdown, will re-verify after the delay."
            );
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        self.finish(&mut job, ShutdownStatus::Skipped,
                            Some("cancelled during delay wait".to_string())).await;
                        return;
                    }
                }
                _ = tokio::time::sleep(policy.shutdown_delay) => {}
            }

            // Never act on a stale detection: re-verify against the current
            // policy and a fresh reading before touching the instance.
            match self.recheck(&account, &instance).await {
                Recheck::Proceed(fresh_reading, fresh_policy) => {
                    reading = fresh_reading;
                    policy = fresh_policy;
                }
                Recheck::Skip(why) => {
                    info!(job_id = %job.id, reason = %why, "Shutdown cancelled at re-check.");
                    self.finish(&mut job, ShutdownStatus::Skipped, Some(why)).await;
                    return;
                }
            }
        }

        job.status = ShutdownStatus::Submitting;
        let handle = loop {
            job.attempt_count += 1;
            match self
                .cloud
                .power_action(
                    &account,
                    std::slice::from_ref(&instance.id),
                    PowerAction::Stop,
                    PowerMode::Soft,
                )
                .await
            {
                Ok(handle) => break handle,
                Err(e) if e.is_transient() && job.attempt_count <= policy.retry_times => {
                    let backoff = submit_backoff(
                        self.settings.submit_backoff_base,
                        job.attempt_count,
                    );
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempt_count,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Power-off submission failed, retrying."
                    );
                    tokio::select! {
                        changed = cancel.changed() => {
                            if changed.is_err() || *cancel.borrow() {
                                self.finish(&mut job, ShutdownStatus::Skipped,
                                    Some("cancelled before submission".to_string())).await;
                                return;
                            }
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    error!(job_id = %job.id, attempts = job.attempt_count, error = %e,
                        "Power-off submission failed permanently.");
                    let why = format!("submission failed: {e}");
                    self.finish(&mut job, ShutdownStatus::Failed, Some(why.clone()))
                        .await;
                    self.notify_terminal(&job, &account, &instance, &reading, &policy, Err(why))
                        .await;
                    return;
                }
            }
        };

        job.provider_job_id = Some(handle.id.clone());
        job.status = ShutdownStatus::Submitted;
        info!(job_id = %job.id, provider_job_id = %handle.id, "Power-off submitted.");

        if policy.notification_enabled {
            self.notifier
                .dispatch(
                    account.id,
                    &policy,
                    NotificationEvent::ShutdownSubmitted {
                        ctx: self.event_context(&account, &instance, &reading, &policy),
                        reason: job.reason.clone(),
                        provider_job_id: handle.id.clone(),
                    },
                )
                .await;
        }

        job.status = ShutdownStatus::Polling;
        match self
            .poller
            .wait_for_completion(&account, &handle, &mut cancel)
            .await
        {
            JobOutcome::Succeeded => {
                self.finish(&mut job, ShutdownStatus::Succeeded, None).await;
                self.notify_terminal(&job, &account, &instance, &reading, &policy, Ok(handle.id))
                    .await;
            }
            JobOutcome::Failed { reason } => {
                self.finish(&mut job, ShutdownStatus::Failed, Some(reason.clone()))
                    .await;
                self.notify_terminal(&job, &account, &instance, &reading, &policy, Err(reason))
                    .await;
            }
            JobOutcome::Cancelled => {
                // The power-off may still complete provider-side; never
                // assume success without a terminal status.
                self.finish(
                    &mut job,
                    ShutdownStatus::Failed,
                    Some("polling cancelled before terminal status".to_string()),
                )
                .await;
            }
        }
    }

    /// Re-verification after the delay window. Uses the current effective
    /// policy, so threshold edits made during the delay are honored.
    async fn recheck(&self, account: &Account, instance: &Instance) -> Recheck {
        match self.store.list_accounts().await {
            Ok(accounts) => {
                match accounts.iter().find(|a| a.id == account.id) {
                    Some(current) if current.enabled => {}
                    _ => return Recheck::Skip("account disabled during delay".to_string()),
                }
            }
            Err(e) => return Recheck::Skip(format!("account lookup failed: {e}")),
        }

        let policy = match self.resolver.resolve(account.id).await {
            Ok(policy) => policy,
            Err(e) => return Recheck::Skip(format!("policy resolution failed: {e}")),
        };
        if !policy.auto_shutdown_enabled {
            return Recheck::Skip("auto-shutdown disabled during delay".to_string());
        }

        match self.cloud.query_traffic(account, instance).await {
            Ok(TrafficQuery::Reading(reading)) => {
                if reading.remaining_gb > policy.traffic_threshold_gb {
                    Recheck::Skip(format!(
                        "traffic recovered above threshold ({:.2} GB > {:.2} GB)",
                        reading.remaining_gb, policy.traffic_threshold_gb
                    ))
                } else {
                    Recheck::Proceed(reading, policy)
                }
            }
            Ok(TrafficQuery::NotApplicable) => {
                Recheck::Skip("instance no longer carries a traffic package".to_string())
            }
            Err(e) => Recheck::Skip(format!("re-check failed: {e}")),
        }
    }

    fn event_context(
        &self,
        account: &Account,
        instance: &Instance,
        reading: &TrafficReading,
        policy: &EffectivePolicy,
    ) -> InstanceContext {
        InstanceContext {
            account_name: account.name.clone(),
            region: account.region.clone(),
            instance_name: instance.name.clone(),
            instance_id: instance.id.clone(),
            public_ip: instance.public_ip.clone(),
            remaining_gb: reading.remaining_gb,
            threshold_gb: policy.traffic_threshold_gb,
        }
    }

    async fn notify_terminal(
        &self,
        job: &ShutdownJob,
        account: &Account,
        instance: &Instance,
        reading: &TrafficReading,
        policy: &EffectivePolicy,
        outcome: Result<String, String>,
    ) {
        if !policy.notification_enabled {
            return;
        }
        let ctx = self.event_context(account, instance, reading, policy);
        let event = match outcome {
            Ok(provider_job_id) => NotificationEvent::ShutdownSucceeded {
                ctx,
                provider_job_id,
            },
            Err(error) => NotificationEvent::ShutdownFailed {
                ctx,
                provider_job_id: job.provider_job_id.clone(),
                error,
            },
        };
        self.notifier.dispatch(account.id, policy, event).await;
    }

    async fn finish(
        &self,
        job: &mut ShutdownJob,
        status: ShutdownStatus,
        error_message: Option<String>,
    ) {
        debug_assert!(status.is_terminal());
        job.status = status;
        job.resolved_at = Some(Utc::now());
        info!(
            job_id = %job.id,
            status = status.as_str(),
            error = error_message.as_deref().unwrap_or(""),
            "Shutdown job resolved."
        );
        self.audit
            .append(AuditRecord::Shutdown(ShutdownLogRecord {
                job_id: job.id,
                account_id: job.account_id,
                instance_id: job.instance_id.clone(),
                instance_name: job.instance_name.clone(),
                reason: job.reason.clone(),
                status: status.as_str().to_string(),
                provider_job_id: job.provider_job_id.clone(),
                attempt_count: job.attempt_count,
                traffic_remaining_gb: job.traffic_remaining_gb,
                error_message,
                created_at: job.created_at,
                resolved_at: job.resolved_at.unwrap_or_else(Utc::now),
            }))
            .await;
    }
}

fn submit_backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter: f64 = rand::rng().random_range(0.5..1.5);
    Duration::from_secs_f64(exp * jitter)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::audit::MemoryAuditSink;
    use crate::cloud::testing::{reading, test_account, test_instance, MockCloudClient};
    use crate::cloud::{CloudError, JobHandle, JobProbe, JobStatus};
    use crate::notifications::{NotificationService, NotifierSettings};
    use crate::notifications::senders::{NotificationSender, SenderError};
    use crate::notifications::CardMessage;
    use crate::policy::{ConfigOverlay, MemoryConfigStore};

    use super::*;

    struct OkSender;

    #[async_trait::async_trait]
    impl NotificationSender for OkSender {
        async fn send(&self, _url: &str, _message: &CardMessage) -> Result<u16, SenderError> {
            Ok(200)
        }
    }

    struct Harness {
        cloud: Arc<MockCloudClient>,
        store: Arc<MemoryConfigStore>,
        audit: Arc<MemoryAuditSink>,
        orchestrator: Arc<ShutdownOrchestrator>,
        cancel_tx: watch::Sender<bool>,
        cancel_rx: watch::Receiver<bool>,
    }

    async fn harness(cloud: MockCloudClient) -> Harness {
        let cloud = Arc::new(cloud);
        let store = Arc::new(MemoryConfigStore::new());
        store
            .set_global(ConfigOverlay {
                webhook_url: Some("https://hooks.example.com/ops".to_string()),
                ..Default::default()
            })
            .await;
        store.upsert_account(test_account(1), None).await;
        let audit = Arc::new(MemoryAuditSink::new());
        let notifier = Arc::new(NotificationService::with_settings(
            Arc::new(OkSender),
            audit.clone(),
            NotifierSettings {
                retry_delay: Duration::from_millis(1),
            },
        ));
        let resolver = Arc::new(PolicyResolver::new(store.clone()));
        let orchestrator = ShutdownOrchestrator::new(
            cloud.clone(),
            store.clone(),
            resolver,
            audit.clone(),
            notifier,
            OrchestratorSettings {
                submit_backoff_base: Duration::from_millis(2),
                poller: PollerSettings {
                    poll_interval: Duration::from_millis(5),
                    max_attempts: 5,
                },
            },
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Harness {
            cloud,
            store,
            audit,
            orchestrator,
            cancel_tx,
            cancel_rx,
        }
    }

    fn policy(threshold: f64, delay: Duration) -> EffectivePolicy {
        EffectivePolicy {
            check_interval: Duration::from_secs(300),
            traffic_threshold_gb: threshold,
            auto_shutdown_enabled: true,
            notification_enabled: true,
            shutdown_delay: delay,
            retry_times: 3,
            webhook_url: Some("https://hooks.example.com/ops".to_string()),
        }
    }

    #[tokio::test]
    async fn zero_delay_submits_polls_and_succeeds() {
        let h = harness(MockCloudClient::new()).await;
        let account = test_account(1);
        let instance = test_instance("srv-1");
        let breach = reading(100.0, 92.0);

        let handle = h
            .orchestrator
            .handle_breach(
                &account,
                &instance,
                &breach,
                &policy(10.0, Duration::ZERO),
                h.cancel_rx.clone(),
            )
            .expect("breach should enqueue a job");
        handle.await.unwrap();

        assert_eq!(h.cloud.power_call_count(), 1);
        assert_eq!(
            h.cloud.power_calls.lock().unwrap()[0],
            vec!["srv-1".to_string()]
        );
        let records = h.audit.shutdown_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "succeeded");
        assert_eq!(records[0].provider_job_id.as_deref(), Some("job-1"));
        // Submitted and succeeded notifications were both dispatched.
        let kinds: Vec<_> = h
            .audit
            .notification_records()
            .into_iter()
            .map(|r| r.event)
            .collect();
        assert_eq!(kinds, vec!["shutdown_submitted", "shutdown_succeeded"]);
        assert_eq!(h.orchestrator.open_job_count(), 0);
    }

    #[tokio::test]
    async fn disabled_auto_shutdown_never_enqueues() {
        let h = harness(MockCloudClient::new()).await;
        let mut disabled = policy(10.0, Duration::ZERO);
        disabled.auto_shutdown_enabled = false;

        let result = h.orchestrator.handle_breach(
            &test_account(1),
            &test_instance("srv-1"),
            &reading(100.0, 95.0),
            &disabled,
            h.cancel_rx.clone(),
        );

        assert!(result.is_none());
        assert_eq!(h.cloud.power_call_count(), 0);
        assert!(h.audit.shutdown_records().is_empty());
    }

    #[tokio::test]
    async fn concurrent_breaches_claim_at_most_one_job() {
        let h = harness(MockCloudClient::new()).await;
        // Still breaching at the delay re-check.
        h.cloud
            .on_traffic(|_| Ok(TrafficQuery::Reading(reading(100.0, 92.0))));
        let account = test_account(1);
        let instance = test_instance("srv-1");
        let breach = reading(100.0, 92.0);
        let p = policy(10.0, Duration::from_millis(50));

        let first = h
            .orchestrator
            .handle_breach(&account, &instance, &breach, &p, h.cancel_rx.clone());
        let second = h
            .orchestrator
            .handle_breach(&account, &instance, &breach, &p, h.cancel_rx.clone());

        assert!(first.is_some());
        assert!(second.is_none());
        first.unwrap().await.unwrap();
        assert_eq!(h.cloud.power_call_count(), 1);
        // Once resolved, the claim is released and a new breach may act.
        assert_eq!(h.orchestrator.open_job_count(), 0);
    }

    #[tokio::test]
    async fn delay_recheck_skips_when_traffic_recovered() {
        let h = harness(MockCloudClient::new()).await;
        // Fresh reading at re-check shows a topped-up allowance.
        h.cloud
            .on_traffic(|_| Ok(TrafficQuery::Reading(reading(100.0, 10.0))));

        let handle = h
            .orchestrator
            .handle_breach(
                &test_account(1),
                &test_instance("srv-1"),
                &reading(100.0, 92.0),
                &policy(10.0, Duration::from_millis(10)),
                h.cancel_rx.clone(),
            )
            .unwrap();
        handle.await.unwrap();

        assert_eq!(h.cloud.power_call_count(), 0);
        let records = h.audit.shutdown_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "skipped");
        assert!(records[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("recovered"));
    }

    #[tokio::test]
    async fn delay_recheck_skips_when_account_disabled() {
        let h = harness(MockCloudClient::new()).await;
        h.cloud
            .on_traffic(|_| Ok(TrafficQuery::Reading(reading(100.0, 92.0))));
        h.store.set_account_enabled(1, false).await;

        let handle = h
            .orchestrator
            .handle_breach(
                &test_account(1),
                &test_instance("srv-1"),
                &reading(100.0, 92.0),
                &policy(10.0, Duration::from_millis(10)),
                h.cancel_rx.clone(),
            )
            .unwrap();
        handle.await.unwrap();

        assert_eq!(h.cloud.power_call_count(), 0);
        assert_eq!(h.audit.shutdown_records()[0].status, "skipped");
    }

    #[tokio::test]
    async fn poll_timeout_resolves_failed_never_succeeded() {
        let h = harness(MockCloudClient::new()).await;
        h.cloud.on_probe(|_| {
            Ok(JobProbe {
                status: JobStatus::Running,
                fail_reason: None,
            })
        });

        let handle = h
            .orchestrator
            .handle_breach(
                &test_account(1),
                &test_instance("srv-1"),
                &reading(100.0, 92.0),
                &policy(10.0, Duration::ZERO),
                h.cancel_rx.clone(),
            )
            .unwrap();
        handle.await.unwrap();

        let records = h.audit.shutdown_records();
        assert_eq!(records[0].status, "failed");
        assert_eq!(records[0].error_message.as_deref(), Some("timeout"));
        let kinds: Vec<_> = h
            .audit
            .notification_records()
            .into_iter()
            .map(|r| r.event)
            .collect();
        assert!(kinds.contains(&"shutdown_failed".to_string()));
    }

    #[tokio::test]
    async fn transient_submission_errors_retry_then_succeed() {
        let h = harness(MockCloudClient::new()).await;
        let mut failures = 2;
        h.cloud.on_power(move |_| {
            if failures > 0 {
                failures -= 1;
                Err(CloudError::Api {
                    status: 503,
                    message: "busy".to_string(),
                })
            } else {
                Ok(JobHandle {
                    id: "job-7".to_string(),
                })
            }
        });

        let handle = h
            .orchestrator
            .handle_breach(
                &test_account(1),
                &test_instance("srv-1"),
                &reading(100.0, 92.0),
                &policy(10.0, Duration::ZERO),
                h.cancel_rx.clone(),
            )
            .unwrap();
        handle.await.unwrap();

        assert_eq!(h.cloud.power_call_count(), 3);
        let records = h.audit.shutdown_records();
        assert_eq!(records[0].status, "succeeded");
        assert_eq!(records[0].attempt_count, 3);
    }

    #[tokio::test]
    async fn permanent_submission_error_fails_without_retries() {
        let h = harness(MockCloudClient::new()).await;
        h.cloud
            .on_power(|_| Err(CloudError::Unauthorized("token revoked".to_string())));

        let handle = h
            .orchestrator
            .handle_breach(
                &test_account(1),
                &test_instance("srv-1"),
                &reading(100.0, 92.0),
                &policy(10.0, Duration::ZERO),
                h.cancel_rx.clone(),
            )
            .unwrap();
        handle.await.unwrap();

        assert_eq!(h.cloud.power_call_count(), 1);
        let records = h.audit.shutdown_records();
        assert_eq!(records[0].status, "failed");
        assert!(records[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("token revoked"));
    }

    #[tokio::test]
    async fn cancellation_during_delay_skips_the_job() {
        let h = harness(MockCloudClient::new()).await;

        let handle = h
            .orchestrator
            .handle_breach(
                &test_account(1),
                &test_instance("srv-1"),
                &reading(100.0, 92.0),
                &policy(10.0, Duration::from_secs(60)),
                h.cancel_rx.clone(),
            )
            .unwrap();
        h.cancel_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cancellation was not observed in time")
            .unwrap();

        assert_eq!(h.cloud.power_call_count(), 0);
        assert_eq!(h.audit.shutdown_records()[0].status, "skipped");
    }
}
