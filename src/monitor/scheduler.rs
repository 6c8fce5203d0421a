use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::policy::{Account, PolicyError, DEFAULT_CHECK_INTERVAL_MINUTES};

use super::workflow::run_account_pass;
use super::EngineContext;

/// Cadence of the registry reconciliation pass.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

const TRIGGER_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Scheduled,
    Manual,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Scheduled => "scheduled",
            TriggerSource::Manual => "manual",
        }
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("no running monitor task for account {0}")]
    UnknownAccount(i64),
}

struct AccountHandle {
    trigger_tx: mpsc::Sender<()>,
    cancel_tx: watch::Sender<bool>,
}

/// Registry of per-account monitor tasks, rebuilt from the config store on
/// every reconciliation pass. Each account runs on its own independent
/// timer; disabling an account cancels its task without touching history.
pub struct MonitorScheduler {
    ctx: Arc<EngineContext>,
    accounts: DashMap<i64, AccountHandle>,
    shutdown_tx: watch::Sender<bool>,
}

impl MonitorScheduler {
    pub fn new(ctx: Arc<EngineContext>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            ctx,
            accounts: DashMap::new(),
            shutdown_tx,
        })
    }

    /// Drives reconciliation until [`MonitorScheduler::shutdown`] is called.
    /// A missing global config halts scheduling entirely.
    pub async fn run(self: Arc<Self>) {
        info!(
            reconcile_interval_secs = RECONCILE_INTERVAL.as_secs(),
            "Monitor scheduler started."
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.reconcile().await {
                        Ok(()) => {}
                        Err(PolicyError::GlobalConfigMissing) => {
                            error!("Global configuration is missing, halting scheduling.");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Reconciliation pass failed.");
                        }
                    }
                }
            }
        }
        self.cancel_all();
        info!("Monitor scheduler stopped.");
    }

    /// One reconciliation pass: spawn tasks for newly enabled accounts,
    /// cancel tasks for accounts that disappeared or were disabled.
    pub async fn reconcile(&self) -> Result<(), PolicyError> {
        if self.ctx.store.global_config().await?.is_none() {
            return Err(PolicyError::GlobalConfigMissing);
        }
        let accounts = self.ctx.store.list_accounts().await?;

        for account in accounts.iter().filter(|a| a.enabled) {
            if !self.accounts.contains_key(&account.id) {
                self.spawn_account_task(account.clone());
            }
        }

        let stale: Vec<i64> = self
            .accounts
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| {
                !accounts
                    .iter()
                    .any(|account| account.id == *id && account.enabled)
            })
            .collect();
        for id in stale {
            if let Some((_, handle)) = self.accounts.remove(&id) {
                info!(account_id = id, "Account suspended, cancelling its monitor task.");
                let _ = handle.cancel_tx.send(true);
            }
        }
        Ok(())
    }

    fn spawn_account_task(&self, account: Account) {
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE_DEPTH);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let account_id = account.id;
        tokio::spawn(account_loop(self.ctx.clone(), account, trigger_rx, cancel_rx));
        self.accounts.insert(
            account_id,
            AccountHandle {
                trigger_tx,
                cancel_tx,
            },
        );
        info!(account_id, "Monitor task registered.");
    }

    /// Enqueues one immediate pass outside the account's timer cadence.
    /// Returns as soon as the pass is queued, without waiting for it.
    pub fn trigger_now(&self, account_id: i64) -> Result<(), TriggerError> {
        let handle = self
            .accounts
            .get(&account_id)
            .ok_or(TriggerError::UnknownAccount(account_id))?;
        match handle.trigger_tx.try_send(()) {
            Ok(()) => {
                info!(account_id, "Manual evaluation pass enqueued.");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!(account_id, "Manual trigger queue full, pass already pending.");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                Err(TriggerError::UnknownAccount(account_id))
            }
        }
    }

    pub fn is_running(&self, account_id: i64) -> bool {
        self.accounts.contains_key(&account_id)
    }

    /// Cancels the reconciler and every account task. In-flight pollers and
    /// delay waits observe the cancellation within one poll interval.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.cancel_all();
    }

    fn cancel_all(&self) {
        let ids: Vec<i64> = self.accounts.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.accounts.remove(&id) {
                let _ = handle.cancel_tx.send(true);
            }
        }
    }
}

async fn account_loop(
    ctx: Arc<EngineContext>,
    account: Account,
    mut trigger_rx: mpsc::Receiver<()>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    info!(
        account_id = account.id,
        account_name = %account.name,
        "Account monitor task started."
    );
    // First scheduled pass fires one full interval in; an immediate pass is
    // available through the manual trigger.
    let mut next_tick = Instant::now() + resolve_interval(&ctx, &account).await;
    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(next_tick) => {
                run_guarded_pass(&ctx, &account, &cancel_rx, TriggerSource::Scheduled).await;
                next_tick = Instant::now() + resolve_interval(&ctx, &account).await;
            }
            Some(()) = trigger_rx.recv() => {
                // Manual passes leave the scheduled deadline untouched so
                // the configured cadence is preserved.
                run_guarded_pass(&ctx, &account, &cancel_rx, TriggerSource::Manual).await;
            }
        }
    }
    info!(account_id = account.id, "Account monitor task stopped.");
}

async fn resolve_interval(ctx: &Arc<EngineContext>, account: &Account) -> Duration {
    match ctx.resolver.resolve(account.id).await {
        Ok(policy) => policy.check_interval,
        Err(e) => {
            error!(
                account_id = account.id,
                error = %e,
                "Failed to resolve check interval, falling back to the default."
            );
            Duration::from_secs(DEFAULT_CHECK_INTERVAL_MINUTES * 60)
        }
    }
}

/// Runs one pass in its own task so that neither errors nor panics can take
/// the account's timer down; the account simply retries on its next tick.
async fn run_guarded_pass(
    ctx: &Arc<EngineContext>,
    account: &Account,
    cancel: &watch::Receiver<bool>,
    source: TriggerSource,
) {
    let pass = tokio::spawn(run_account_pass(
        ctx.clone(),
        account.clone(),
        cancel.clone(),
    ));
    match pass.await {
        Ok(Ok(stats)) => {
            debug!(
                account_id = account.id,
                trigger = source.as_str(),
                evaluated = stats.evaluated,
                breaches = stats.breaches,
                "Evaluation pass completed."
            );
        }
        Ok(Err(e)) => {
            error!(
                account_id = account.id,
                trigger = source.as_str(),
                error = %e,
                "Evaluation pass failed."
            );
        }
        Err(join_error) => {
            warn!(
                account_id = account.id,
                error = %join_error,
                "Evaluation pass aborted unexpectedly."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cloud::testing::{reading, test_account, test_instance, MockCloudClient};
    use crate::cloud::TrafficQuery;
    use crate::monitor::testing::{engine, wait_until};

    use super::*;

    #[tokio::test]
    async fn reconcile_spawns_enabled_and_suspends_disabled_accounts() {
        let mut disabled = test_account(2);
        disabled.enabled = false;
        let t = engine(
            MockCloudClient::new(),
            vec![test_account(1), disabled],
        )
        .await;
        let scheduler = MonitorScheduler::new(t.ctx.clone());

        scheduler.reconcile().await.unwrap();
        assert!(scheduler.is_running(1));
        assert!(!scheduler.is_running(2));

        t.store.set_account_enabled(1, false).await;
        t.store.set_account_enabled(2, true).await;
        scheduler.reconcile().await.unwrap();
        assert!(!scheduler.is_running(1));
        assert!(scheduler.is_running(2));

        scheduler.shutdown();
    }

    #[tokio::test]
    async fn reconcile_fails_fatally_without_global_config() {
        let t = engine(MockCloudClient::new(), vec![test_account(1)]).await;
        let store = crate::policy::MemoryConfigStore::new();
        store.upsert_account(test_account(1), None).await;
        let ctx = crate::monitor::EngineContext::new(
            std::sync::Arc::new(store),
            t.cloud.clone(),
            t.audit.clone(),
            t.ctx.notifier.clone(),
            t.ctx.orchestrator.clone(),
        );
        let scheduler = MonitorScheduler::new(ctx);

        let err = scheduler.reconcile().await.unwrap_err();
        assert!(matches!(err, PolicyError::GlobalConfigMissing));
    }

    #[tokio::test]
    async fn manual_trigger_runs_a_pass_without_waiting_for_the_timer() {
        let cloud = MockCloudClient::new().with_instances(vec![test_instance("srv-1")]);
        let t = engine(cloud, vec![test_account(1)]).await;
        t.cloud
            .on_traffic(|_| Ok(TrafficQuery::Reading(reading(100.0, 50.0))));
        let scheduler = MonitorScheduler::new(t.ctx.clone());
        scheduler.reconcile().await.unwrap();

        // The default 5-minute interval has not elapsed; only the manual
        // trigger can produce a monitor record this quickly.
        scheduler.trigger_now(1).unwrap();
        let audit = t.audit.clone();
        assert!(
            wait_until(Duration::from_secs(5), move || {
                !audit.monitor_records().is_empty()
            })
            .await
        );

        scheduler.shutdown();
    }

    #[tokio::test]
    async fn trigger_for_unknown_account_is_rejected() {
        let t = engine(MockCloudClient::new(), vec![test_account(1)]).await;
        let scheduler = MonitorScheduler::new(t.ctx.clone());
        scheduler.reconcile().await.unwrap();

        assert!(matches!(
            scheduler.trigger_now(99),
            Err(TriggerError::UnknownAccount(99))
        ));
        scheduler.shutdown();
    }
}
