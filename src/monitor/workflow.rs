use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::audit::{AuditRecord, MonitorLogRecord};
use crate::cloud::CloudError;
use crate::notifications::{InstanceContext, NotificationEvent};
use crate::policy::{Account, EffectivePolicy, PolicyError};

use super::evaluator::EvaluationOutcome;
use super::EngineContext;

/// Worker cap for instance evaluations within one account, to respect the
/// provider's API rate limits.
pub const EVALUATION_CONCURRENCY: usize = 4;

/// Usage share at which a warning notification is emitted, independent of
/// shutdown handling.
pub const TRAFFIC_WARNING_USAGE_PERCENT: f64 = 70.0;

#[derive(Debug, Default, Clone)]
pub struct PassStats {
    pub evaluated: usize,
    pub breaches: usize,
    pub shutdowns_enqueued: usize,
    pub warnings: usize,
    pub errors: usize,
}

#[derive(Debug, Error)]
pub enum PassError {
    #[error("policy resolution failed: {0}")]
    Policy(#[from] PolicyError),
    #[error("instance listing failed: {0}")]
    Cloud(#[from] CloudError),
}

/// One `Running` pass for one account: resolve the effective policy, sweep
/// the account's instances with bounded concurrency, audit every
/// evaluation, and hand breaches to the shutdown orchestrator.
pub async fn run_account_pass(
    ctx: Arc<EngineContext>,
    account: Account,
    cancel: watch::Receiver<bool>,
) -> Result<PassStats, PassError> {
    let policy = ctx.resolver.resolve(account.id).await?;

    let instances = match ctx.cloud.list_instances(&account).await {
        Ok(instances) => instances,
        Err(e) => {
            error!(account_id = account.id, error = %e, "Instance listing failed.");
            ctx.audit
                .append(AuditRecord::Monitor(MonitorLogRecord {
                    account_id: account.id,
                    instance_id: None,
                    instance_name: None,
                    traffic_total_gb: None,
                    traffic_used_gb: None,
                    traffic_remaining_gb: None,
                    usage_percentage: None,
                    threshold_gb: policy.traffic_threshold_gb,
                    is_below_threshold: false,
                    message: "instance listing failed".to_string(),
                    error_message: Some(e.to_string()),
                    checked_at: Utc::now(),
                }))
                .await;
            return Err(e.into());
        }
    };

    let evaluations: Vec<_> = futures::stream::iter(instances)
        .map(|instance| ctx.evaluator.evaluate(&account, instance, &policy))
        .buffer_unordered(EVALUATION_CONCURRENCY)
        .collect()
        .await;

    let mut stats = PassStats {
        evaluated: evaluations.len(),
        ..Default::default()
    };

    for evaluation in evaluations {
        let instance = &evaluation.instance;
        match &evaluation.outcome {
            EvaluationOutcome::Reading {
                reading,
                is_below_threshold,
            } => {
                let usage = reading.usage_percentage();
                let message = if *is_below_threshold {
                    format!(
                        "traffic below threshold ({:.2} GB <= {:.2} GB)",
                        reading.remaining_gb, policy.traffic_threshold_gb
                    )
                } else {
                    format!(
                        "traffic normal ({:.2} GB > {:.2} GB)",
                        reading.remaining_gb, policy.traffic_threshold_gb
                    )
                };
                ctx.audit
                    .append(AuditRecord::Monitor(MonitorLogRecord {
                        account_id: account.id,
                        instance_id: Some(instance.id.clone()),
                        instance_name: Some(instance.name.clone()),
                        traffic_total_gb: Some(reading.total_gb),
                        traffic_used_gb: Some(reading.used_gb),
                        traffic_remaining_gb: Some(reading.remaining_gb),
                        usage_percentage: Some(usage),
                        threshold_gb: policy.traffic_threshold_gb,
                        is_below_threshold: *is_below_threshold,
                        message,
                        error_message: None,
                        checked_at: reading.checked_at,
                    }))
                    .await;

                if policy.notification_enabled && usage >= TRAFFIC_WARNING_USAGE_PERCENT {
                    stats.warnings += 1;
                    ctx.notifier
                        .dispatch(
                            account.id,
                            &policy,
                            NotificationEvent::TrafficWarning {
                                ctx: InstanceContext {
                                    account_name: account.name.clone(),
                                    region: account.region.clone(),
                                    instance_name: instance.name.clone(),
                                    instance_id: instance.id.clone(),
                                    public_ip: instance.public_ip.clone(),
                                    remaining_gb: reading.remaining_gb,
                                    threshold_gb: policy.traffic_threshold_gb,
                                },
                                usage_percentage: usage,
                            },
                        )
                        .await;
                }

                if *is_below_threshold {
                    stats.breaches += 1;
                    if !instance.is_running() {
                        debug!(
                            account_id = account.id,
                            instance_id = %instance.id,
                            "Breaching instance is not running, nothing to power off."
                        );
                    } else if ctx
                        .orchestrator
                        .handle_breach(&account, instance, reading, &policy, cancel.clone())
                        .is_some()
                    {
                        stats.shutdowns_enqueued += 1;
                    }
                }
            }
            EvaluationOutcome::NotApplicable => {
                ctx.audit
                    .append(AuditRecord::Monitor(MonitorLogRecord {
                        account_id: account.id,
                        instance_id: Some(instance.id.clone()),
                        instance_name: Some(instance.name.clone()),
                        traffic_total_gb: None,
                        traffic_used_gb: None,
                        traffic_remaining_gb: None,
                        usage_percentage: None,
                        threshold_gb: policy.traffic_threshold_gb,
                        is_below_threshold: false,
                        message: "instance carries no traffic package".to_string(),
                        error_message: None,
                        checked_at: Utc::now(),
                    }))
                    .await;
            }
            EvaluationOutcome::Failed(e) => {
                stats.errors += 1;
                ctx.audit
                    .append(AuditRecord::Monitor(MonitorLogRecord {
                        account_id: account.id,
                        instance_id: Some(instance.id.clone()),
                        instance_name: Some(instance.name.clone()),
                        traffic_total_gb: None,
                        traffic_used_gb: None,
                        traffic_remaining_gb: None,
                        usage_percentage: None,
                        threshold_gb: policy.traffic_threshold_gb,
                        is_below_threshold: false,
                        message: if e.transient {
                            "evaluation failed (transient)".to_string()
                        } else {
                            "evaluation failed (permanent)".to_string()
                        },
                        error_message: Some(e.to_string()),
                        checked_at: Utc::now(),
                    }))
                    .await;
            }
        }
    }

    info!(
        account_id = account.id,
        evaluated = stats.evaluated,
        breaches = stats.breaches,
        shutdowns_enqueued = stats.shutdowns_enqueued,
        warnings = stats.warnings,
        errors = stats.errors,
        "Evaluation pass finished."
    );
    Ok(stats)
}
