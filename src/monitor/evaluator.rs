use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cloud::{CloudClient, CloudError, Instance, TrafficQuery, TrafficReading};
use crate::policy::{Account, EffectivePolicy};

#[derive(Debug, Error)]
#[error("traffic evaluation failed: {source}")]
pub struct EvaluationError {
    /// Transient failures are skipped for this cycle only; the instance is
    /// re-enumerated fresh on the next one.
    pub transient: bool,
    #[source]
    pub source: CloudError,
}

#[derive(Debug)]
pub enum EvaluationOutcome {
    Reading {
        reading: TrafficReading,
        is_below_threshold: bool,
    },
    /// No traffic package on the instance; excluded from shutdown
    /// consideration entirely.
    NotApplicable,
    Failed(EvaluationError),
}

#[derive(Debug)]
pub struct InstanceEvaluation {
    pub instance: Instance,
    pub outcome: EvaluationOutcome,
}

/// Fetches and normalizes one instance's allowance and compares it to the
/// effective threshold.
pub struct TrafficEvaluator {
    cloud: Arc<dyn CloudClient>,
}

impl TrafficEvaluator {
    pub fn new(cloud: Arc<dyn CloudClient>) -> Self {
        Self { cloud }
    }

    pub async fn evaluate(
        &self,
        account: &Account,
        instance: Instance,
        policy: &EffectivePolicy,
    ) -> InstanceEvaluation {
        let outcome = match self.cloud.query_traffic(account, &instance).await {
            Ok(TrafficQuery::Reading(reading)) => {
                let is_below_threshold = reading.remaining_gb <= policy.traffic_threshold_gb;
                if is_below_threshold {
                    warn!(
                        account_id = account.id,
                        instance_id = %instance.id,
                        remaining_gb = reading.remaining_gb,
                        threshold_gb = policy.traffic_threshold_gb,
                        "Traffic below threshold."
                    );
                } else {
                    debug!(
                        account_id = account.id,
                        instance_id = %instance.id,
                        remaining_gb = reading.remaining_gb,
                        "Traffic normal."
                    );
                }
                EvaluationOutcome::Reading {
                    reading,
                    is_below_threshold,
                }
            }
            Ok(TrafficQuery::NotApplicable) => {
                debug!(
                    account_id = account.id,
                    instance_id = %instance.id,
                    "Instance carries no traffic package."
                );
                EvaluationOutcome::NotApplicable
            }
            Err(source) => {
                let transient = source.is_transient();
                warn!(
                    account_id = account.id,
                    instance_id = %instance.id,
                    transient,
                    error = %source,
                    "Traffic query failed, skipping instance for this cycle."
                );
                EvaluationOutcome::Failed(EvaluationError { transient, source })
            }
        };
        InstanceEvaluation { instance, outcome }
    }
}

#[cfg(test)]
mod tests {
    use crate::cloud::testing::{reading, test_account, test_instance, MockCloudClient};
    use crate::policy::{ConfigOverlay, EffectivePolicy};

    use super::*;

    fn policy(threshold: f64) -> EffectivePolicy {
        let global = ConfigOverlay {
            traffic_threshold_gb: Some(threshold),
            ..Default::default()
        };
        EffectivePolicy::resolve(None, &global)
    }

    #[tokio::test]
    async fn remaining_at_threshold_counts_as_breach() {
        let cloud = Arc::new(MockCloudClient::new());
        cloud.on_traffic(|_| Ok(TrafficQuery::Reading(reading(100.0, 90.0))));
        let evaluator = TrafficEvaluator::new(cloud);

        let eval = evaluator
            .evaluate(&test_account(1), test_instance("srv-1"), &policy(10.0))
            .await;

        match eval.outcome {
            EvaluationOutcome::Reading {
                is_below_threshold, ..
            } => assert!(is_below_threshold),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn remaining_above_threshold_is_not_a_breach() {
        let cloud = Arc::new(MockCloudClient::new());
        cloud.on_traffic(|_| Ok(TrafficQuery::Reading(reading(100.0, 50.0))));
        let evaluator = TrafficEvaluator::new(cloud);

        let eval = evaluator
            .evaluate(&test_account(1), test_instance("srv-1"), &policy(10.0))
            .await;

        match eval.outcome {
            EvaluationOutcome::Reading {
                reading,
                is_below_threshold,
            } => {
                assert!(!is_below_threshold);
                assert_eq!(reading.usage_percentage(), 50.0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_package_is_not_an_error() {
        let cloud = Arc::new(MockCloudClient::new());
        let evaluator = TrafficEvaluator::new(cloud);

        let eval = evaluator
            .evaluate(&test_account(1), test_instance("srv-1"), &policy(10.0))
            .await;

        assert!(matches!(eval.outcome, EvaluationOutcome::NotApplicable));
    }

    #[tokio::test]
    async fn transient_flag_follows_the_cloud_error() {
        let cloud = Arc::new(MockCloudClient::new());
        cloud.on_traffic(|_| {
            Err(CloudError::Api {
                status: 503,
                message: "unavailable".to_string(),
            })
        });
        let evaluator = TrafficEvaluator::new(cloud.clone());

        let eval = evaluator
            .evaluate(&test_account(1), test_instance("srv-1"), &policy(10.0))
            .await;
        match eval.outcome {
            EvaluationOutcome::Failed(e) => assert!(e.transient),
            other => panic!("unexpected outcome: {other:?}"),
        }

        cloud.on_traffic(|_| Err(CloudError::NotFound("gone".to_string())));
        let eval = evaluator
            .evaluate(&test_account(1), test_instance("srv-1"), &policy(10.0))
            .await;
        match eval.outcome {
            EvaluationOutcome::Failed(e) => assert!(!e.transient),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
