use std::sync::Arc;

use crate::audit::AuditSink;
use crate::cloud::CloudClient;
use crate::notifications::NotificationService;
use crate::policy::{ConfigStore, PolicyResolver};
use crate::shutdown::ShutdownOrchestrator;

pub mod evaluator;
pub mod scheduler;
pub mod workflow;

pub use evaluator::{EvaluationError, EvaluationOutcome, InstanceEvaluation, TrafficEvaluator};
pub use scheduler::{MonitorScheduler, TriggerError, TriggerSource};
pub use workflow::{run_account_pass, PassError, PassStats};

/// Shared dependencies of the monitoring engine. Read-shared across all
/// account tasks; none of the contained services mutates another's state.
pub struct EngineContext {
    pub store: Arc<dyn ConfigStore>,
    pub resolver: Arc<PolicyResolver>,
    pub cloud: Arc<dyn CloudClient>,
    pub evaluator: TrafficEvaluator,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<NotificationService>,
    pub orchestrator: Arc<ShutdownOrchestrator>,
}

impl EngineContext {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        cloud: Arc<dyn CloudClient>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<NotificationService>,
        orchestrator: Arc<ShutdownOrchestrator>,
    ) -> Arc<Self> {
        let resolver = Arc::new(PolicyResolver::new(store.clone()));
        let evaluator = TrafficEvaluator::new(cloud.clone());
        Arc::new(Self {
            store,
            resolver,
            cloud,
            evaluator,
            audit,
            notifier,
            orchestrator,
        })
    }
}
