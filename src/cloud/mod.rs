use async_trait::async_trait;

use crate::policy::Account;

pub mod error;
pub mod rest;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use error::CloudError;
pub use types::{
    Instance, InstanceStatus, JobHandle, JobProbe, JobStatus, PowerAction, PowerMode,
    TrafficQuery, TrafficReading,
};

/// Provider-facing client boundary. Everything the engine needs from the
/// cloud API goes through this trait; the wire format lives behind it.
///
/// All calls must be safe to retry and must classify failures as transient
/// or permanent via [`CloudError::is_transient`].
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Enumerates the account's instances in its configured region.
    async fn list_instances(&self, account: &Account) -> Result<Vec<Instance>, CloudError>;

    /// Queries the remaining traffic allowance of one instance.
    ///
    /// An instance without an associated traffic package yields
    /// [`TrafficQuery::NotApplicable`], not an error.
    async fn query_traffic(
        &self,
        account: &Account,
        instance: &Instance,
    ) -> Result<TrafficQuery, CloudError>;

    /// Issues a power action against a batch of instances and returns the
    /// provider's asynchronous job handle.
    async fn power_action(
        &self,
        account: &Account,
        instance_ids: &[String],
        action: PowerAction,
        mode: PowerMode,
    ) -> Result<JobHandle, CloudError>;

    /// Probes the status of an asynchronous provider job.
    async fn poll_job(&self, account: &Account, job: &JobHandle)
        -> Result<JobProbe, CloudError>;
}
