//! Programmable in-memory [`CloudClient`] for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::policy::Account;

use super::error::CloudError;
use super::types::{
    Instance, InstanceStatus, JobHandle, JobProbe, JobStatus, PowerAction, PowerMode,
    TrafficQuery, TrafficReading,
};
use super::CloudClient;

type TrafficFn = dyn FnMut(&Instance) -> Result<TrafficQuery, CloudError> + Send;
type PowerFn = dyn FnMut(&[String]) -> Result<JobHandle, CloudError> + Send;
type ProbeFn = dyn FnMut(&JobHandle) -> Result<JobProbe, CloudError> + Send;

pub struct MockCloudClient {
    instances: Mutex<Vec<Instance>>,
    traffic: Mutex<Box<TrafficFn>>,
    power: Mutex<Box<PowerFn>>,
    probe: Mutex<Box<ProbeFn>>,
    pub power_calls: Mutex<Vec<Vec<String>>>,
    pub probe_calls: AtomicUsize,
}

impl MockCloudClient {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(Vec::new()),
            traffic: Mutex::new(Box::new(|_| Ok(TrafficQuery::NotApplicable))),
            power: Mutex::new(Box::new(|_| {
                Ok(JobHandle {
                    id: "job-1".to_string(),
                })
            })),
            probe: Mutex::new(Box::new(|_| {
                Ok(JobProbe {
                    status: JobStatus::Success,
                    fail_reason: None,
                })
            })),
            power_calls: Mutex::new(Vec::new()),
            probe_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_instances(self, instances: Vec<Instance>) -> Self {
        *self.instances.lock().unwrap() = instances;
        self
    }

    pub fn on_traffic(
        &self,
        f: impl FnMut(&Instance) -> Result<TrafficQuery, CloudError> + Send + 'static,
    ) {
        *self.traffic.lock().unwrap() = Box::new(f);
    }

    pub fn on_power(
        &self,
        f: impl FnMut(&[String]) -> Result<JobHandle, CloudError> + Send + 'static,
    ) {
        *self.power.lock().unwrap() = Box::new(f);
    }

    pub fn on_probe(
        &self,
        f: impl FnMut(&JobHandle) -> Result<JobProbe, CloudError> + Send + 'static,
    ) {
        *self.probe.lock().unwrap() = Box::new(f);
    }

    pub fn power_call_count(&self) -> usize {
        self.power_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CloudClient for MockCloudClient {
    async fn list_instances(&self, _account: &Account) -> Result<Vec<Instance>, CloudError> {
        Ok(self.instances.lock().unwrap().clone())
    }

    async fn query_traffic(
        &self,
        _account: &Account,
        instance: &Instance,
    ) -> Result<TrafficQuery, CloudError> {
        (self.traffic.lock().unwrap())(instance)
    }

    async fn power_action(
        &self,
        _account: &Account,
        instance_ids: &[String],
        _action: PowerAction,
        _mode: PowerMode,
    ) -> Result<JobHandle, CloudError> {
        self.power_calls
            .lock()
            .unwrap()
            .push(instance_ids.to_vec());
        (self.power.lock().unwrap())(instance_ids)
    }

    async fn poll_job(
        &self,
        _account: &Account,
        job: &JobHandle,
    ) -> Result<JobProbe, CloudError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        (self.probe.lock().unwrap())(job)
    }
}

pub fn test_account(id: i64) -> Account {
    Account {
        id,
        name: format!("acct-{id}"),
        api_token: "token".to_string(),
        region: "eu-west-0".to_string(),
        project_id: "proj".to_string(),
        enabled: true,
    }
}

pub fn test_instance(id: &str) -> Instance {
    Instance {
        id: id.to_string(),
        name: format!("vm-{id}"),
        status: InstanceStatus::Active,
        public_ip: Some("203.0.113.10".to_string()),
        private_ip: Some("192.168.0.10".to_string()),
    }
}

pub fn reading(total: f64, used: f64) -> TrafficReading {
    TrafficReading {
        total_gb: total,
        used_gb: used,
        remaining_gb: total - used,
        checked_at: Utc::now(),
    }
}
