use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::policy::Account;

use super::error::CloudError;
use super::types::{
    Instance, InstanceStatus, JobHandle, JobProbe, PowerAction, PowerMode, TrafficQuery,
    TrafficReading,
};
use super::CloudClient;

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

#[derive(Debug, Clone)]
pub struct RestClientSettings {
    /// Endpoint template with a `{region}` placeholder,
    /// e.g. `https://ecs.{region}.example-cloud.com`.
    pub endpoint_template: String,
    pub request_timeout: Duration,
}

impl Default for RestClientSettings {
    fn default() -> Self {
        Self {
            endpoint_template: "https://ecs.{region}.myhuaweicloud.com".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// [`CloudClient`] over the provider's REST surface. Authentication is a
/// per-account token header; request signing is handled upstream of this
/// process.
pub struct RestCloudClient {
    http: Client,
    settings: RestClientSettings,
}

#[derive(Deserialize)]
struct ServerListResponse {
    servers: Vec<ServerDetail>,
}

#[derive(Deserialize)]
struct ServerDetail {
    id: String,
    name: String,
    status: String,
    #[serde(default)]
    addresses: HashMap<String, Vec<AddressEntry>>,
}

#[derive(Deserialize)]
struct AddressEntry {
    addr: String,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    ip_type: String,
}

#[derive(Deserialize)]
struct TrafficQuotaResponse {
    free_resource_measure: Option<ResourceMeasure>,
}

#[derive(Deserialize)]
struct ResourceMeasure {
    amount: f64,
    used_amount: f64,
    available_amount: f64,
    measure_unit: Option<String>,
}

#[derive(Deserialize)]
struct PowerActionResponse {
    job_id: String,
}

impl RestCloudClient {
    pub fn new(settings: RestClientSettings) -> Result<Self, CloudError> {
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self { http, settings })
    }

    fn base_url(&self, account: &Account) -> String {
        self.settings
            .endpoint_template
            .replace("{region}", &account.region)
    }

    /// Maps a non-success response to the error taxonomy. 401/403/404 are
    /// permanent; 429 and 5xx are transient.
    async fn reject(resp: reqwest::Response) -> CloudError {
        let status = resp.status();
        let message = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudError::Unauthorized(message),
            StatusCode::NOT_FOUND => CloudError::NotFound(message),
            _ => CloudError::Api {
                status: status.as_u16(),
                message,
            },
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        account: &Account,
        url: &str,
    ) -> Result<T, CloudError> {
        let resp = self
            .http
            .get(url)
            .header(AUTH_TOKEN_HEADER, &account.api_token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::reject(resp).await);
        }
        resp.json::<T>()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))
    }
}

fn to_gigabytes(amount: f64, unit: Option<&str>) -> Result<f64, CloudError> {
    match unit.map(|u| u.to_ascii_uppercase()).as_deref() {
        None | Some("GB") => Ok(amount),
        Some("MB") => Ok(amount / 1024.0),
        Some("TB") => Ok(amount * 1024.0),
        Some(other) => Err(CloudError::Decode(format!(
            "unknown traffic measure unit: {other}"
        ))),
    }
}

fn parse_instance(detail: ServerDetail) -> Instance {
    let status = match detail.status.as_str() {
        "ACTIVE" => InstanceStatus::Active,
        "SHUTOFF" => InstanceStatus::Shutoff,
        other => InstanceStatus::Other(other.to_string()),
    };
    let mut public_ip = None;
    let mut private_ip = None;
    for entry in detail.addresses.values().flatten() {
        if entry.ip_type == "floating" {
            public_ip.get_or_insert_with(|| entry.addr.clone());
        } else {
            private_ip.get_or_insert_with(|| entry.addr.clone());
        }
    }
    Instance {
        id: detail.id,
        name: detail.name,
        status,
        public_ip,
        private_ip,
    }
}

#[async_trait]
impl CloudClient for RestCloudClient {
    async fn list_instances(&self, account: &Account) -> Result<Vec<Instance>, CloudError> {
        let url = format!(
            "{}/v1/{}/cloudservers/detail",
            self.base_url(account),
            account.project_id
        );
        let resp: ServerListResponse = self.get_json(account, &url).await?;
        debug!(
            account_id = account.id,
            count = resp.servers.len(),
            "Listed instances."
        );
        Ok(resp.servers.into_iter().map(parse_instance).collect())
    }

    async fn query_traffic(
        &self,
        account: &Account,
        instance: &Instance,
    ) -> Result<TrafficQuery, CloudError> {
        let url = format!(
            "{}/v1/{}/cloudservers/{}/traffic-quota",
            self.base_url(account),
            account.project_id,
            instance.id
        );
        let resp: TrafficQuotaResponse = match self.get_json(account, &url).await {
            Ok(resp) => resp,
            // A quota endpoint 404 means the instance carries no package.
            Err(CloudError::NotFound(_)) => return Ok(TrafficQuery::NotApplicable),
            Err(e) => return Err(e),
        };
        let Some(measure) = resp.free_resource_measure else {
            return Ok(TrafficQuery::NotApplicable);
        };
        let unit = measure.measure_unit.as_deref();
        Ok(TrafficQuery::Reading(TrafficReading {
            total_gb: to_gigabytes(measure.amount, unit)?,
            used_gb: to_gigabytes(measure.used_amount, unit)?,
            remaining_gb: to_gigabytes(measure.available_amount, unit)?,
            checked_at: Utc::now(),
        }))
    }

    async fn power_action(
        &self,
        account: &Account,
        instance_ids: &[String],
        action: PowerAction,
        mode: PowerMode,
    ) -> Result<JobHandle, CloudError> {
        let servers: Vec<_> = instance_ids.iter().map(|id| json!({ "id": id })).collect();
        let body = match action {
            PowerAction::Stop => json!({
                "os-stop": { "type": mode.as_str(), "servers": servers }
            }),
            PowerAction::Start => json!({
                "os-start": { "servers": servers }
            }),
            PowerAction::Reboot => json!({
                "reboot": { "type": mode.as_str(), "servers": servers }
            }),
        };
        let url = format!(
            "{}/v1/{}/cloudservers/action",
            self.base_url(account),
            account.project_id
        );
        let resp = self
            .http
            .post(&url)
            .header(AUTH_TOKEN_HEADER, &account.api_token)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::reject(resp).await);
        }
        let parsed: PowerActionResponse = resp
            .json()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))?;
        if parsed.job_id.is_empty() {
            warn!(account_id = account.id, "Power action returned an empty job id.");
            return Err(CloudError::Decode("empty job_id in power action response".into()));
        }
        Ok(JobHandle { id: parsed.job_id })
    }

    async fn poll_job(
        &self,
        account: &Account,
        job: &JobHandle,
    ) -> Result<JobProbe, CloudError> {
        let url = format!(
            "{}/v1/{}/jobs/{}",
            self.base_url(account),
            account.project_id,
            job.id
        );
        self.get_json(account, &url).await
    }
}
