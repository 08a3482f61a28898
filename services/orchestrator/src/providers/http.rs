//! Recovery gateway client.
//!
//! Talks JSON over HTTP to a gateway that fronts the cloud recovery and
//! compute APIs. Account scoping travels as request headers; the gateway
//! performs the actual role assumption.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    ActiveJob, ComputeInstanceService, CredentialBroker, CredentialScope, InstanceDescription,
    JobDescription, ProviderClients, ProviderError, ProviderResult, RecoveryJobService,
    SourceServer,
};
use crate::model::AccountContext;

pub const ACCOUNT_HEADER: &str = "X-Drx-Account-Id";
pub const ROLE_HEADER: &str = "X-Drx-Assume-Role";
pub const EXTERNAL_ID_HEADER: &str = "X-Drx-External-Id";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartJobRequest<'a> {
    source_server_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartJobResponse {
    job_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceServersRequest<'a> {
    source_server_ids: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstancesRequest<'a> {
    instance_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminateResponse {
    #[serde(default)]
    terminated_instance_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// Gateway client scoped to at most one account.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    account: Option<AccountContext>,
}

impl HttpProvider {
    /// Create a client carrying the caller's own credentials.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Rejected(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            account: None,
        })
    }

    /// The same client scoped to an account context.
    pub fn scoped(&self, account: AccountContext) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            account: Some(account),
        }
    }

    fn url(&self, region: &str, path: &str) -> String {
        format!("{}/v1/regions/{}/{}", self.base_url, region, path)
    }

    fn with_account(&self, request: RequestBuilder) -> RequestBuilder {
        let Some(account) = &self.account else {
            return request;
        };
        let mut request = request.header(ACCOUNT_HEADER, &account.account_id);
        if let Some(role) = &account.assume_role_name {
            request = request.header(ROLE_HEADER, role);
        }
        if let Some(external_id) = &account.external_id {
            request = request.header(EXTERNAL_ID_HEADER, external_id);
        }
        request
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> ProviderResult<T> {
        let response = self
            .with_account(request)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

/// Maps a non-success response onto a provider error.
async fn check_status(response: Response) -> ProviderResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = format!("{status}: {body}");
    warn!(status = %status, body = %body, "Gateway request failed");

    Err(match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound(detail),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Transient(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Credentials(detail),
        s if s.is_server_error() => ProviderError::Transient(detail),
        _ => ProviderError::Rejected(detail),
    })
}

#[async_trait]
impl RecoveryJobService for HttpProvider {
    async fn start_job(&self, region: &str, server_ids: &[String]) -> ProviderResult<String> {
        let url = self.url(region, "jobs");
        debug!(url = %url, servers = server_ids.len(), "Starting recovery job");

        let body = StartJobRequest {
            source_server_ids: server_ids,
        };
        let response: StartJobResponse = self.send(self.client.post(&url).json(&body)).await?;
        Ok(response.job_id)
    }

    async fn describe_job(&self, region: &str, job_id: &str) -> ProviderResult<JobDescription> {
        let url = self.url(region, &format!("jobs/{job_id}"));
        self.send(self.client.get(&url)).await
    }

    async fn list_active_jobs(&self, region: &str) -> ProviderResult<Vec<ActiveJob>> {
        let url = self.url(region, "jobs");
        let list: ItemList<ActiveJob> = self
            .send(self.client.get(&url).query(&[("active", "true")]))
            .await?;
        Ok(list.items)
    }

    async fn describe_source_servers(
        &self,
        region: &str,
        server_ids: &[String],
    ) -> ProviderResult<Vec<SourceServer>> {
        let url = self.url(region, "source-servers:describe");
        let body = SourceServersRequest {
            source_server_ids: server_ids,
        };
        let list: ItemList<SourceServer> = self.send(self.client.post(&url).json(&body)).await?;
        Ok(list.items)
    }
}

#[async_trait]
impl ComputeInstanceService for HttpProvider {
    async fn describe_instances(
        &self,
        region: &str,
        instance_ids: &[String],
    ) -> ProviderResult<Vec<InstanceDescription>> {
        if instance_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.url(region, "instances:describe");
        let body = InstancesRequest { instance_ids };
        let list: ItemList<InstanceDescription> =
            self.send(self.client.post(&url).json(&body)).await?;
        Ok(list.items)
    }

    async fn terminate_instances(
        &self,
        region: &str,
        instance_ids: &[String],
    ) -> ProviderResult<Vec<String>> {
        let url = self.url(region, "instances:terminate");
        debug!(url = %url, instances = instance_ids.len(), "Terminating instances");
        let body = InstancesRequest { instance_ids };
        let response: TerminateResponse = self.send(self.client.post(&url).json(&body)).await?;
        Ok(response.terminated_instance_ids)
    }
}

/// Broker that scopes gateway clients by request headers.
#[derive(Debug, Clone)]
pub struct HttpBroker {
    caller: HttpProvider,
}

impl HttpBroker {
    pub fn new(caller: HttpProvider) -> Self {
        Self { caller }
    }

    fn clients(provider: HttpProvider, scope: CredentialScope) -> ProviderClients {
        let provider = Arc::new(provider);
        ProviderClients {
            jobs: provider.clone(),
            compute: provider,
            scope,
        }
    }
}

#[async_trait]
impl CredentialBroker for HttpBroker {
    async fn resolve(&self, context: &AccountContext) -> ProviderResult<ProviderClients> {
        if !context.is_current_account && context.assume_role_name.is_none() {
            return Err(ProviderError::Credentials(format!(
                "account {} is not the current account and names no role to assume",
                context.account_id
            )));
        }

        Ok(Self::clients(
            self.caller.scoped(context.clone()),
            CredentialScope::Account {
                account_id: context.account_id.clone(),
            },
        ))
    }

    fn caller_clients(&self) -> ProviderClients {
        Self::clients(self.caller.clone(), CredentialScope::CallerFallback)
    }
}
