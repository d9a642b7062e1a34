use crate::domain::models::SessionRecord;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::record_codec::{build_sync_request, decode_sync_response};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use url::Url;

/// One round trip with the sync service: the full local history goes up and
/// the service's view of the shared history comes back.
#[async_trait]
pub trait HistorySyncClient: Send + Sync {
    async fn exchange(
        &self,
        code: &str,
        records: &[SessionRecord],
    ) -> Result<Vec<SessionRecord>, InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestHistorySyncClient {
    client: Client,
    endpoint: Url,
}

impl ReqwestHistorySyncClient {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| InfraError::Sync(format!("failed to build http client: {error}")))?;
        Ok(Self { client, endpoint })
    }

    fn http_error(status: reqwest::StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            format!("sync service error: http {}", status.as_u16())
        } else {
            format!("sync service error: http {}; body={body}", status.as_u16())
        };
        InfraError::Sync(message)
    }
}

#[async_trait]
impl HistorySyncClient for ReqwestHistorySyncClient {
    async fn exchange(
        &self,
        code: &str,
        records: &[SessionRecord],
    ) -> Result<Vec<SessionRecord>, InfraError> {
        if code.trim().is_empty() {
            return Err(InfraError::Sync("sync code must not be empty".to_string()));
        }

        let request = build_sync_request(code, records);
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|error| InfraError::Sync(format!("network error while syncing history: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Sync(format!("failed reading sync response: {error}")))?;

        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }

        decode_sync_response(&body)
    }
}
