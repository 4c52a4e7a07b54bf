//! Thin HTTP client over the coordinator's API (§6.1).

use reqwest::StatusCode;
use serde_json::Value;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::types::{
    CreateSubmissionsRequest, CreateSubmissionsResponse, CreatedSubmission, ErrorBody, HealthResponse, ListResponse,
    SubmissionStatusFilter, SubmissionView,
};

#[derive(Debug, Clone)]
pub struct BespokeClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl BespokeClient {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ClientError::from)?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> ClientResult<reqwest::Url> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| ClientError::config_error(format!("cannot build request URL for '{path}': {e}")))
    }

    async fn error_from_response(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        match response.json::<ErrorBody>().await {
            Ok(body) => ClientError::api_error(status, body.error, body.message),
            Err(_) => ClientError::api_error(status, "unknown", "coordinator returned a non-JSON error body"),
        }
    }

    /// `POST /submissions` — submits one or more workflow documents (§6.1).
    pub async fn submit(&self, workflows: Vec<Value>) -> ClientResult<Vec<CreatedSubmission>> {
        let response = self
            .http
            .post(self.url("/submissions")?)
            .json(&CreateSubmissionsRequest { workflows })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        let body: CreateSubmissionsResponse = response.json().await?;
        Ok(body.submissions)
    }

    /// `GET /submissions/{id}`.
    pub async fn get(&self, id: u64) -> ClientResult<SubmissionView> {
        let response = self.http.get(self.url(&format!("/submissions/{id}"))?).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::SubmissionNotFound { id });
        }
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// `GET /submissions?status=&cursor=&limit=`.
    pub async fn list(
        &self,
        status: Option<SubmissionStatusFilter>,
        cursor: Option<u64>,
        limit: Option<usize>,
    ) -> ClientResult<ListResponse> {
        let mut url = self.url("/submissions")?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(status) = status {
                pairs.append_pair("status", status.as_str());
            }
            if let Some(cursor) = cursor {
                pairs.append_pair("cursor", &cursor.to_string());
            }
            if let Some(limit) = limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// `DELETE /submissions/{id}` — idempotent (§8 invariant 6).
    pub async fn cancel(&self, id: u64) -> ClientResult<()> {
        let response = self.http.delete(self.url(&format!("/submissions/{id}"))?).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::SubmissionNotFound { id });
        }
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(())
    }

    /// `GET /health`.
    pub async fn health(&self) -> ClientResult<HealthResponse> {
        let response = self.http.get(self.url("/health")?).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(response.json().await?)
    }
}
