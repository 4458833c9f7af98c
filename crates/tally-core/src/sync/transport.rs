//! Transport seam between the engine and the sync API

use crate::sync::protocol::{
    DuplicateCheckRequest, DuplicateCheckResponse, PullResponse, PushRequest, PushResponse,
};
use crate::sync::SyncError;
use crate::util::{compact_text, is_http_url};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

/// Header naming the user a sync request acts for
pub const USER_HEADER: &str = "x-tally-user";

/// Where pushed batches go and pulled changes come from
///
/// The engine only talks to the server through this trait, so tests can
/// substitute an in-memory server.
pub trait SyncTransport: Send + Sync + 'static {
    /// Apply a batch of mutations in client order
    fn push_batch(
        &self,
        user_id: &str,
        request: PushRequest,
    ) -> impl Future<Output = Result<PushResponse, SyncError>> + Send;

    /// Side-effect-free duplicate probe; answers in probe order
    fn check_duplicates(
        &self,
        user_id: &str,
        request: DuplicateCheckRequest,
    ) -> impl Future<Output = Result<DuplicateCheckResponse, SyncError>> + Send;

    /// Changes after `cursor`, oldest first, at most `limit`
    fn pull_changes(
        &self,
        user_id: &str,
        cursor: i64,
        limit: usize,
    ) -> impl Future<Output = Result<PullResponse, SyncError>> + Send;
}

impl<T: SyncTransport> SyncTransport for std::sync::Arc<T> {
    fn push_batch(
        &self,
        user_id: &str,
        request: PushRequest,
    ) -> impl Future<Output = Result<PushResponse, SyncError>> + Send {
        (**self).push_batch(user_id, request)
    }

    fn check_duplicates(
        &self,
        user_id: &str,
        request: DuplicateCheckRequest,
    ) -> impl Future<Output = Result<DuplicateCheckResponse, SyncError>> + Send {
        (**self).check_duplicates(user_id, request)
    }

    fn pull_changes(
        &self,
        user_id: &str,
        cursor: i64,
        limit: usize,
    ) -> impl Future<Output = Result<PullResponse, SyncError>> + Send {
        (**self).pull_changes(user_id, cursor, limit)
    }
}

/// HTTP implementation of [`SyncTransport`]
#[derive(Clone)]
pub struct HttpSyncTransport {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpSyncTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpSyncTransport")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HttpSyncTransport {
    /// Create a transport against the given API base URL
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, SyncError> {
        Self::with_timeout(base_url, token, Duration::from_secs(30))
    }

    /// Create a transport with an explicit request timeout
    pub fn with_timeout(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let base_url = normalize_base_url(base_url.into())?;
        let token = token.into();
        if token.trim().is_empty() {
            return Err(SyncError::Config("API token must not be empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(e.to_string()))?;

        Ok(Self {
            base_url,
            token,
            client,
        })
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        user_id: &str,
    ) -> Result<T, SyncError> {
        let response = request
            .bearer_auth(&self.token)
            .header(USER_HEADER, user_id)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Protocol(e.to_string()))
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        user_id: &str,
        body: &B,
    ) -> Result<T, SyncError> {
        let url = format!("{}{path}", self.base_url);
        self.execute(self.client.post(url).json(body), user_id).await
    }
}

impl SyncTransport for HttpSyncTransport {
    async fn push_batch(
        &self,
        user_id: &str,
        request: PushRequest,
    ) -> Result<PushResponse, SyncError> {
        self.post_json("/v1/sync/push", user_id, &request).await
    }

    async fn check_duplicates(
        &self,
        user_id: &str,
        request: DuplicateCheckRequest,
    ) -> Result<DuplicateCheckResponse, SyncError> {
        self.post_json("/v1/sync/duplicates", user_id, &request).await
    }

    async fn pull_changes(
        &self,
        user_id: &str,
        cursor: i64,
        limit: usize,
    ) -> Result<PullResponse, SyncError> {
        let url = format!(
            "{}/v1/sync/pull?cursor={cursor}&limit={limit}",
            self.base_url
        );
        self.execute(self.client.get(url), user_id).await
    }
}

/// Map a request-level failure: timeouts and connect errors are retryable
fn request_error(error: reqwest::Error) -> SyncError {
    SyncError::Network(error.to_string())
}

/// Map a non-success status: client errors are permanent, the rest transient
fn status_error(status: StatusCode, body: &str) -> SyncError {
    let message = parse_api_error(status, body);
    if status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
    {
        SyncError::Validation(message)
    } else {
        SyncError::Network(message)
    }
}

#[derive(Debug, serde::Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> Result<String, SyncError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Config("base URL must not be empty".to_string()));
    }
    if !is_http_url(trimmed) {
        return Err(SyncError::Config(
            "base URL must include http:// or https://".to_string(),
        ));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}
