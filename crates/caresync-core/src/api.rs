//! Server Sync API client.
//!
//! `SyncApi` is the seam the Sync Engine talks through; the reqwest
//! implementation below targets the central server, and tests substitute
//! a scripted in-memory fake.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One queued mutation on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOperation {
    pub entity_type: String,
    pub entity_local_id: String,
    pub operation_type: String,
    pub payload: serde_json::Value,
    pub base_version: i64,
}

/// Body of `POST /sync/push`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub device_id: String,
    pub operations: Vec<PushOperation>,
}

/// Per-operation outcome returned by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PushStatus {
    Applied,
    Conflict,
}

/// One entry of a push response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub entity_local_id: String,
    pub status: PushStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// Server-side payload, present on conflict so the resolver can diff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_payload: Option<serde_json::Value>,
}

/// Body of a push response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub results: Vec<PushResult>,
}

/// One server-side record update from a pull
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerUpdate {
    pub entity_type: String,
    pub server_id: String,
    pub version: i64,
    pub payload: serde_json::Value,
}

/// Body of `GET /sync/pull`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub updates: Vec<ServerUpdate>,
}

/// Body of `GET /sync/status/:deviceId`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSyncStatus {
    pub device_id: String,
    pub outstanding_operations: u64,
    pub open_conflicts: u64,
}

/// Body of `POST /offline/download-bundle`: a full version-stamped snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleResponse {
    pub entities: Vec<ServerUpdate>,
}

/// Body of `GET /time`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeResponse {
    /// Echo of the request arrival (Unix ms)
    pub timestamp: i64,
    /// Authoritative server clock reading (Unix ms)
    pub server_time: i64,
}

/// A conflict as reviewed on the server's operator surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConflict {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub local_version: i64,
    pub server_version: i64,
}

/// Body of `POST /offline/conflicts/:id/resolve`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictRequest {
    pub winning_payload: serde_json::Value,
    pub resolved_by: String,
}

/// Server Sync API consumed by the Sync Engine and Clock Service.
#[async_trait]
pub trait SyncApi: Send + Sync {
    /// `POST /sync/push`
    async fn push(&self, request: &PushRequest) -> Result<PushResponse>;

    /// `GET /sync/pull?deviceId&since`
    async fn pull(&self, device_id: &str, since: i64) -> Result<PullResponse>;

    /// `GET /sync/status/:deviceId`
    async fn status(&self, device_id: &str) -> Result<ServerSyncStatus>;

    /// `POST /offline/download-bundle`
    async fn download_bundle(&self, device_id: &str) -> Result<BundleResponse>;

    /// `GET /offline/conflicts`
    async fn list_conflicts(&self) -> Result<Vec<ServerConflict>>;

    /// `POST /offline/conflicts/:id/resolve`
    async fn resolve_conflict(&self, id: &str, request: &ResolveConflictRequest) -> Result<()>;

    /// `GET /time`
    async fn server_time(&self) -> Result<TimeResponse>;
}

/// reqwest-backed `SyncApi` implementation
#[derive(Clone)]
pub struct HttpSyncApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSyncApi {
    /// Build a client for the given server base URL.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        Ok(Self {
            base_url,
            client: reqwest::Client::builder().build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let response = check_status(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl SyncApi for HttpSyncApi {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
        let response = self
            .client
            .post(self.url("/sync/push"))
            .json(request)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn pull(&self, device_id: &str, since: i64) -> Result<PullResponse> {
        let response = self
            .client
            .get(self.url("/sync/pull"))
            .query(&[("deviceId", device_id), ("since", &since.to_string())])
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn status(&self, device_id: &str) -> Result<ServerSyncStatus> {
        let response = self
            .client
            .get(self.url(&format!("/sync/status/{device_id}")))
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn download_bundle(&self, device_id: &str) -> Result<BundleResponse> {
        let response = self
            .client
            .post(self.url("/offline/download-bundle"))
            .json(&serde_json::json!({ "deviceId": device_id }))
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn list_conflicts(&self) -> Result<Vec<ServerConflict>> {
        let response = self
            .client
            .get(self.url("/offline/conflicts"))
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn resolve_conflict(&self, id: &str, request: &ResolveConflictRequest) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/offline/conflicts/{id}/resolve")))
            .json(request)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn server_time(&self) -> Result<TimeResponse> {
        let response = self.client.get(self.url("/time")).send().await?;
        Self::read_json(response).await
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    /// 429 responses carry the server-mandated delay in milliseconds
    #[serde(default, rename = "retryAfter")]
    retry_after: Option<i64>,
}

/// Map non-success statuses onto the error taxonomy.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let parsed = serde_json::from_str::<ApiErrorBody>(&body).ok();
    let message = parsed
        .as_ref()
        .and_then(|b| b.message.clone().or_else(|| b.error.clone()))
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                format!("{trimmed} ({})", status.as_u16())
            }
        });

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Auth(message)),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after_ms = parsed
                .and_then(|b| b.retry_after)
                .unwrap_or(0);
            Err(Error::RateLimited { retry_after_ms })
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            Err(Error::Validation(message))
        }
        _ => Err(Error::Network(message)),
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("server URL must not be empty".to_string()));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.trim_end_matches('/').to_string())
    } else {
        Err(Error::Validation(
            "server URL must include http:// or https://".to_string(),
        ))
    }
}
