use chrono::Utc;
use futures_util::StreamExt;
use progress_core::{decode_snapshot_slice, ProgressState, WorkspaceId};
use reqwest::StatusCode;

use crate::{FailureKind, FetchError, SnapshotSettings};

/// Pull side: reads the persisted progress record of a workspace's job.
///
/// `Ok(None)` means no job has ever run for the workspace.
#[async_trait::async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, workspace_id: &WorkspaceId) -> Result<Option<ProgressState>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestSnapshotFetcher {
    settings: SnapshotSettings,
    base_url: reqwest::Url,
    client: reqwest::Client,
}

impl ReqwestSnapshotFetcher {
    pub fn new(settings: SnapshotSettings) -> Result<Self, FetchError> {
        let base_url = reqwest::Url::parse(&settings.base_url)
            .map_err(|err| FetchError::new(FailureKind::InvalidUrl, err.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(FetchError::new(
                FailureKind::InvalidUrl,
                format!("{} cannot be a base url", settings.base_url),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| FetchError::new(FailureKind::Network, err.to_string()))?;
        Ok(Self {
            settings,
            base_url,
            client,
        })
    }

    /// `{base_url}/workspaces/{id}/analysis-progress`, with the id escaped.
    pub fn snapshot_url(&self, workspace_id: &WorkspaceId) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["workspaces", workspace_id.as_str(), "analysis-progress"]);
        }
        url
    }
}

#[async_trait::async_trait]
impl SnapshotFetcher for ReqwestSnapshotFetcher {
    async fn fetch(&self, workspace_id: &WorkspaceId) -> Result<Option<ProgressState>, FetchError> {
        let mut request = self.client.get(self.snapshot_url(workspace_id));
        if let Some(token) = &self.settings.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::new(
                FailureKind::HttpStatus(status.as_u16()),
                status.to_string(),
            ));
        }

        let max_bytes = self.settings.max_bytes;
        if let Some(content_len) = response.content_length() {
            if content_len > max_bytes {
                return Err(too_large(max_bytes, content_len));
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            let next_len = body.len() as u64 + chunk.len() as u64;
            if next_len > max_bytes {
                return Err(too_large(max_bytes, next_len));
            }
            body.extend_from_slice(&chunk);
        }

        decode_snapshot_slice(&body, Utc::now())
            .map(Some)
            .map_err(|err| FetchError::new(FailureKind::Malformed, err.to_string()))
    }
}

fn too_large(max_bytes: u64, actual: u64) -> FetchError {
    FetchError::new(
        FailureKind::TooLarge {
            max_bytes,
            actual: Some(actual),
        },
        "snapshot too large",
    )
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::new(FailureKind::Timeout, err.to_string());
    }
    FetchError::new(FailureKind::Network, err.to_string())
}
