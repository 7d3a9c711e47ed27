//! HTTP clients for the recognition, ID resolution and training services.
//!
//! Each remote collaborator sits behind an `async_trait` trait so the
//! workflow can be driven by in-memory fakes. No call is retried: a failed
//! recognition is surfaced so the operator re-captures with fresh frames.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Url;
use rollcall_core::ResolvedIdentity;
use rollcall_hw::EncodedFrame;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Error, Debug)]
pub enum RecognitionServiceError {
    #[error("recognition service timed out after {0:?}")]
    Timeout(Duration),
    #[error("recognition service unreachable: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("recognition service returned HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("recognition service rejected the request: {0}")]
    Rejected(String),
    #[error("recognition service returned an unreadable body: {0}")]
    InvalidBody(String),
}

#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("resolution service unreachable: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("resolution service returned HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("resolution service returned an unreadable body: {0}")]
    InvalidBody(String),
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid service url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to build http client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Outcome of a training run, as reported by the recognition service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrainingReport {
    pub students_trained: u32,
    pub total_samples: u32,
    /// Students the run produced a model for, when the service lists them.
    pub trained_student_ids: Vec<String>,
}

#[async_trait]
pub trait RecognitionService: Send + Sync {
    /// Upload one capture; returns the raw, schema-unstable payload.
    async fn recognize(
        &self,
        course_id: &str,
        batch_id: &str,
        frames: &[EncodedFrame],
    ) -> Result<Value, RecognitionServiceError>;
}

#[async_trait]
pub trait IdResolutionService: Send + Sync {
    async fn resolve(&self, ids: &[String]) -> Result<Vec<ResolvedIdentity>, ResolutionError>;
}

#[async_trait]
pub trait TrainingService: Send + Sync {
    async fn run_training(&self, course_id: &str) -> Result<TrainingReport, RecognitionServiceError>;
}

/// One client for all three services.
pub struct HttpServiceClient {
    recognition: Url,
    resolution: Url,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpServiceClient {
    pub fn new(recognition_url: &str, resolution_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5).min(timeout))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            recognition: base_url(recognition_url)?,
            resolution: base_url(resolution_url)?,
            timeout,
            client,
        })
    }

    fn transport(&self, err: reqwest::Error) -> RecognitionServiceError {
        if err.is_timeout() {
            RecognitionServiceError::Timeout(self.timeout)
        } else {
            RecognitionServiceError::Transport(err)
        }
    }

    /// Read a recognition-service response, mapping failures and embedded
    /// `error` fields onto [`RecognitionServiceError`].
    async fn read_json(&self, resp: reqwest::Response) -> Result<Value, RecognitionServiceError> {
        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.transport(e))?;

        if !status.is_success() {
            if status.is_client_error() {
                if let Some(message) = service_message(&body) {
                    return Err(RecognitionServiceError::Rejected(message));
                }
            }
            return Err(RecognitionServiceError::Status {
                code: status.as_u16(),
                body: truncate(&body),
            });
        }

        let value: Value =
            serde_json::from_str(&body).map_err(|e| RecognitionServiceError::InvalidBody(e.to_string()))?;
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return Err(RecognitionServiceError::Rejected(message.to_string()));
        }
        Ok(value)
    }
}

#[async_trait]
impl RecognitionService for HttpServiceClient {
    #[instrument(skip_all, fields(course_id = %course_id, batch_id = %batch_id, frames = frames.len()))]
    async fn recognize(
        &self,
        course_id: &str,
        batch_id: &str,
        frames: &[EncodedFrame],
    ) -> Result<Value, RecognitionServiceError> {
        let mut form = Form::new()
            .text("courseId", course_id.to_string())
            .text("batchId", batch_id.to_string());
        for frame in frames {
            let part = Part::bytes(frame.jpeg.clone())
                .file_name(frame.file_name())
                .mime_str("image/jpeg")
                .map_err(RecognitionServiceError::Transport)?;
            form = form.part("frames", part);
        }

        let url = endpoint(&self.recognition, "api/recognize");
        tracing::debug!(%url, "dispatching recognition request");
        let resp = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        self.read_json(resp).await
    }
}

#[async_trait]
impl TrainingService for HttpServiceClient {
    #[instrument(skip_all, fields(course_id = %course_id))]
    async fn run_training(&self, course_id: &str) -> Result<TrainingReport, RecognitionServiceError> {
        let resp = self
            .client
            .post(endpoint(&self.recognition, "api/train"))
            .json(&serde_json::json!({ "courseId": course_id }))
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let value = self.read_json(resp).await?;
        serde_json::from_value(value).map_err(|e| RecognitionServiceError::InvalidBody(e.to_string()))
    }
}

#[async_trait]
impl IdResolutionService for HttpServiceClient {
    #[instrument(skip_all, fields(ids = ids.len()))]
    async fn resolve(&self, ids: &[String]) -> Result<Vec<ResolvedIdentity>, ResolutionError> {
        let resp = self
            .client
            .post(endpoint(&self.resolution, "api/students/resolve"))
            .json(&serde_json::json!({ "ids": ids }))
            .send()
            .await
            .map_err(ResolutionError::Transport)?;

        let status = resp.status();
        let body = resp.text().await.map_err(ResolutionError::Transport)?;
        if !status.is_success() {
            return Err(ResolutionError::Status {
                code: status.as_u16(),
                body: truncate(&body),
            });
        }
        serde_json::from_str(&body).map_err(|e| ResolutionError::InvalidBody(e.to_string()))
    }
}

/// Parse a base URL so that relative endpoints append to its path.
fn base_url(raw: &str) -> Result<Url, ClientError> {
    let with_slash = format!("{}/", raw.trim().trim_end_matches('/'));
    let url = Url::parse(&with_slash).map_err(|e| ClientError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(ClientError::InvalidUrl {
            url: raw.to_string(),
            reason: "expected an http(s) base url".into(),
        });
    }
    Ok(url)
}

fn endpoint(base: &Url, path: &str) -> Url {
    // `base` always ends in '/', so joining a relative path cannot fail.
    base.join(path).unwrap_or_else(|_| base.clone())
}

/// The `error` or `detail` string a service put in a failure body.
fn service_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["error", "detail", "message"]
        .iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY).collect()
}
