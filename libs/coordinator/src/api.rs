//! Typed coordinator endpoints.
//!
//! Thin request/response mapping over the transport client: runner
//! registration and verification, job polling, job-status updates and trace
//! patches. Status handling mirrors the coordinator contract: updates and
//! patches never fail with an error, they fold every outcome into a result
//! state the callers act on.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use quarry_core::config::RunnerConfig;
use quarry_core::job::{JobCredentials, JobFailureReason, JobInfo, JobState};
use quarry_core::version;

use crate::client_pool::ClientPool;
use crate::transport::{TransportError, TEXT_PLAIN_MIME};
use crate::MAX_UPDATE_INTERVAL;

const JOB_TOKEN_HEADER: &str = "job-token";
const JOB_STATUS_HEADER: &str = "job-status";
const TRACE_UPDATE_INTERVAL_HEADER: &str = "x-gitlab-trace-update-interval";
const RANGE_HEADER: &str = "range";

/// Failures surfaced by the explicit-error endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{method} {path}: {message}")]
    Status {
        method: Method,
        path: String,
        status: u16,
        message: String,
    },
}

/// Outcome of a `PUT /jobs/{id}` update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Succeeded,
    /// Accepted but not yet processed; resend later.
    Accepted,
    /// The coordinator rejected the submitted trace; restart from offset 0.
    TraceValidationFailed,
    NotFound,
    /// The job was canceled or failed server-side.
    Aborted,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct UpdateJobResult {
    pub state: UpdateState,
    pub new_update_interval: Option<Duration>,
}

/// Outcome of a `PATCH /jobs/{id}/trace` patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Succeeded,
    /// The server expects a different offset; resume from `sent_offset`.
    RangeMismatch,
    NotFound,
    /// The job was canceled or failed server-side.
    Aborted,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct PatchTraceResult {
    pub sent_offset: usize,
    pub state: PatchState,
    pub new_update_interval: Option<Duration>,
}

/// Fields describing this agent, sent on every mutating call.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerInfo {
    pub name: String,
    pub version: String,
    pub revision: String,
    pub platform: String,
    pub architecture: String,
}

impl RunnerInfo {
    fn current() -> Self {
        Self {
            name: version::NAME.to_string(),
            version: version::VERSION.to_string(),
            revision: version::REVISION.to_string(),
            platform: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RegisterRunnerRequest<'a> {
    info: RunnerInfo,
    token: &'a str,
    description: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRunnerResponse {
    pub token: String,
}

#[derive(Debug, Serialize)]
struct VerifyRunnerRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Serialize)]
struct UnregisterRunnerRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Serialize)]
struct JobRequest<'a> {
    info: RunnerInfo,
    token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_update: Option<String>,
}

/// Status payload for a job update.
#[derive(Debug, Clone)]
pub struct UpdateJobInfo {
    pub state: JobState,
    pub failure_reason: Option<JobFailureReason>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Serialize)]
struct UpdateJobRequest<'a> {
    info: RunnerInfo,
    token: &'a str,
    state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_reason: Option<JobFailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
}

/// Coordinator API surface shared by every runner.
#[derive(Default)]
pub struct Coordinator {
    pool: ClientPool,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `POST /runners` — 201 on success.
    pub async fn register_runner(
        &self,
        config: &RunnerConfig,
        description: &str,
    ) -> Result<RegisterRunnerResponse, ApiError> {
        let client = self.pool.client_for(config)?;
        let request = RegisterRunnerRequest {
            info: RunnerInfo::current(),
            token: &config.token,
            description,
        };

        let response = client
            .do_json::<_, RegisterRunnerResponse>(
                Method::POST,
                "runners",
                StatusCode::CREATED,
                Some(&request),
                HeaderMap::new(),
            )
            .await?;

        match response.body {
            Some(body) if response.status == StatusCode::CREATED => {
                info!(runner = %config.short_description(), "Registering runner... succeeded");
                Ok(body)
            }
            _ => {
                error!(
                    runner = %config.short_description(),
                    status = %response.message,
                    "Registering runner... failed"
                );
                Err(status_error(Method::POST, "runners", &response.status, response.message))
            }
        }
    }

    /// `POST /runners/verify` — 200 on success.
    pub async fn verify_runner(&self, config: &RunnerConfig) -> Result<(), ApiError> {
        let client = self.pool.client_for(config)?;
        let request = VerifyRunnerRequest {
            token: &config.token,
        };

        let response = client
            .do_json::<_, serde_json::Value>(
                Method::POST,
                "runners/verify",
                StatusCode::OK,
                Some(&request),
                HeaderMap::new(),
            )
            .await?;

        if response.status == StatusCode::OK {
            info!(runner = %config.short_description(), "Verifying runner... is alive");
            return Ok(());
        }
        warn!(
            runner = %config.short_description(),
            status = %response.message,
            "Verifying runner... failed"
        );
        Err(status_error(Method::POST, "runners/verify", &response.status, response.message))
    }

    /// `DELETE /runners` — 204 on success.
    pub async fn unregister_runner(&self, config: &RunnerConfig) -> Result<(), ApiError> {
        let client = self.pool.client_for(config)?;
        let request = UnregisterRunnerRequest {
            token: &config.token,
        };

        let response = client
            .do_json::<_, serde_json::Value>(
                Method::DELETE,
                "runners",
                StatusCode::NO_CONTENT,
                Some(&request),
                HeaderMap::new(),
            )
            .await?;

        if response.status == StatusCode::NO_CONTENT {
            info!(runner = %config.short_description(), "Unregistering runner... succeeded");
            return Ok(());
        }
        warn!(
            runner = %config.short_description(),
            status = %response.message,
            "Unregistering runner... failed"
        );
        Err(status_error(Method::DELETE, "runners", &response.status, response.message))
    }

    /// `POST /jobs/request` — 201 with a job, 204 when none is queued.
    ///
    /// The opaque last-update marker from the previous poll is echoed so the
    /// coordinator can long-poll efficiently. Transient failures surface as
    /// `Ok(None)`; the scheduler just polls again.
    pub async fn request_job(&self, config: &RunnerConfig) -> Result<Option<JobInfo>, ApiError> {
        let client = self.pool.client_for(config)?;
        let request = JobRequest {
            info: RunnerInfo::current(),
            token: &config.token,
            last_update: client.last_update(),
        };

        let response = client
            .do_json::<_, JobInfo>(
                Method::POST,
                "jobs/request",
                StatusCode::CREATED,
                Some(&request),
                HeaderMap::new(),
            )
            .await?;

        match response.status {
            StatusCode::CREATED => match response.body {
                Some(job) => {
                    info!(job = job.id, "Checking for jobs... received");
                    Ok(Some(job))
                }
                None => {
                    warn!("Checking for jobs... malformed job payload");
                    Ok(None)
                }
            },
            StatusCode::NO_CONTENT => {
                debug!("Checking for jobs... nothing");
                Ok(None)
            }
            StatusCode::FORBIDDEN => {
                error!(status = %response.message, "Checking for jobs... forbidden");
                Err(status_error(Method::POST, "jobs/request", &response.status, response.message))
            }
            _ => {
                warn!(status = %response.message, "Checking for jobs... failed");
                Ok(None)
            }
        }
    }

    /// `PUT /jobs/{id}` — submit job state; all outcomes fold into
    /// `UpdateJobResult`.
    pub async fn update_job(
        &self,
        config: &RunnerConfig,
        credentials: &JobCredentials,
        info: UpdateJobInfo,
    ) -> UpdateJobResult {
        let failed_result = UpdateJobResult {
            state: UpdateState::Failed,
            new_update_interval: None,
        };

        let client = match self.pool.client_for(config) {
            Ok(client) => client,
            Err(err) => {
                error!(job = credentials.id, error = %err, "Submitting job to coordinator... error");
                return failed_result;
            }
        };

        let request = UpdateJobRequest {
            info: RunnerInfo::current(),
            token: &credentials.token,
            state: info.state,
            failure_reason: info.failure_reason,
            exit_code: info.exit_code,
        };
        let path = format!("jobs/{}", credentials.id);

        let response = match client
            .do_json::<_, serde_json::Value>(
                Method::PUT,
                &path,
                StatusCode::OK,
                Some(&request),
                job_token_headers(&credentials.token),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!(job = credentials.id, error = %err, "Submitting job to coordinator... error");
                return failed_result;
            }
        };

        let remote = RemoteJobState::from_headers(&response.headers);
        let result_state = if remote.is_aborted() {
            warn!(job = credentials.id, job_status = remote.state.as_deref().unwrap_or(""),
                  "Submitting job to coordinator... job failed");
            UpdateState::Aborted
        } else {
            match response.status {
                StatusCode::OK => {
                    debug!(job = credentials.id, "Submitting job to coordinator... ok");
                    UpdateState::Succeeded
                }
                StatusCode::ACCEPTED => {
                    debug!(job = credentials.id, "Submitting job to coordinator... accepted, but not yet completed");
                    UpdateState::Accepted
                }
                StatusCode::PRECONDITION_FAILED => {
                    info!(job = credentials.id, "Submitting job to coordinator... trace validation failed");
                    UpdateState::TraceValidationFailed
                }
                StatusCode::NOT_FOUND => {
                    warn!(job = credentials.id, "Submitting job to coordinator... not found");
                    UpdateState::NotFound
                }
                StatusCode::FORBIDDEN => {
                    error!(job = credentials.id, status = %response.message, "Submitting job to coordinator... forbidden");
                    UpdateState::Aborted
                }
                _ => {
                    warn!(job = credentials.id, status = %response.message, "Submitting job to coordinator... failed");
                    UpdateState::Failed
                }
            }
        };

        UpdateJobResult {
            state: result_state,
            new_update_interval: remote.update_interval,
        }
    }

    /// `PATCH /jobs/{id}/trace` — append a byte range of the job log. The
    /// `Content-Range` header is inclusive on both ends.
    pub async fn patch_trace(
        &self,
        config: &RunnerConfig,
        credentials: &JobCredentials,
        content: Bytes,
        start_offset: usize,
    ) -> PatchTraceResult {
        if content.is_empty() {
            debug!(job = credentials.id, "Appending trace to coordinator... skipped due to empty patch");
            return PatchTraceResult {
                sent_offset: start_offset,
                state: PatchState::Succeeded,
                new_update_interval: None,
            };
        }

        let failed_result = PatchTraceResult {
            sent_offset: start_offset,
            state: PatchState::Failed,
            new_update_interval: None,
        };

        let client = match self.pool.client_for(config) {
            Ok(client) => client,
            Err(err) => {
                error!(job = credentials.id, error = %err, "Appending trace to coordinator... error");
                return failed_result;
            }
        };

        let end_offset = start_offset + content.len();
        let content_range = format!("{}-{}", start_offset, end_offset - 1);

        let mut headers = job_token_headers(&credentials.token);
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            headers.insert(HeaderName::from_static("content-range"), value);
        }

        let path = format!("jobs/{}/trace", credentials.id);
        let response = match client
            .do_raw(Method::PATCH, &path, TEXT_PLAIN_MIME, content, headers)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!(job = credentials.id, error = %err, "Appending trace to coordinator... error");
                return failed_result;
            }
        };

        let status = response.status();
        let remote = RemoteJobState::from_headers(response.headers());
        let remote_range = response
            .headers()
            .get(RANGE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        // The body carries nothing useful; drain it so the connection can be
        // reused.
        let _ = response.bytes().await;

        let mut result = PatchTraceResult {
            sent_offset: start_offset,
            state: PatchState::Failed,
            new_update_interval: remote.update_interval,
        };

        if remote.is_aborted() {
            warn!(job = credentials.id, sent_range = %content_range, "Appending trace to coordinator... job failed");
            result.state = PatchState::Aborted;
            return result;
        }

        match status {
            StatusCode::ACCEPTED => {
                debug!(job = credentials.id, sent_range = %content_range, "Appending trace to coordinator... ok");
                result.sent_offset = end_offset;
                result.state = PatchState::Succeeded;
            }
            StatusCode::NOT_FOUND => {
                warn!(job = credentials.id, "Appending trace to coordinator... not-found");
                result.state = PatchState::NotFound;
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                warn!(job = credentials.id, remote_range = %remote_range, "Appending trace to coordinator... range mismatch");
                result.sent_offset = parse_range_end(&remote_range).unwrap_or(start_offset);
                result.state = PatchState::RangeMismatch;
            }
            StatusCode::FORBIDDEN => {
                error!(job = credentials.id, "Appending trace to coordinator... forbidden");
                result.state = PatchState::Aborted;
            }
            _ => {
                warn!(job = credentials.id, status = status.as_u16(), "Appending trace to coordinator... failed");
            }
        }
        result
    }
}

fn status_error(method: Method, path: &str, status: &StatusCode, message: String) -> ApiError {
    ApiError::Status {
        method,
        path: path.to_string(),
        status: status.as_u16(),
        message,
    }
}

fn job_token_headers(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(token) {
        headers.insert(HeaderName::from_static(JOB_TOKEN_HEADER), value);
    }
    headers
}

/// Abort hints and pacing advertised through response headers.
#[derive(Debug, Default)]
struct RemoteJobState {
    state: Option<String>,
    update_interval: Option<Duration>,
}

impl RemoteJobState {
    fn from_headers(headers: &HeaderMap) -> Self {
        let state = headers
            .get(JOB_STATUS_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let update_interval = headers
            .get(TRACE_UPDATE_INTERVAL_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| Duration::from_secs(secs).clamp(Duration::from_secs(1), MAX_UPDATE_INTERVAL));

        Self {
            state,
            update_interval,
        }
    }

    fn is_aborted(&self) -> bool {
        matches!(self.state.as_deref(), Some("canceled") | Some("failed"))
    }
}

/// `Range: start-end`; the new sent offset is `end`.
fn parse_range_end(range: &str) -> Option<usize> {
    let (_, end) = range.split_once('-')?;
    end.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_job_state_abort_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(JOB_STATUS_HEADER, HeaderValue::from_static("canceled"));
        assert!(RemoteJobState::from_headers(&headers).is_aborted());

        headers.insert(JOB_STATUS_HEADER, HeaderValue::from_static("failed"));
        assert!(RemoteJobState::from_headers(&headers).is_aborted());

        headers.insert(JOB_STATUS_HEADER, HeaderValue::from_static("running"));
        assert!(!RemoteJobState::from_headers(&headers).is_aborted());

        assert!(!RemoteJobState::from_headers(&HeaderMap::new()).is_aborted());
    }

    #[test]
    fn test_update_interval_clamping() {
        let mut headers = HeaderMap::new();

        headers.insert(TRACE_UPDATE_INTERVAL_HEADER, HeaderValue::from_static("0"));
        assert_eq!(
            RemoteJobState::from_headers(&headers).update_interval,
            Some(Duration::from_secs(1))
        );

        headers.insert(TRACE_UPDATE_INTERVAL_HEADER, HeaderValue::from_static("10"));
        assert_eq!(
            RemoteJobState::from_headers(&headers).update_interval,
            Some(Duration::from_secs(10))
        );

        headers.insert(TRACE_UPDATE_INTERVAL_HEADER, HeaderValue::from_static("3600"));
        assert_eq!(
            RemoteJobState::from_headers(&headers).update_interval,
            Some(Duration::from_secs(60))
        );

        headers.insert(TRACE_UPDATE_INTERVAL_HEADER, HeaderValue::from_static("junk"));
        assert_eq!(RemoteJobState::from_headers(&headers).update_interval, None);
    }

    #[test]
    fn test_range_end_parsing() {
        assert_eq!(parse_range_end("0-80"), Some(80));
        assert_eq!(parse_range_end("100-250"), Some(250));
        assert_eq!(parse_range_end("garbage"), None);
        assert_eq!(parse_range_end(""), None);
    }
}
