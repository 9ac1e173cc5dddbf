//! Integration tests for the coordinator transport.
//!
//! A mock coordinator verifies the wire contract: retry pacing driven by
//! rate-limit headers, body replay across retries, trace-patch offset
//! handling (202/416/404/403), job polling with the last-update echo and
//! the runner lifecycle endpoints.

use std::time::{Duration, Instant};

use bytes::Bytes;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use quarry_core::config::RunnerConfig;
use quarry_core::job::{JobCredentials, JobState};
use quarry_coordinator::{Coordinator, PatchState, UpdateJobInfo, UpdateState};

fn runner(url: &str) -> RunnerConfig {
    RunnerConfig {
        name: "api-test".into(),
        url: url.into(),
        token: "tok_0123456789".into(),
        executor: "machine".into(),
        limit: 0,
        output_limit_kib: 0,
        tls_ca_file: None,
        tls_cert_file: None,
        tls_key_file: None,
        connection_max_age_secs: 0,
        machine: None,
        host: None,
    }
}

fn credentials() -> JobCredentials {
    JobCredentials {
        id: 42,
        token: "job-tok".into(),
    }
}

fn running_update() -> UpdateJobInfo {
    UpdateJobInfo {
        state: JobState::Running,
        failure_reason: None,
        exit_code: None,
    }
}

#[tokio::test]
async fn test_retry_honors_rate_limit_reset_time() {
    let server = MockServer::start().await;
    let reset_at = (chrono::Utc::now() + chrono::Duration::seconds(2)).to_rfc2822();

    Mock::given(method("POST"))
        .and(path("/api/v4/runners/verify"))
        .respond_with(
            ResponseTemplate::new(429).insert_header("RateLimit-ResetTime", reset_at.as_str()),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v4/runners/verify"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let coordinator = Coordinator::new();
    let started = Instant::now();
    coordinator.verify_runner(&runner(&server.uri())).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1), "slept only {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(3), "slept {elapsed:?}");

    // The retried request carries the original body bytes.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, requests[1].body);
    assert!(!requests[0].body.is_empty());
}

#[tokio::test]
async fn test_retry_honors_retry_after_seconds() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v4/runners/verify"))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v4/runners/verify"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let coordinator = Coordinator::new();
    let started = Instant::now();
    coordinator.verify_runner(&runner(&server.uri())).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_retry_gives_up_after_max_attempts() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api/v4/jobs/42"))
        .respond_with(ResponseTemplate::new(502))
        .expect(5)
        .mount(&server)
        .await;

    let coordinator = Coordinator::new();
    let result = coordinator
        .update_job(&runner(&server.uri()), &credentials(), running_update())
        .await;

    assert_eq!(result.state, UpdateState::Failed);
}

#[tokio::test]
async fn test_non_retryable_status_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v4/runners/verify"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = Coordinator::new();
    assert!(coordinator.verify_runner(&runner(&server.uri())).await.is_err());
}

#[tokio::test]
async fn test_patch_trace_success_advances_offset() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/api/v4/jobs/42/trace"))
        .and(header("JOB-TOKEN", "job-tok"))
        .and(header("Content-Range", "100-119"))
        .and(header("Content-Type", "text/plain"))
        .respond_with(
            ResponseTemplate::new(202).insert_header("X-GitLab-Trace-Update-Interval", "7"),
        )
        .mount(&server)
        .await;

    let coordinator = Coordinator::new();
    let result = coordinator
        .patch_trace(
            &runner(&server.uri()),
            &credentials(),
            Bytes::from(vec![b'x'; 20]),
            100,
        )
        .await;

    assert_eq!(result.state, PatchState::Succeeded);
    assert_eq!(result.sent_offset, 120);
    assert_eq!(result.new_update_interval, Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn test_patch_trace_range_mismatch_resyncs_to_server_range() {
    let server = MockServer::start().await;

    // The server only has 80 bytes; it rejects a patch starting at 100.
    Mock::given(method("PATCH"))
        .and(path("/api/v4/jobs/42/trace"))
        .and(header("Content-Range", "100-119"))
        .respond_with(ResponseTemplate::new(416).insert_header("Range", "0-80"))
        .mount(&server)
        .await;
    // The follow-up patch resumes exactly at the server's end offset.
    Mock::given(method("PATCH"))
        .and(path("/api/v4/jobs/42/trace"))
        .and(header("Content-Range", "80-99"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = Coordinator::new();
    let config = runner(&server.uri());

    let result = coordinator
        .patch_trace(&config, &credentials(), Bytes::from(vec![b'x'; 20]), 100)
        .await;
    assert_eq!(result.state, PatchState::RangeMismatch);
    assert_eq!(result.sent_offset, 80);

    let result = coordinator
        .patch_trace(&config, &credentials(), Bytes::from(vec![b'y'; 20]), 80)
        .await;
    assert_eq!(result.state, PatchState::Succeeded);
    assert_eq!(result.sent_offset, 100);
}

#[tokio::test]
async fn test_patch_trace_not_found_and_abort() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/api/v4/jobs/42/trace"))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/v4/jobs/42/trace"))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/v4/jobs/42/trace"))
        .respond_with(ResponseTemplate::new(202).insert_header("Job-Status", "canceled"))
        .mount(&server)
        .await;

    let coordinator = Coordinator::new();
    let config = runner(&server.uri());
    let content = Bytes::from_static(b"log line\n");

    let result = coordinator
        .patch_trace(&config, &credentials(), content.clone(), 0)
        .await;
    assert_eq!(result.state, PatchState::NotFound);

    let result = coordinator
        .patch_trace(&config, &credentials(), content.clone(), 0)
        .await;
    assert_eq!(result.state, PatchState::Aborted);

    // A canceled job aborts even when the patch itself was accepted.
    let result = coordinator
        .patch_trace(&config, &credentials(), content, 0)
        .await;
    assert_eq!(result.state, PatchState::Aborted);
}

#[tokio::test]
async fn test_patch_trace_empty_patch_is_skipped() {
    let server = MockServer::start().await;
    // No mock mounted: an empty patch never reaches the wire.

    let coordinator = Coordinator::new();
    let result = coordinator
        .patch_trace(&runner(&server.uri()), &credentials(), Bytes::new(), 50)
        .await;

    assert_eq!(result.state, PatchState::Succeeded);
    assert_eq!(result.sent_offset, 50);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_job_states() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api/v4/jobs/42"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v4/jobs/42"))
        .respond_with(ResponseTemplate::new(412))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v4/jobs/42"))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v4/jobs/42"))
        .respond_with(ResponseTemplate::new(200).insert_header("Job-Status", "canceled"))
        .mount(&server)
        .await;

    let coordinator = Coordinator::new();
    let config = runner(&server.uri());

    let states = [
        UpdateState::Succeeded,
        UpdateState::TraceValidationFailed,
        UpdateState::NotFound,
        UpdateState::Aborted,
    ];
    for expected in states {
        let result = coordinator
            .update_job(&config, &credentials(), running_update())
            .await;
        assert_eq!(result.state, expected);
    }
}

#[tokio::test]
async fn test_update_job_sends_failure_reason() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api/v4/jobs/42"))
        .and(body_string_contains("\"state\":\"failed\""))
        .and(body_string_contains("\"failure_reason\":\"script_failure\""))
        .and(body_string_contains("\"exit_code\":1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = Coordinator::new();
    let result = coordinator
        .update_job(
            &runner(&server.uri()),
            &credentials(),
            UpdateJobInfo {
                state: JobState::Failed,
                failure_reason: Some(quarry_core::job::JobFailureReason::ScriptFailure),
                exit_code: Some(1),
            },
        )
        .await;

    assert_eq!(result.state, UpdateState::Succeeded);
}

#[tokio::test]
async fn test_request_job_echoes_last_update_marker() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v4/jobs/request"))
        .respond_with(
            ResponseTemplate::new(204).insert_header("X-GitLab-Last-Update", "marker-abc"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v4/jobs/request"))
        .and(body_string_contains("\"last_update\":\"marker-abc\""))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": 42,
            "token": "job-tok",
            "script": ["echo hello"],
            "masked": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = Coordinator::new();
    let config = runner(&server.uri());

    // First poll: no job, but the marker is captured.
    let job = coordinator.request_job(&config).await.unwrap();
    assert!(job.is_none());

    // Second poll echoes the marker and receives a job.
    let job = coordinator.request_job(&config).await.unwrap().unwrap();
    assert_eq!(job.id, 42);
    assert_eq!(job.token, "job-tok");
}

#[tokio::test]
async fn test_runner_lifecycle_endpoints() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v4/runners"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(serde_json::json!({"token": "new-token"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/v4/runners"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let coordinator = Coordinator::new();
    let config = runner(&server.uri());

    let registered = coordinator.register_runner(&config, "pool runner").await.unwrap();
    assert_eq!(registered.token, "new-token");

    coordinator.unregister_runner(&config).await.unwrap();
}

#[tokio::test]
async fn test_error_message_extraction_from_json_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v4/runners/verify"))
        .respond_with(
            ResponseTemplate::new(403)
                .set_body_json(serde_json::json!({"message": "403 Forbidden - token revoked"})),
        )
        .mount(&server)
        .await;

    let coordinator = Coordinator::new();
    let err = coordinator
        .verify_runner(&runner(&server.uri()))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("token revoked"), "{err}");
}
