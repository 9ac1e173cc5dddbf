//! Job state, failure taxonomy and credentials.

use serde::{Deserialize, Serialize};

/// Lifecycle state reported for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Running => write!(f, "running"),
            JobState::Success => write!(f, "success"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Why a job failed, as reported on the final status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFailureReason {
    /// The user script exited non-zero.
    ScriptFailure,
    /// The coordinator rejected an API call.
    ApiFailure,
    /// The job stalled past its deadline.
    StuckOrTimeoutFailure,
    /// The agent or its environment failed.
    RunnerSystemFailure,
    /// The job ran past its execution timeout.
    JobExecutionTimeout,
    UnknownFailure,
}

impl std::fmt::Display for JobFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobFailureReason::ScriptFailure => "script_failure",
            JobFailureReason::ApiFailure => "api_failure",
            JobFailureReason::StuckOrTimeoutFailure => "stuck_or_timeout_failure",
            JobFailureReason::RunnerSystemFailure => "runner_system_failure",
            JobFailureReason::JobExecutionTimeout => "job_execution_timeout",
            JobFailureReason::UnknownFailure => "unknown_failure",
        };
        write!(f, "{s}")
    }
}

/// Identity and token scoped to one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCredentials {
    pub id: u64,
    pub token: String,
}

/// A job handed out by the coordinator.
#[derive(Debug, Clone, Deserialize)]
pub struct JobInfo {
    pub id: u64,
    pub token: String,

    /// User script to execute on the prepared host.
    #[serde(default)]
    pub script: Vec<String>,

    /// Variables exported into the job environment.
    #[serde(default)]
    pub variables: Vec<JobVariable>,

    /// Substrings redacted from the job log.
    #[serde(default)]
    pub masked: Vec<String>,
}

impl JobInfo {
    pub fn credentials(&self) -> JobCredentials {
        JobCredentials {
            id: self.id,
            token: self.token.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobVariable {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub masked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_serialization() {
        assert_eq!(serde_json::to_string(&JobState::Running).unwrap(), "\"running\"");
        assert_eq!(serde_json::to_string(&JobState::Failed).unwrap(), "\"failed\"");
    }

    #[test]
    fn test_failure_reason_display_matches_wire_format() {
        let reason = JobFailureReason::ScriptFailure;
        assert_eq!(reason.to_string(), "script_failure");
        assert_eq!(
            serde_json::to_string(&reason).unwrap(),
            "\"script_failure\""
        );
    }

    #[test]
    fn test_job_info_deserialization() {
        let json = r#"{
            "id": 42,
            "token": "job-token",
            "script": ["echo hello"],
            "variables": [{"key": "CI", "value": "true"}],
            "masked": ["secret"]
        }"#;
        let job: JobInfo = serde_json::from_str(json).unwrap();
        assert_eq!(job.id, 42);
        assert_eq!(job.credentials().token, "job-token");
        assert_eq!(job.masked, vec!["secret"]);
    }
}
