//! Executor capability seam.
//!
//! The agent core never runs job scripts itself. It consumes:
//!
//! - `Executor`: prepares a host, runs the script, cleans up
//! - `ExecutorProvider`: hands out executors and manages the resources
//!   (machines) they bind to
//! - `ExecutorRegistry`: an explicit name-to-provider map built by startup
//!   code; providers are constructor-injected, never registered as a
//!   process-global side effect

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::RunnerConfig;
use crate::job::{JobFailureReason, JobInfo};

/// Opaque handle identifying a provider-owned resource reserved for a job.
///
/// For the machine pool this is the machine name; callers must not interpret
/// it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutorData(String);

impl ExecutorData {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where executors write job output. Implemented by the job trace.
pub trait LogSink: Send + Sync {
    fn write_log(&self, data: &[u8]);
}

/// Errors surfaced by executors and providers.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The user script exited non-zero.
    #[error("script failed with exit code {0}")]
    Script(i32),

    /// The agent-side machinery failed.
    #[error("{0}")]
    System(String),

    /// No idle machine is available; the caller should back off and retry.
    #[error("no free machines that can process builds")]
    NoFreeMachine,
}

impl ExecutorError {
    pub fn system(err: impl std::fmt::Display) -> Self {
        Self::System(err.to_string())
    }

    pub fn failure_reason(&self) -> JobFailureReason {
        match self {
            ExecutorError::Script(_) => JobFailureReason::ScriptFailure,
            ExecutorError::System(_) | ExecutorError::NoFreeMachine => {
                JobFailureReason::RunnerSystemFailure
            }
        }
    }
}

/// Everything an executor needs to prepare for one job.
pub struct PrepareOptions {
    /// Runner config; providers overlay per-machine credentials onto a clone.
    pub config: RunnerConfig,

    pub job: JobInfo,

    /// Resource handle from a prior `ExecutorProvider::acquire`, if any.
    pub data: Option<ExecutorData>,

    /// Flips to true when the job is aborted; executors stop work and kill
    /// whatever they started.
    pub cancel: watch::Receiver<bool>,
}

/// A command executed inside the prepared host.
#[derive(Debug, Clone)]
pub struct ExecutorCommand {
    pub script: Vec<String>,
}

/// Runs one job on a prepared host.
#[async_trait]
pub trait Executor: Send {
    async fn prepare(&mut self, options: &mut PrepareOptions) -> Result<(), ExecutorError>;

    async fn run(
        &mut self,
        cmd: ExecutorCommand,
        log: Arc<dyn LogSink>,
    ) -> Result<(), ExecutorError>;

    async fn cleanup(&mut self);
}

/// Hands out executors and owns the resources they bind to.
#[async_trait]
pub trait ExecutorProvider: Send + Sync {
    fn create(&self) -> Box<dyn Executor>;

    /// Reserve a resource for an imminent job. `Ok(None)` means the provider
    /// will create one on demand during prepare.
    async fn acquire(&self, config: &RunnerConfig) -> Result<Option<ExecutorData>, ExecutorError>;

    /// Return a reserved or used resource to the provider.
    async fn release(&self, config: &RunnerConfig, data: ExecutorData);

    /// Drain provider-owned resources on agent shutdown. Cancellation stops
    /// new work; in-flight operations complete.
    async fn shutdown(&self, _cancel: watch::Receiver<bool>) {}
}

/// Explicit executor-provider registry, built by startup code.
#[derive(Default)]
pub struct ExecutorRegistry {
    providers: HashMap<String, Arc<dyn ExecutorProvider>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn ExecutorProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExecutorProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

/// Sink for job-failure metrics.
pub trait FailuresCollector: Send + Sync {
    fn record_failure(&self, reason: JobFailureReason, runner: &str);
}
