//! Public writer and lifecycle facade over the trace streamer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use quarry_coordinator::Coordinator;
use quarry_core::config::RunnerConfig;
use quarry_core::executor::{FailuresCollector, LogSink};
use quarry_core::job::{JobCredentials, JobFailureReason, JobState};

use crate::buffer::TraceBuffer;
use crate::streamer::TraceStreamer;

/// Pacing for the streaming loop.
#[derive(Debug, Clone)]
pub struct TraceSettings {
    /// Pause between incremental updates; the server may stretch it up to
    /// the coordinator crate's hard ceiling.
    pub update_interval: Duration,

    /// Quiet period after which a liveness touch is sent.
    pub force_send_interval: Duration,

    /// Pause between final-update retries.
    pub finish_retry_interval: Duration,

    /// Upper bound on the byte size of a single trace patch.
    pub max_patch_size: usize,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(3),
            force_send_interval: Duration::from_secs(30),
            finish_retry_interval: Duration::from_secs(3),
            max_patch_size: 1024 * 1024,
        }
    }
}

/// Terminal state reported by the writer side.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JobStatus {
    pub(crate) state: JobState,
    pub(crate) failure_reason: Option<JobFailureReason>,
    pub(crate) exit_code: Option<i32>,
}

/// State shared between the facade and the background streaming task.
pub(crate) struct TraceShared {
    pub(crate) coordinator: Arc<Coordinator>,
    pub(crate) config: RunnerConfig,
    pub(crate) credentials: JobCredentials,
    pub(crate) buffer: TraceBuffer,
    pub(crate) settings: TraceSettings,
    /// Signaled once when the writer side turns terminal.
    pub(crate) finished: Notify,

    status: Mutex<JobStatus>,
    cancel_fn: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    failures: Mutex<Option<Arc<dyn FailuresCollector>>>,

    /// Bytes the coordinator has accepted so far.
    sent_offset: AtomicUsize,
    /// Last successful write to the coordinator, for the touch deadline.
    sent_time: Mutex<Instant>,
    /// Current pacing, possibly stretched by the server.
    update_interval: Mutex<Duration>,
}

impl TraceShared {
    pub(crate) fn sent_offset(&self) -> usize {
        self.sent_offset.load(Ordering::SeqCst)
    }

    pub(crate) fn set_sent_offset(&self, offset: usize) {
        self.sent_offset.store(offset, Ordering::SeqCst);
    }

    pub(crate) fn mark_sent(&self) {
        *self.sent_time.lock().unwrap() = Instant::now();
    }

    pub(crate) fn sent_elapsed(&self) -> Duration {
        self.sent_time.lock().unwrap().elapsed()
    }

    pub(crate) fn update_interval(&self) -> Duration {
        *self.update_interval.lock().unwrap()
    }

    pub(crate) fn set_update_interval(&self, interval: Duration) {
        *self.update_interval.lock().unwrap() = interval;
    }

    pub(crate) fn status(&self) -> JobStatus {
        *self.status.lock().unwrap()
    }

    /// Invoke the installed cancel function. Only the first call fires it.
    pub(crate) fn cancel_job(&self) -> bool {
        let cancel = self.cancel_fn.lock().unwrap().take();
        match cancel {
            Some(cancel) => {
                cancel();
                true
            }
            None => false,
        }
    }
}

/// Job log writer and lifecycle handle.
///
/// Writes land in the masked buffer immediately and never block on the
/// network; a background task streams them to the coordinator. `success`
/// and `fail` are terminal: the first call stops the background task,
/// drains the remaining log and submits the final state.
pub struct JobTrace {
    shared: Arc<TraceShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobTrace {
    pub fn new(
        coordinator: Arc<Coordinator>,
        config: RunnerConfig,
        credentials: JobCredentials,
    ) -> Self {
        Self::with_settings(coordinator, config, credentials, TraceSettings::default())
    }

    pub fn with_settings(
        coordinator: Arc<Coordinator>,
        config: RunnerConfig,
        credentials: JobCredentials,
        settings: TraceSettings,
    ) -> Self {
        let buffer = TraceBuffer::new(config.output_limit_bytes());
        let update_interval = settings.update_interval;
        Self {
            shared: Arc::new(TraceShared {
                coordinator,
                config,
                credentials,
                buffer,
                settings,
                finished: Notify::new(),
                status: Mutex::new(JobStatus {
                    state: JobState::Running,
                    failure_reason: None,
                    exit_code: None,
                }),
                cancel_fn: Mutex::new(None),
                failures: Mutex::new(None),
                sent_offset: AtomicUsize::new(0),
                sent_time: Mutex::new(Instant::now()),
                update_interval: Mutex::new(update_interval),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the background streaming loop. A second call is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let streamer = TraceStreamer::new(Arc::clone(&self.shared));
        *worker = Some(tokio::spawn(streamer.watch()));
    }

    /// Append job output. Returns the full byte count; the buffer masks and
    /// bounds internally.
    pub fn write(&self, data: &[u8]) -> usize {
        self.shared.buffer.write(data)
    }

    /// Replace the set of masked substrings. Affects subsequent writes only.
    pub fn set_masked(&self, values: Vec<String>) {
        self.shared.buffer.set_masked(values);
    }

    /// Install the cancellation the coordinator may trigger when the job is
    /// aborted server-side.
    pub fn set_cancel_fn(&self, cancel: impl FnOnce() + Send + 'static) {
        *self.shared.cancel_fn.lock().unwrap() = Some(Box::new(cancel));
    }

    /// Invoke the installed cancel function, if any. Only the first call
    /// fires it; later calls return false.
    pub fn cancel(&self) -> bool {
        self.shared.cancel_job()
    }

    pub fn set_failures_collector(&self, collector: Arc<dyn FailuresCollector>) {
        *self.shared.failures.lock().unwrap() = Some(collector);
    }

    /// Mark the job successful and submit the final state. Terminal.
    pub async fn success(&self) {
        self.complete(JobState::Success, None, None).await;
    }

    /// Mark the job failed and submit the final state. Terminal.
    pub async fn fail(&self, reason: JobFailureReason, exit_code: Option<i32>) {
        self.complete(JobState::Failed, Some(reason), exit_code).await;
    }

    /// Bytes of log accepted by the coordinator so far.
    pub fn sent_offset(&self) -> usize {
        self.shared.sent_offset()
    }

    async fn complete(
        &self,
        state: JobState,
        reason: Option<JobFailureReason>,
        exit_code: Option<i32>,
    ) {
        {
            let mut status = self.shared.status.lock().unwrap();
            if status.state != JobState::Running {
                return;
            }
            *status = JobStatus {
                state,
                failure_reason: reason,
                exit_code,
            };
        }

        if let Some(reason) = reason {
            let collector = self.shared.failures.lock().unwrap().clone();
            if let Some(collector) = collector {
                collector.record_failure(reason, &self.shared.config.short_description());
            }
        }

        self.shared.buffer.finish();
        self.shared.finished.notify_one();

        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        TraceStreamer::new(Arc::clone(&self.shared)).finalize().await;
    }
}

impl LogSink for JobTrace {
    fn write_log(&self, data: &[u8]) {
        self.write(data);
    }
}

impl Drop for JobTrace {
    fn drop(&mut self) {
        // A trace abandoned without success/fail must not leak its worker.
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner_config() -> RunnerConfig {
        RunnerConfig {
            name: "r".into(),
            url: "https://ci.example.com".into(),
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

    fn trace() -> JobTrace {
        JobTrace::new(
            Arc::new(Coordinator::new()),
            runner_config(),
            JobCredentials {
                id: 1,
                token: "job-token".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_cancel_fires_once() {
        let trace = trace();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        trace.set_cancel_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(trace.cancel());
        assert!(!trace.cancel());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_without_function_is_a_noop() {
        let trace = trace();
        assert!(!trace.cancel());
    }

    #[tokio::test]
    async fn test_write_is_masked() {
        let trace = trace();
        trace.set_masked(vec!["hunter2".into()]);

        assert_eq!(trace.write(b"password is hunter2!"), 20);
        let visible = trace.shared.buffer.bytes(0, trace.shared.buffer.size());
        assert_eq!(&visible[..], b"password is [MASKED]!");
    }
}
