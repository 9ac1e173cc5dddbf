//! Background trace streaming loop.
//!
//! One task per job. Each iteration sends the next unsent window of log
//! bytes as a trace patch, then touches the job when nothing was written
//! for too long. Once the writer side turns terminal, `finalize` drains
//! the buffer and submits the final state until the coordinator accepts,
//! aborts or forgets the job.
//!
//! The sent offset only moves backwards on an explicit trace-validation
//! failure from the coordinator; a range mismatch adopts the server's
//! declared end and realigns on the next patch.

use std::sync::Arc;

use tracing::{debug, info, warn};

use quarry_coordinator::{PatchState, UpdateJobInfo, UpdateState};
use quarry_core::job::JobState;

use crate::job_trace::TraceShared;

/// Why the streaming loop stopped, when it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEvent {
    /// Keep streaming.
    Continue,
    /// The job no longer exists server-side.
    NotFound,
    /// The coordinator canceled or failed the job.
    Aborted,
}

pub(crate) struct TraceStreamer {
    shared: Arc<TraceShared>,
}

impl TraceStreamer {
    pub(crate) fn new(shared: Arc<TraceShared>) -> Self {
        Self { shared }
    }

    /// Periodic patch/touch loop. Returns once the writer side finishes the
    /// job or the coordinator tells us to stop.
    pub(crate) async fn watch(self) {
        loop {
            let interval = self.shared.update_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shared.finished.notified() => return,
            }

            match self.incremental_update().await {
                StreamEvent::Continue => {}
                StreamEvent::Aborted => {
                    if self.shared.cancel_job() {
                        debug!(
                            job = self.shared.credentials.id,
                            "Server-side abort, canceling job"
                        );
                    }
                    // The writer still owes us a success/fail; hold on so the
                    // final update runs against a consistent state.
                    self.shared.finished.notified().await;
                    return;
                }
                StreamEvent::NotFound => {
                    warn!(
                        job = self.shared.credentials.id,
                        "Job no longer exists, stopping trace streaming"
                    );
                    self.shared.finished.notified().await;
                    return;
                }
            }
        }
    }

    /// Drain the buffer and submit the terminal state, retrying until the
    /// coordinator accepts, aborts or forgets the job. There is no overall
    /// deadline; the process-level shutdown bounds it.
    pub(crate) async fn finalize(&self) {
        let retry_interval = self.shared.settings.finish_retry_interval;
        loop {
            match self.ensure_all_trace_sent().await {
                StreamEvent::Continue => {}
                StreamEvent::NotFound | StreamEvent::Aborted => return,
            }

            let status = self.shared.status();
            let result = self
                .shared
                .coordinator
                .update_job(
                    &self.shared.config,
                    &self.shared.credentials,
                    UpdateJobInfo {
                        state: status.state,
                        failure_reason: status.failure_reason,
                        exit_code: status.exit_code,
                    },
                )
                .await;

            match result.state {
                UpdateState::Succeeded => {
                    info!(
                        job = self.shared.credentials.id,
                        state = %status.state,
                        "Job submitted"
                    );
                    return;
                }
                UpdateState::Aborted | UpdateState::NotFound => return,
                UpdateState::TraceValidationFailed => {
                    warn!(
                        job = self.shared.credentials.id,
                        "Trace rejected, resending job log from the start"
                    );
                    self.shared.set_sent_offset(0);
                }
                UpdateState::Accepted | UpdateState::Failed => {}
            }

            tokio::time::sleep(retry_interval).await;
        }
    }

    async fn incremental_update(&self) -> StreamEvent {
        let event = self.patch_phase().await;
        if event != StreamEvent::Continue {
            return event;
        }

        if self.shared.sent_elapsed() > self.shared.settings.force_send_interval {
            return self.touch_phase().await;
        }
        StreamEvent::Continue
    }

    /// Send the next window of unsent log bytes, if any.
    async fn patch_phase(&self) -> StreamEvent {
        let sent_offset = self.shared.sent_offset();
        let size = self.shared.buffer.size();
        if size <= sent_offset {
            return StreamEvent::Continue;
        }

        let window = (size - sent_offset).min(self.shared.settings.max_patch_size);
        let content = self.shared.buffer.bytes(sent_offset, window);
        let result = self
            .shared
            .coordinator
            .patch_trace(&self.shared.config, &self.shared.credentials, content, sent_offset)
            .await;

        if let Some(interval) = result.new_update_interval {
            self.shared.set_update_interval(interval);
        }

        match result.state {
            PatchState::Succeeded => {
                self.shared.set_sent_offset(result.sent_offset);
                self.shared.mark_sent();
                StreamEvent::Continue
            }
            PatchState::RangeMismatch => {
                // The server declared where it actually is; the next patch
                // realigns from there. The buffer keeps everything.
                self.shared.set_sent_offset(result.sent_offset);
                StreamEvent::Continue
            }
            PatchState::NotFound => StreamEvent::NotFound,
            PatchState::Aborted => StreamEvent::Aborted,
            PatchState::Failed => StreamEvent::Continue,
        }
    }

    /// Assert liveness and pick up abort hints after a quiet period.
    async fn touch_phase(&self) -> StreamEvent {
        let result = self
            .shared
            .coordinator
            .update_job(
                &self.shared.config,
                &self.shared.credentials,
                UpdateJobInfo {
                    state: JobState::Running,
                    failure_reason: None,
                    exit_code: None,
                },
            )
            .await;

        if let Some(interval) = result.new_update_interval {
            self.shared.set_update_interval(interval);
        }

        match result.state {
            UpdateState::Succeeded | UpdateState::Accepted => {
                self.shared.mark_sent();
                StreamEvent::Continue
            }
            UpdateState::TraceValidationFailed => {
                self.shared.set_sent_offset(0);
                StreamEvent::Continue
            }
            UpdateState::NotFound => StreamEvent::NotFound,
            UpdateState::Aborted => StreamEvent::Aborted,
            UpdateState::Failed => StreamEvent::Continue,
        }
    }

    /// Patch until every buffered byte is accepted or a terminal outcome
    /// interrupts.
    async fn ensure_all_trace_sent(&self) -> StreamEvent {
        let retry_interval = self.shared.settings.finish_retry_interval;
        loop {
            let sent_offset = self.shared.sent_offset();
            let size = self.shared.buffer.size();
            if sent_offset >= size {
                return StreamEvent::Continue;
            }

            let window = (size - sent_offset).min(self.shared.settings.max_patch_size);
            let content = self.shared.buffer.bytes(sent_offset, window);
            let result = self
                .shared
                .coordinator
                .patch_trace(&self.shared.config, &self.shared.credentials, content, sent_offset)
                .await;

            match result.state {
                PatchState::Succeeded => {
                    self.shared.set_sent_offset(result.sent_offset);
                    self.shared.mark_sent();
                }
                PatchState::RangeMismatch => {
                    // A mismatch that doesn't move the offset would spin.
                    if result.sent_offset == sent_offset {
                        tokio::time::sleep(retry_interval).await;
                    }
                    self.shared.set_sent_offset(result.sent_offset);
                }
                PatchState::NotFound => return StreamEvent::NotFound,
                PatchState::Aborted => return StreamEvent::Aborted,
                PatchState::Failed => {
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }
}
