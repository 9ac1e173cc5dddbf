//! Per-runner job polling and execution.
//!
//! One loop per configured runner: reserve capacity with the runner's
//! executor provider, poll the coordinator for a job, then drive the job
//! through the executor seam with a streaming trace. A global semaphore
//! caps concurrent jobs across all runners.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use quarry_coordinator::Coordinator;
use quarry_core::config::RunnerConfig;
use quarry_core::executor::{
    ExecutorCommand, ExecutorData, ExecutorError, ExecutorProvider, ExecutorRegistry, LogSink,
    PrepareOptions,
};
use quarry_core::job::{JobFailureReason, JobInfo};
use quarry_trace::JobTrace;

pub struct Scheduler {
    coordinator: Arc<Coordinator>,
    registry: Arc<ExecutorRegistry>,
    check_interval: Duration,
    /// Caps concurrent jobs across every runner loop.
    job_slots: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        coordinator: Arc<Coordinator>,
        registry: Arc<ExecutorRegistry>,
        check_interval: Duration,
        concurrent: usize,
    ) -> Self {
        Self {
            coordinator,
            registry,
            check_interval,
            job_slots: Arc::new(Semaphore::new(concurrent.max(1))),
        }
    }

    /// Poll-and-run loop for one runner. Returns once `shutdown` flips.
    pub async fn run_runner(&self, config: RunnerConfig, mut shutdown: watch::Receiver<bool>) {
        info!(
            runner = %config.short_description(),
            executor = %config.executor,
            "Runner loop started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender means the agent is going away.
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.check_interval) => {}
            }
            if *shutdown.borrow() {
                break;
            }

            if let Err(err) = self.poll_once(&config).await {
                warn!(runner = %config.short_description(), error = %err, "Job poll failed");
            }
        }

        info!(runner = %config.short_description(), "Runner loop stopped");
    }

    async fn poll_once(&self, config: &RunnerConfig) -> anyhow::Result<()> {
        let provider = self
            .registry
            .get(&config.executor)
            .ok_or_else(|| anyhow!("unknown executor {:?}", config.executor))?;

        let _slot = self.job_slots.acquire().await?;

        let data = match provider.acquire(config).await {
            Ok(data) => data,
            Err(ExecutorError::NoFreeMachine) => {
                debug!(runner = %config.short_description(), "No free machines, backing off");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let job = match self.coordinator.request_job(config).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                if let Some(data) = data {
                    provider.release(config, data).await;
                }
                return Ok(());
            }
            Err(err) => {
                if let Some(data) = data {
                    provider.release(config, data).await;
                }
                return Err(err.into());
            }
        };

        self.run_job(config, provider, job, data).await;
        Ok(())
    }

    async fn run_job(
        &self,
        config: &RunnerConfig,
        provider: Arc<dyn ExecutorProvider>,
        job: JobInfo,
        data: Option<ExecutorData>,
    ) {
        info!(job = job.id, runner = %config.short_description(), "Running job");

        let trace = Arc::new(JobTrace::new(
            Arc::clone(&self.coordinator),
            config.clone(),
            job.credentials(),
        ));
        trace.set_masked(job.masked.clone());

        let (cancel_tx, cancel_rx) = watch::channel(false);
        trace.set_cancel_fn(move || {
            let _ = cancel_tx.send(true);
        });
        trace.start();

        let mut executor = provider.create();
        let mut options = PrepareOptions {
            config: config.clone(),
            job: job.clone(),
            data: data.clone(),
            cancel: cancel_rx,
        };

        let result = match executor.prepare(&mut options).await {
            Ok(()) => {
                executor
                    .run(
                        ExecutorCommand {
                            script: job.script.clone(),
                        },
                        Arc::clone(&trace) as Arc<dyn LogSink>,
                    )
                    .await
            }
            Err(err) => Err(err),
        };
        executor.cleanup().await;

        // The reservation made before the job was requested is ours to hand
        // back; anything the executor provisioned on top it released itself.
        if let Some(data) = data {
            provider.release(config, data).await;
        }

        match result {
            Ok(()) => trace.success().await,
            Err(ExecutorError::Script(code)) => {
                trace.fail(JobFailureReason::ScriptFailure, Some(code)).await;
            }
            Err(err) => trace.fail(err.failure_reason(), None).await,
        }
        info!(job = job.id, "Job finished");
    }
}
