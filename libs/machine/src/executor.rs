//! Executor wrapper binding pool machines to jobs.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, error, info};

use quarry_core::config::RunnerConfig;
use quarry_core::executor::{
    Executor, ExecutorCommand, ExecutorData, ExecutorError, ExecutorProvider, LogSink,
    PrepareOptions,
};

use crate::provider::{MachineProvider, MachineProviderError};

/// Wraps the real executor with machine binding.
///
/// Prepare binds a pool machine to the job (provisioning one just in time
/// when needed) and overlays its credentials onto the config the wrapped
/// executor sees. Cleanup releases any machine this executor itself
/// provisioned; machines reserved by the caller stay the caller's to
/// release.
pub struct MachineExecutor {
    provider: Weak<MachineProvider>,
    inner_provider: Arc<dyn ExecutorProvider>,
    executor: Option<Box<dyn Executor>>,
    config: Option<RunnerConfig>,
    data: Option<ExecutorData>,
}

impl MachineExecutor {
    pub(crate) fn new(
        provider: Weak<MachineProvider>,
        inner_provider: Arc<dyn ExecutorProvider>,
    ) -> Self {
        Self {
            provider,
            inner_provider,
            executor: None,
            config: None,
            data: None,
        }
    }

    fn machine_name<'a>(&'a self, options: &'a PrepareOptions) -> &'a str {
        self.data
            .as_ref()
            .or(options.data.as_ref())
            .map(|d| d.as_str())
            .unwrap_or("")
    }
}

#[async_trait]
impl Executor for MachineExecutor {
    async fn prepare(&mut self, options: &mut PrepareOptions) -> Result<(), ExecutorError> {
        let provider = self
            .provider
            .upgrade()
            .ok_or_else(|| ExecutorError::system("machine pool is shutting down"))?;

        // The wrapped executor is created up front; machine connectivity is
        // asserted by use_machine below.
        let mut executor = self.inner_provider.create();

        let (effective, new_data) = provider
            .use_machine(&options.config, options.data.as_ref())
            .await
            .map_err(|err| match err {
                MachineProviderError::NoFreeMachine => ExecutorError::NoFreeMachine,
                other => ExecutorError::system(other),
            })?;

        if new_data.is_some() {
            self.data = new_data;
            info!(name = self.machine_name(options), job = options.job.id, "Created new machine");
        } else {
            info!(name = self.machine_name(options), job = options.job.id, "Using existing machine");
        }

        options.config = effective.clone();
        self.config = Some(effective);

        if let Err(err) = executor.prepare(options).await {
            error!(error = %err, "Preparing machine-wrapped executor failed");
            self.executor = Some(executor);
            return Err(err);
        }
        self.executor = Some(executor);

        info!(name = self.machine_name(options), "Starting machine build...");
        Ok(())
    }

    async fn run(
        &mut self,
        cmd: ExecutorCommand,
        log: Arc<dyn LogSink>,
    ) -> Result<(), ExecutorError> {
        match self.executor.as_mut() {
            Some(executor) => executor.run(cmd, log).await,
            None => Err(ExecutorError::system("missing executor")),
        }
    }

    async fn cleanup(&mut self) {
        if let Some(mut executor) = self.executor.take() {
            executor.cleanup().await;
        }

        if let Some(data) = self.data.take() {
            if let (Some(provider), Some(config)) = (self.provider.upgrade(), self.config.as_ref())
            {
                provider.release(config, data).await;
            }
        }

        debug!("Cleaned up machine executor");
    }
}
