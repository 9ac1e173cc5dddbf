//! Shell executor: runs the job script directly on the agent host.
//!
//! The script runs in its own process group so that an abort kills the
//! whole tree. This is also the inner executor the machine pool wraps; in
//! that case the effective config carries the bound machine's credentials.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use quarry_core::config::RunnerConfig;
use quarry_core::executor::{
    Executor, ExecutorCommand, ExecutorData, ExecutorError, ExecutorProvider, LogSink,
    PrepareOptions,
};
use quarry_process::{new_process_killer, KillWaiter};

const GRACEFUL_KILL_TIMEOUT: Duration = Duration::from_secs(10);
const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ShellExecutorProvider;

#[async_trait]
impl ExecutorProvider for ShellExecutorProvider {
    fn create(&self) -> Box<dyn Executor> {
        Box::new(ShellExecutor::default())
    }

    async fn acquire(&self, _config: &RunnerConfig) -> Result<Option<ExecutorData>, ExecutorError> {
        // The host itself is the resource; there is nothing to reserve.
        Ok(None)
    }

    async fn release(&self, _config: &RunnerConfig, _data: ExecutorData) {}
}

#[derive(Default)]
pub struct ShellExecutor {
    cancel: Option<watch::Receiver<bool>>,
    job_id: u64,
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn prepare(&mut self, options: &mut PrepareOptions) -> Result<(), ExecutorError> {
        self.cancel = Some(options.cancel.clone());
        self.job_id = options.job.id;
        if let Some(host) = &options.config.host {
            debug!(job = self.job_id, host = %host.host, "Preparing shell executor against machine host");
        }
        Ok(())
    }

    async fn run(
        &mut self,
        cmd: ExecutorCommand,
        log: Arc<dyn LogSink>,
    ) -> Result<(), ExecutorError> {
        let mut cancel = self
            .cancel
            .clone()
            .ok_or_else(|| ExecutorError::system("executor not prepared"))?;

        let script = cmd.script.join("\n");
        let mut command = tokio::process::Command::new("sh");
        command
            .args(["-c", &script])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(ExecutorError::system)?;
        let pid = child.id().map(|id| id as i32);
        info!(job = self.job_id, pid, "Job script started");

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_log_reader(stdout, Arc::clone(&log)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_log_reader(stderr, Arc::clone(&log)));
        }

        let (exit_tx, mut exit_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let _ = exit_tx.send(child.wait().await).await;
        });

        let exit = tokio::select! {
            exit = exit_rx.recv() => Some(exit),
            _ = aborted(&mut cancel) => None,
        };

        let status = match exit {
            Some(Some(Ok(status))) => status,
            Some(Some(Err(err))) => return Err(ExecutorError::system(err)),
            Some(None) => return Err(ExecutorError::system("script wait channel closed")),
            None => {
                warn!(job = self.job_id, pid, "Job aborted, killing the script process group");
                let killer = new_process_killer(pid.unwrap_or_default());
                let waiter = KillWaiter::new(GRACEFUL_KILL_TIMEOUT, FORCE_KILL_TIMEOUT);
                if let Err(err) = waiter.kill_and_wait(pid, killer.as_ref(), &mut exit_rx).await {
                    warn!(job = self.job_id, error = %err, "Killing job script failed");
                }
                return Err(ExecutorError::system("job aborted"));
            }
        };

        // Let trailing output land in the log before the verdict.
        for reader in readers {
            let _ = reader.await;
        }

        if status.success() {
            Ok(())
        } else {
            Err(ExecutorError::Script(status.code().unwrap_or(-1)))
        }
    }

    async fn cleanup(&mut self) {}
}

fn spawn_log_reader(
    pipe: impl AsyncRead + Unpin + Send + 'static,
    log: Arc<dyn LogSink>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log.write_log(line.as_bytes());
            log.write_log(b"\n");
        }
    })
}

/// Resolves once the cancel flag flips; never resolves when the sender is
/// dropped without firing.
async fn aborted(cancel: &mut watch::Receiver<bool>) {
    if *cancel.borrow() {
        return;
    }
    while cancel.changed().await.is_ok() {
        if *cancel.borrow() {
            return;
        }
    }
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use quarry_core::job::JobInfo;

    struct VecSink(Mutex<Vec<u8>>);

    impl LogSink for VecSink {
        fn write_log(&self, data: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(data);
        }
    }

    fn runner_config() -> RunnerConfig {
        RunnerConfig {
            name: "shell-test".into(),
            url: "https://ci.example.com".into(),
            token: "tok_0123456789".into(),
            executor: "shell".into(),
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

    fn job(script: &[&str]) -> JobInfo {
        JobInfo {
            id: 1,
            token: "job-tok".into(),
            script: script.iter().map(|s| s.to_string()).collect(),
            variables: Vec::new(),
            masked: Vec::new(),
        }
    }

    async fn prepared(
        script: &[&str],
        cancel: watch::Receiver<bool>,
    ) -> (ShellExecutor, ExecutorCommand) {
        let mut executor = ShellExecutor::default();
        let job = job(script);
        let mut options = PrepareOptions {
            config: runner_config(),
            job,
            data: None,
            cancel,
        };
        executor.prepare(&mut options).await.unwrap();
        let cmd = ExecutorCommand {
            script: options.job.script.clone(),
        };
        (executor, cmd)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_output_reaches_the_log() {
        let (_tx, rx) = watch::channel(false);
        let (mut executor, cmd) = prepared(&["echo one", "echo two"], rx).await;

        let sink = Arc::new(VecSink(Mutex::new(Vec::new())));
        executor.run(cmd, Arc::clone(&sink) as Arc<dyn LogSink>).await.unwrap();

        let log = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert_eq!(log, "one\ntwo\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_a_script_failure() {
        let (_tx, rx) = watch::channel(false);
        let (mut executor, cmd) = prepared(&["exit 3"], rx).await;

        let sink = Arc::new(VecSink(Mutex::new(Vec::new())));
        let result = executor.run(cmd, sink as Arc<dyn LogSink>).await;
        assert!(matches!(result, Err(ExecutorError::Script(3))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abort_kills_the_script() {
        let (tx, rx) = watch::channel(false);
        let (mut executor, cmd) = prepared(&["sleep 30"], rx).await;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });

        let sink = Arc::new(VecSink(Mutex::new(Vec::new())));
        let started = std::time::Instant::now();
        let result = executor.run(cmd, sink as Arc<dyn LogSink>).await;

        assert!(matches!(result, Err(ExecutorError::System(_))));
        assert!(started.elapsed() < Duration::from_secs(20));
    }
}
