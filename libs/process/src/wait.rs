//! Escalating kill-and-wait for job subprocesses.

use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::killer::ProcessKiller;

const DEFAULT_GRACEFUL_KILL_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum KillError {
    #[error("process not started yet")]
    ProcessNotStarted,

    #[error("failed to kill process, likely process is dormant (pid {pid})")]
    KillProcessFailed { pid: i32 },

    #[error("failed waiting for process: {0}")]
    Wait(std::io::Error),
}

/// Kills a process and waits for its exit, escalating from a soft stop to
/// a hard kill when the process lingers.
pub struct KillWaiter {
    graceful_kill_timeout: Duration,
    force_kill_timeout: Duration,
}

impl Default for KillWaiter {
    fn default() -> Self {
        Self {
            graceful_kill_timeout: DEFAULT_GRACEFUL_KILL_TIMEOUT,
            force_kill_timeout: DEFAULT_FORCE_KILL_TIMEOUT,
        }
    }
}

impl KillWaiter {
    pub fn new(graceful_kill_timeout: Duration, force_kill_timeout: Duration) -> Self {
        Self {
            graceful_kill_timeout,
            force_kill_timeout,
        }
    }

    /// Kill the process behind `killer` and wait for `wait` to deliver its
    /// exit.
    ///
    /// Outcomes: the exit is forwarded as soon as it arrives; after the
    /// graceful timeout the kill escalates and the wait restarts; after the
    /// force timeout the process is reported as unkillable; a `None` pid
    /// means the process never started.
    pub async fn kill_and_wait(
        &self,
        pid: Option<i32>,
        killer: &dyn ProcessKiller,
        wait: &mut mpsc::Receiver<std::io::Result<ExitStatus>>,
    ) -> Result<ExitStatus, KillError> {
        let pid = pid.ok_or(KillError::ProcessNotStarted)?;

        killer.terminate();
        tokio::select! {
            exit = wait.recv() => forward_exit(exit, pid),
            _ = tokio::time::sleep(self.graceful_kill_timeout) => {
                killer.force_kill();
                tokio::select! {
                    exit = wait.recv() => forward_exit(exit, pid),
                    _ = tokio::time::sleep(self.force_kill_timeout) => {
                        Err(KillError::KillProcessFailed { pid })
                    }
                }
            }
        }
    }
}

fn forward_exit(
    exit: Option<std::io::Result<ExitStatus>>,
    pid: i32,
) -> Result<ExitStatus, KillError> {
    match exit {
        Some(Ok(status)) => Ok(status),
        Some(Err(err)) => Err(KillError::Wait(err)),
        // The waiting side vanished without reporting an exit.
        None => Err(KillError::KillProcessFailed { pid }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::killer::new_process_killer;

    struct NoopKiller;

    impl ProcessKiller for NoopKiller {
        fn terminate(&self) {}
        fn force_kill(&self) {}
    }

    #[tokio::test]
    async fn test_missing_pid_reports_not_started() {
        let waiter = KillWaiter::default();
        let (_tx, mut rx) = mpsc::channel(1);

        let result = waiter.kill_and_wait(None, &NoopKiller, &mut rx).await;
        assert!(matches!(result, Err(KillError::ProcessNotStarted)));
    }

    #[tokio::test]
    async fn test_dormant_process_reports_kill_failure() {
        let waiter = KillWaiter::new(Duration::from_millis(20), Duration::from_millis(20));
        let (_tx, mut rx) = mpsc::channel::<std::io::Result<ExitStatus>>(1);

        let result = waiter.kill_and_wait(Some(12345), &NoopKiller, &mut rx).await;
        assert!(matches!(result, Err(KillError::KillProcessFailed { pid: 12345 })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_forwards_exit() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().map(|id| id as i32);

        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let _ = tx.send(child.wait().await).await;
        });

        let killer = new_process_killer(pid.unwrap());
        let waiter = KillWaiter::new(Duration::from_secs(10), Duration::from_secs(10));
        let status = waiter
            .kill_and_wait(pid, killer.as_ref(), &mut rx)
            .await
            .unwrap();

        // Killed by signal, not a clean exit.
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_graceful_timeout_escalates_to_force_kill() {
        // The child ignores SIGTERM; only the escalation can end it.
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "trap '' TERM; while :; do sleep 1; done"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().map(|id| id as i32);

        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let _ = tx.send(child.wait().await).await;
        });

        let killer = new_process_killer(pid.unwrap());
        let waiter = KillWaiter::new(Duration::from_millis(200), Duration::from_secs(10));
        let status = waiter
            .kill_and_wait(pid, killer.as_ref(), &mut rx)
            .await
            .unwrap();

        assert!(!status.success());
    }
}
