//! Platform process killers.

/// Delivers kill signals to a job subprocess and everything it spawned.
pub trait ProcessKiller: Send + Sync {
    /// Best-effort soft stop. Falls through to `force_kill` on error.
    fn terminate(&self);

    /// Non-negotiable kill.
    fn force_kill(&self);
}

/// Killer for the process group led by `pid`.
///
/// The process must have been spawned as its own group leader (POSIX
/// `setpgid(0, 0)`, `process_group(0)` on the spawn builder) or the signals
/// only reach part of the tree.
pub fn new_process_killer(pid: i32) -> Box<dyn ProcessKiller> {
    #[cfg(unix)]
    {
        Box::new(unix::GroupKiller::new(pid))
    }
    #[cfg(windows)]
    {
        Box::new(windows::TreeKiller::new(pid))
    }
}

#[cfg(unix)]
mod unix {
    use tracing::warn;

    use super::ProcessKiller;

    pub(super) struct GroupKiller {
        pid: i32,
    }

    impl GroupKiller {
        pub(super) fn new(pid: i32) -> Self {
            Self { pid }
        }
    }

    impl ProcessKiller for GroupKiller {
        fn terminate(&self) {
            if let Err(err) = signal_group(self.pid, libc::SIGTERM) {
                warn!(pid = self.pid, error = %err, "Failed to terminate process group");
                self.force_kill();
            }
        }

        fn force_kill(&self) {
            if let Err(err) = signal_group(self.pid, libc::SIGKILL) {
                warn!(pid = self.pid, error = %err, "Failed to force-kill process group");
            }
        }
    }

    /// A negative pid addresses the whole process group.
    fn signal_group(pid: i32, signal: libc::c_int) -> std::io::Result<()> {
        let rc = unsafe { libc::kill(-pid, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::process::Command;

    use tracing::warn;

    use super::ProcessKiller;

    /// Windows has no process groups in the POSIX sense; `taskkill /T`
    /// walks the child tree instead.
    pub(super) struct TreeKiller {
        pid: i32,
    }

    impl TreeKiller {
        pub(super) fn new(pid: i32) -> Self {
            Self { pid }
        }

        fn taskkill(&self, force: bool) -> std::io::Result<std::process::ExitStatus> {
            let mut cmd = Command::new("taskkill");
            if force {
                cmd.arg("/F");
            }
            cmd.args(["/T", "/PID", &self.pid.to_string()]).status()
        }
    }

    impl ProcessKiller for TreeKiller {
        fn terminate(&self) {
            match self.taskkill(false) {
                Ok(status) if status.success() => {}
                _ => self.force_kill(),
            }
        }

        fn force_kill(&self) {
            if let Err(err) = self.taskkill(true) {
                warn!(pid = self.pid, error = %err, "Failed to force-kill process tree");
            }
        }
    }
}
