//! Machine driver backed by a docker-machine compatible CLI.
//!
//! Every operation shells out to the configured executable and treats a
//! non-zero exit as "failed with unspecified partial effect". Connectivity
//! probes run `config`, which actively asks the machine whether it is up;
//! positive results are cached for a few minutes because machines rarely
//! disconnect on their own.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, warn};

use quarry_core::config::HostCredentials;

use crate::driver::{DriverError, MachineDriver};

const CONNECT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Shells out to `docker-machine` (or a drop-in replacement).
pub struct CommandMachineDriver {
    executable: String,
    storage_dir: PathBuf,
    /// Positive connectivity probes, each with an expiry.
    connect_cache: Mutex<HashMap<String, Instant>>,
}

impl CommandMachineDriver {
    pub fn new(executable: impl Into<String>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            storage_dir: storage_dir.into(),
            connect_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Executable from `QUARRY_MACHINE_COMMAND`, storage from
    /// `MACHINE_STORAGE_PATH`, with the provisioner's usual defaults.
    pub fn from_env() -> Self {
        let executable =
            std::env::var("QUARRY_MACHINE_COMMAND").unwrap_or_else(|_| "docker-machine".into());
        let storage_dir = std::env::var("MACHINE_STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
                PathBuf::from(home).join(".docker").join("machine")
            });
        Self::new(executable, storage_dir)
    }

    fn machine_dir(&self) -> PathBuf {
        self.storage_dir.join("machines")
    }

    /// Run a subcommand, streaming its output into the log.
    async fn run(&self, operation: &str, name: &str, args: &[String]) -> Result<(), DriverError> {
        debug!(executable = %self.executable, operation, name, ?args, "Executing machine command");

        let mut child = tokio::process::Command::new(&self.executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| DriverError::command(name, err.to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            let operation = operation.to_string();
            let name = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(operation = %operation, name = %name, "{line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let operation = operation.to_string();
            let name = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    error!(operation = %operation, name = %name, "{line}");
                }
            });
        }

        let status = child
            .wait()
            .await
            .map_err(|err| DriverError::command(name, err.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(DriverError::command(
                name,
                format!("{operation} exited with {status}"),
            ))
        }
    }

    /// Run a subcommand and capture its trimmed stdout.
    async fn get(&self, name: &str, args: &[String]) -> Result<String, DriverError> {
        let output = tokio::process::Command::new(&self.executable)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| DriverError::command(name, err.to_string()))?;

        if !output.status.success() {
            return Err(DriverError::command(
                name,
                format!("{:?} exited with {}", args, output.status),
            ));
        }

        let out = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if out.is_empty() {
            return Err(DriverError::command(name, format!("failed to get {args:?}")));
        }
        Ok(out)
    }

    async fn probe(&self, name: &str) -> bool {
        // `config` actively asks the machine whether it is up and online.
        let result = tokio::process::Command::new(&self.executable)
            .args(["config", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        matches!(result, Ok(status) if status.success())
    }
}

#[async_trait]
impl MachineDriver for CommandMachineDriver {
    async fn create(
        &self,
        driver: &str,
        name: &str,
        options: &[String],
    ) -> Result<(), DriverError> {
        let mut args = vec!["create".to_string(), "--driver".to_string(), driver.to_string()];
        for option in options {
            args.push(format!("--{option}"));
        }
        args.push(name.to_string());

        self.run("create", name, &args).await
    }

    async fn provision(&self, name: &str) -> Result<(), DriverError> {
        self.run("provision", name, &["provision".to_string(), name.to_string()])
            .await
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), DriverError> {
        let args = ["stop".to_string(), name.to_string()];
        let stop = self.run("stop", name, &args);
        match tokio::time::timeout(timeout, stop).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::command(name, "stop timed out")),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), DriverError> {
        self.run("remove", name, &["rm".to_string(), "-y".to_string(), name.to_string()])
            .await?;
        self.connect_cache.lock().unwrap().remove(name);
        Ok(())
    }

    /// Machines persisted on disk: one directory per machine under the
    /// provisioner's storage path.
    async fn list(&self) -> Result<Vec<String>, DriverError> {
        let dir = match std::fs::read_dir(self.machine_dir()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(DriverError::command("list", err.to_string())),
        };

        let mut names = Vec::new();
        for entry in dir.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn exist(&self, name: &str) -> bool {
        let config_path = self.machine_dir().join(name).join("config.json");
        if !config_path.exists() {
            return false;
        }
        self.run("exists", name, &["inspect".to_string(), name.to_string()])
            .await
            .is_ok()
    }

    async fn can_connect(&self, name: &str, skip_cache: bool) -> bool {
        if !skip_cache {
            let cache = self.connect_cache.lock().unwrap();
            if let Some(expires) = cache.get(name) {
                if Instant::now() < *expires {
                    return true;
                }
            }
        }

        if !self.probe(name).await {
            // Only positive hits are cached; machines usually do not
            // disconnect.
            return false;
        }

        self.connect_cache
            .lock()
            .unwrap()
            .insert(name.to_string(), Instant::now() + CONNECT_CACHE_TTL);
        true
    }

    async fn credentials(&self, name: &str) -> Result<HostCredentials, DriverError> {
        if !self.can_connect(name, true).await {
            warn!(name, "Machine is not reachable, cannot extract credentials");
            return Err(DriverError::command(name, "can't connect"));
        }

        let host = self.get(name, &["url".to_string(), name.to_string()]).await?;
        let tls_dir = self
            .get(
                name,
                &[
                    "inspect".to_string(),
                    name.to_string(),
                    "-f".to_string(),
                    "{{.HostOptions.AuthOptions.StorePath}}".to_string(),
                ],
            )
            .await?;

        Ok(HostCredentials {
            host,
            tls_dir: Some(PathBuf::from(tls_dir)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_reads_storage_dir() {
        let dir = tempfile::tempdir().unwrap();
        let machines = dir.path().join("machines");
        std::fs::create_dir_all(machines.join("runner-a")).unwrap();
        std::fs::create_dir_all(machines.join("runner-b")).unwrap();
        std::fs::create_dir_all(machines.join(".hidden")).unwrap();
        std::fs::write(machines.join("stray-file"), b"").unwrap();

        let driver = CommandMachineDriver::new("docker-machine", dir.path());
        assert_eq!(driver.list().await.unwrap(), vec!["runner-a", "runner-b"]);
    }

    #[tokio::test]
    async fn test_list_with_missing_storage_dir_is_empty() {
        let driver = CommandMachineDriver::new("docker-machine", "/nonexistent/storage");
        assert!(driver.list().await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let driver = CommandMachineDriver::new("false", dir.path());

        assert!(driver.create("mock", "m1", &[]).await.is_err());
        assert!(driver.provision("m1").await.is_err());
        assert!(!driver.can_connect("m1", true).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_positive_probe_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let driver = CommandMachineDriver::new("true", dir.path());

        assert!(driver.can_connect("m1", false).await);
        assert!(driver
            .connect_cache
            .lock()
            .unwrap()
            .contains_key("m1"));
    }
}
