//! VM driver capability and mock implementation.
//!
//! The driver is the pool's only way to touch real machines. Every operation
//! is side-effectful and non-transactional: an error means "failed with
//! unspecified partial effect" and the pool must reconcile by re-listing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use quarry_core::config::HostCredentials;

/// Driver operation errors.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The underlying provisioning command failed.
    #[error("machine {name}: {message}")]
    Command { name: String, message: String },

    /// The machine is not known to the driver.
    #[error("machine {0} not found")]
    NotFound(String),
}

impl DriverError {
    pub fn command(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Lifecycle operations on a single VM.
#[async_trait]
pub trait MachineDriver: Send + Sync {
    /// Provision a new machine. Blocking; may take minutes.
    async fn create(&self, driver: &str, name: &str, options: &[String])
        -> Result<(), DriverError>;

    /// Re-run provisioning on an existing machine after a failed create.
    async fn provision(&self, name: &str) -> Result<(), DriverError>;

    /// Soft stop with a deadline.
    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), DriverError>;

    /// Idempotent deletion.
    async fn remove(&self, name: &str) -> Result<(), DriverError>;

    /// Enumerate machines persisted by the driver.
    async fn list(&self) -> Result<Vec<String>, DriverError>;

    /// Fast local existence check.
    async fn exist(&self, name: &str) -> bool;

    /// Probe the machine over its management channel. `skip_cache` bypasses
    /// any positive probe cache.
    async fn can_connect(&self, name: &str, skip_cache: bool) -> bool;

    /// Extract connection parameters for the downstream executor.
    async fn credentials(&self, name: &str) -> Result<HostCredentials, DriverError>;
}

#[derive(Default)]
struct MockMachine {
    reachable: bool,
}

#[derive(Default)]
struct MockState {
    machines: HashMap<String, MockMachine>,
    /// Names for which `create` fails this many more times.
    create_failures: usize,
    /// Remaining `remove` failures per machine.
    remove_failures: HashMap<String, usize>,
    /// Positive connectivity probes remembered until `skip_cache` is used.
    connect_cache: HashSet<String>,
}

/// Scriptable in-memory driver for tests and development.
///
/// Machines are plain records; failures and latency are injected per
/// operation so pool behavior can be exercised without a real provisioner.
pub struct MockMachineDriver {
    state: Mutex<MockState>,
    create_delay: Duration,
    remove_delay: Duration,
    create_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl MockMachineDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            create_delay: Duration::ZERO,
            remove_delay: Duration::ZERO,
            create_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }

    /// Simulate slow provisioning and removal.
    pub fn with_delays(create: Duration, remove: Duration) -> Self {
        let mut driver = Self::new();
        driver.create_delay = create;
        driver.remove_delay = remove;
        driver
    }

    /// Pre-seed a machine as if it already existed on disk.
    pub fn add_machine(&self, name: &str, reachable: bool) {
        let mut state = self.state.lock().unwrap();
        state
            .machines
            .insert(name.to_string(), MockMachine { reachable });
    }

    pub fn set_reachable(&self, name: &str, reachable: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(machine) = state.machines.get_mut(name) {
            machine.reachable = reachable;
        }
    }

    /// Make the next `count` create calls fail.
    pub fn fail_next_creates(&self, count: usize) {
        self.state.lock().unwrap().create_failures = count;
    }

    /// Make `remove` fail `count` times for the named machine.
    pub fn fail_removes(&self, name: &str, count: usize) {
        self.state
            .lock()
            .unwrap()
            .remove_failures
            .insert(name.to_string(), count);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn machine_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<_> = state.machines.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MockMachineDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MachineDriver for MockMachineDriver {
    async fn create(
        &self,
        driver: &str,
        name: &str,
        _options: &[String],
    ) -> Result<(), DriverError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.create_failures > 0 {
            state.create_failures -= 1;
            // A failed create still leaves a half-provisioned machine behind.
            state
                .machines
                .insert(name.to_string(), MockMachine { reachable: false });
            return Err(DriverError::command(name, "create failed"));
        }

        info!(driver, name, "[MOCK] Machine created");
        state
            .machines
            .insert(name.to_string(), MockMachine { reachable: true });
        Ok(())
    }

    async fn provision(&self, name: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(DriverError::command(name, "provision failed"));
        }
        match state.machines.get_mut(name) {
            Some(machine) => {
                machine.reachable = true;
                Ok(())
            }
            None => Err(DriverError::NotFound(name.to_string())),
        }
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<(), DriverError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        debug!(name, "[MOCK] Machine stopped");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), DriverError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if !self.remove_delay.is_zero() {
            tokio::time::sleep(self.remove_delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.remove_failures.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DriverError::command(name, "remove failed"));
            }
        }

        state.machines.remove(name);
        state.connect_cache.remove(name);
        debug!(name, "[MOCK] Machine removed");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, DriverError> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<_> = state.machines.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn exist(&self, name: &str) -> bool {
        self.state.lock().unwrap().machines.contains_key(name)
    }

    async fn can_connect(&self, name: &str, skip_cache: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        if !skip_cache && state.connect_cache.contains(name) {
            return true;
        }

        let reachable = state
            .machines
            .get(name)
            .map(|machine| machine.reachable)
            .unwrap_or(false);
        if reachable {
            state.connect_cache.insert(name.to_string());
        } else {
            state.connect_cache.remove(name);
        }
        reachable
    }

    async fn credentials(&self, name: &str) -> Result<HostCredentials, DriverError> {
        let state = self.state.lock().unwrap();
        if !state.machines.contains_key(name) {
            return Err(DriverError::NotFound(name.to_string()));
        }
        Ok(HostCredentials {
            host: format!("tcp://{name}:2376"),
            tls_dir: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_create_and_list() {
        let driver = MockMachineDriver::new();
        driver.create("mock", "m1", &[]).await.unwrap();
        driver.create("mock", "m2", &[]).await.unwrap();

        assert_eq!(driver.list().await.unwrap(), vec!["m1", "m2"]);
        assert!(driver.exist("m1").await);
        assert!(!driver.exist("m3").await);
    }

    #[tokio::test]
    async fn test_mock_connect_cache_honors_skip() {
        let driver = MockMachineDriver::new();
        driver.add_machine("m1", true);

        // Prime the cache, then make the machine unreachable.
        assert!(driver.can_connect("m1", false).await);
        driver.set_reachable("m1", false);

        // Cached positive result without skip; fresh probe with skip.
        assert!(driver.can_connect("m1", false).await);
        assert!(!driver.can_connect("m1", true).await);
    }

    #[tokio::test]
    async fn test_mock_scripted_failures() {
        let driver = MockMachineDriver::new();
        driver.fail_next_creates(1);
        assert!(driver.create("mock", "m1", &[]).await.is_err());
        assert!(driver.create("mock", "m2", &[]).await.is_ok());

        driver.fail_removes("m2", 2);
        assert!(driver.remove("m2").await.is_err());
        assert!(driver.remove("m2").await.is_err());
        assert!(driver.remove("m2").await.is_ok());
        assert!(!driver.exist("m2").await);
    }

    #[tokio::test]
    async fn test_mock_credentials() {
        let driver = MockMachineDriver::new();
        driver.add_machine("m1", true);

        let creds = driver.credentials("m1").await.unwrap();
        assert_eq!(creds.host, "tcp://m1:2376");
        assert!(driver.credentials("missing").await.is_err());
    }
}
