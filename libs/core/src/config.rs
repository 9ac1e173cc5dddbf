//! Configuration for the quarry agent.
//!
//! The agent is configured from a TOML file with one `[[runners]]` table per
//! registered runner. Machine-pool settings live under `runners.machine`.
//! Accessors apply the documented defaults and coercions so callers never
//! re-implement them.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors that are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The runner uses the machine executor but carries no `[runners.machine]` table.
    #[error("runner {0}: missing machine configuration")]
    MissingMachineConfig(String),

    /// The machine name template must contain exactly one `%s` placeholder.
    #[error("runner {runner}: machine name template {template:?} must contain exactly one %s")]
    InvalidNameTemplate { runner: String, template: String },

    /// The runner token is empty.
    #[error("runner {0}: missing token")]
    MissingToken(String),
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of jobs handled concurrently across all runners.
    #[serde(default = "default_concurrent")]
    pub concurrent: usize,

    /// Seconds between job-request polls per runner.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Overall budget for graceful shutdown, including the machine-pool drain.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub runners: Vec<RunnerConfig>,
}

fn default_concurrent() -> usize {
    1
}

fn default_check_interval_secs() -> u64 {
    3
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl AgentConfig {
    /// Parse a TOML document and validate every runner entry.
    pub fn from_toml(raw: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let config: AgentConfig = toml::from_str(raw)?;
        for runner in &config.runners {
            runner.validate()?;
        }
        Ok(config)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Per-runner configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Human-readable runner name.
    pub name: String,

    /// Coordinator base URL.
    pub url: String,

    /// Runner authentication token.
    pub token: String,

    /// Executor backing this runner (e.g. "machine", "shell").
    #[serde(default = "default_executor")]
    pub executor: String,

    /// Maximum machines this runner may own. Zero disables the cap.
    #[serde(default)]
    pub limit: usize,

    /// Job log limit in KiB. Zero selects the default (4096).
    #[serde(default)]
    pub output_limit_kib: usize,

    /// TLS CA bundle presented by the coordinator.
    #[serde(default)]
    pub tls_ca_file: Option<PathBuf>,

    /// Client certificate for mutual TLS.
    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,

    /// Client private key for mutual TLS.
    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,

    /// Idle coordinator connections older than this are rotated before the
    /// next request. Zero disables rotation.
    #[serde(default)]
    pub connection_max_age_secs: u64,

    /// Machine-pool settings; required when `executor = "machine"`.
    #[serde(default)]
    pub machine: Option<MachineConfig>,

    /// Connection parameters of the machine a job was bound to. Never read
    /// from the config file; populated by the pool when a machine is used.
    #[serde(skip)]
    pub host: Option<HostCredentials>,
}

fn default_executor() -> String {
    "machine".to_string()
}

impl RunnerConfig {
    /// Stable short identity used in machine names and log fields.
    pub fn short_description(&self) -> String {
        self.token.chars().take(8).collect()
    }

    pub fn output_limit_bytes(&self) -> usize {
        let kib = if self.output_limit_kib == 0 {
            DEFAULT_OUTPUT_LIMIT_KIB
        } else {
            self.output_limit_kib
        };
        kib * 1024
    }

    pub fn connection_max_age(&self) -> Option<Duration> {
        match self.connection_max_age_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Machine settings, or an error naming the runner when absent.
    pub fn machine(&self) -> Result<&MachineConfig, ConfigError> {
        self.machine
            .as_ref()
            .ok_or_else(|| ConfigError::MissingMachineConfig(self.name.clone()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.is_empty() {
            return Err(ConfigError::MissingToken(self.name.clone()));
        }
        if self.executor == "machine" {
            let machine = self.machine()?;
            if machine.name_template.matches("%s").count() != 1 {
                return Err(ConfigError::InvalidNameTemplate {
                    runner: self.name.clone(),
                    template: machine.name_template.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Default job log limit in KiB (4 MiB).
pub const DEFAULT_OUTPUT_LIMIT_KIB: usize = 4096;

/// Connection parameters extracted from a pool machine, overlaid onto the
/// effective runner config when a job is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCredentials {
    /// Management endpoint of the machine, e.g. "tcp://10.0.0.5:2376".
    pub host: String,

    /// Directory holding the machine's TLS material.
    pub tls_dir: Option<PathBuf>,
}

/// Machine-pool settings for a runner.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfig {
    /// Machine driver passed to the backing provisioner.
    pub driver: String,

    /// Machine name template; exactly one `%s` is substituted with
    /// `<unix-seconds>-<hex4>`.
    pub name_template: String,

    /// Extra options forwarded verbatim to the driver on create.
    #[serde(default)]
    pub options: Vec<String>,

    /// Target number of idle machines kept warm.
    #[serde(default)]
    pub idle_count: usize,

    /// Floor for the dynamic idle target when `idle_scale_factor` is set.
    #[serde(default)]
    pub idle_count_min: usize,

    /// Multiplier on the in-use count producing a dynamic idle target.
    #[serde(default)]
    pub idle_scale_factor: f64,

    /// Seconds a machine may sit idle beyond the target before removal.
    #[serde(default)]
    pub idle_time_secs: u64,

    /// Jobs a machine may serve before it is retired. Zero means unlimited.
    #[serde(default)]
    pub max_builds: usize,

    /// Maximum concurrent provisions. Zero disables the admission gate.
    #[serde(default)]
    pub max_growth_rate: usize,

    /// Pause between provisioning retries.
    #[serde(default = "default_provision_retry_secs")]
    pub provision_retry_secs: u64,

    /// Removal attempts before a machine counts as stuck.
    #[serde(default = "default_remove_retry_tries")]
    pub remove_retry_tries: usize,

    /// Pause between removal retries.
    #[serde(default = "default_remove_retry_secs")]
    pub remove_retry_secs: u64,

    /// Deadline for the soft stop preceding removal.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Drain behavior on agent shutdown.
    #[serde(default)]
    pub shutdown_drain: Option<DrainConfig>,
}

fn default_provision_retry_secs() -> u64 {
    1
}

fn default_remove_retry_tries() -> usize {
    3
}

fn default_remove_retry_secs() -> u64 {
    30
}

fn default_stop_timeout_secs() -> u64 {
    60
}

impl MachineConfig {
    pub fn idle_count(&self) -> usize {
        self.idle_count
    }

    /// Floor of the dynamic idle target. A positive scale factor with no
    /// explicit floor is coerced to 1 so the pool cannot deadlock at zero.
    pub fn idle_count_min(&self) -> usize {
        if self.idle_scale_factor > 0.0 && self.idle_count_min == 0 {
            return 1;
        }
        self.idle_count_min
    }

    pub fn idle_time(&self) -> Duration {
        Duration::from_secs(self.idle_time_secs)
    }

    pub fn provision_retry_interval(&self) -> Duration {
        Duration::from_secs(self.provision_retry_secs)
    }

    pub fn remove_retry_interval(&self) -> Duration {
        Duration::from_secs(self.remove_retry_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Machine-pool drain behavior on agent shutdown.
#[derive(Debug, Clone, Deserialize)]
pub struct DrainConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Concurrent removals during drain.
    #[serde(default = "default_drain_concurrency")]
    pub concurrency: usize,

    /// Removal retries per machine during drain.
    #[serde(default = "default_drain_max_retries")]
    pub max_retries: usize,

    /// Base of the linear backoff between drain retries.
    #[serde(default = "default_drain_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

fn default_drain_concurrency() -> usize {
    3
}

fn default_drain_max_retries() -> usize {
    3
}

fn default_drain_retry_backoff_secs() -> u64 {
    5
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: default_drain_concurrency(),
            max_retries: default_drain_max_retries(),
            retry_backoff_secs: default_drain_retry_backoff_secs(),
        }
    }
}

impl DrainConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}
