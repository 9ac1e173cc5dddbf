//! Shared types for the quarry agent.
//!
//! This crate holds the pieces every other quarry crate agrees on:
//!
//! - `config`: agent, runner and machine-pool configuration
//! - `job`: job state, failure reasons and credentials
//! - `executor`: the executor capability seam and the provider registry
//! - `version`: product identity and the User-Agent string

pub mod config;
pub mod executor;
pub mod job;
pub mod version;

pub use config::{AgentConfig, DrainConfig, HostCredentials, MachineConfig, RunnerConfig};
pub use executor::{Executor, ExecutorData, ExecutorProvider, ExecutorRegistry, FailuresCollector};
pub use job::{JobCredentials, JobFailureReason, JobInfo, JobState};
