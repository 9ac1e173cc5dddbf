//! Autoscaling machine pool.
//!
//! The pool keeps a fleet of single-use worker VMs warm against an
//! idle-count/scale-factor policy:
//!
//! - `driver`: the VM lifecycle capability the pool drives (plus a mock)
//! - `command`: the CLI-backed driver for real provisioners
//! - `details`: per-machine lifecycle record
//! - `data`: pool-wide counters fed to the policy
//! - `policy`: pure may-create / should-remove decisions
//! - `growth`: per-runner provisioning admission and availability signaling
//! - `name`: machine naming and list filtering
//! - `provider`: the pool itself — acquire, use, release, removal, drain
//! - `executor`: the executor wrapper binding pool machines to jobs

pub mod command;
pub mod data;
pub mod details;
pub mod driver;
pub mod executor;
pub mod growth;
pub mod name;
pub mod policy;
pub mod provider;
mod shutdown;

pub use command::CommandMachineDriver;
pub use data::MachinesData;
pub use details::{MachineDetails, MachineState};
pub use driver::{DriverError, MachineDriver, MockMachineDriver};
pub use executor::MachineExecutor;
pub use growth::GrowthCoordinator;
pub use policy::RemovalReason;
pub use provider::{MachineProvider, MachineProviderError};
