//! Coordinator transport layer.
//!
//! Wraps HTTP access to the coordinator with the cross-cutting concerns the
//! rest of the agent relies on:
//!
//! - `transport`: TLS material rotation, connection max-age, User-Agent
//! - `retry`: rate-limit-aware retries with bounded backoff
//! - `envelope`: JSON request/response handling and error-message extraction
//! - `api`: the typed coordinator endpoints (runners, jobs, trace patches)
//! - `client_pool`: one transport client per credential tuple

pub mod api;
pub mod client_pool;
mod envelope;
mod retry;
pub mod transport;

pub use api::{
    Coordinator, PatchState, PatchTraceResult, RegisterRunnerResponse, UpdateJobInfo,
    UpdateJobResult, UpdateState,
};
pub use client_pool::ClientPool;
pub use transport::{TransportClient, TransportError};

/// Hard ceiling for the server-advertised trace update interval.
pub const MAX_UPDATE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
