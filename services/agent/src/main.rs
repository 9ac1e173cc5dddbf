//! Quarry CI worker agent.
//!
//! The agent polls a central coordinator for jobs, keeps an autoscaled pool
//! of single-use worker machines warm, runs job scripts through the
//! configured executor and streams logs and status back.
//!
//! ## Architecture
//!
//! - **Scheduler**: one poll-and-run loop per configured runner
//! - **Machine Provider**: the autoscaling pool behind the machine executor
//! - **Coordinator Client**: retrying transport with TLS rotation
//! - **Job Trace**: masked log buffer streamed incrementally per job

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod scheduler;
mod shell;

use quarry_coordinator::Coordinator;
use quarry_core::executor::{ExecutorProvider, ExecutorRegistry};
use quarry_machine::{CommandMachineDriver, MachineProvider};

use scheduler::Scheduler;
use shell::ShellExecutorProvider;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting quarry agent");

    let config = config::load()?;
    info!(
        concurrent = config.concurrent,
        runners = config.runners.len(),
        "Configuration loaded"
    );

    let coordinator = Arc::new(Coordinator::new());

    // Explicit executor registry; providers are constructor-injected, never
    // registered as a process-global side effect.
    let shell_provider: Arc<dyn ExecutorProvider> = Arc::new(ShellExecutorProvider);
    let machine_provider = MachineProvider::new(
        Arc::new(CommandMachineDriver::from_env()),
        Arc::clone(&shell_provider),
    );

    let mut registry = ExecutorRegistry::new();
    registry.register("shell", Arc::clone(&shell_provider));
    registry.register(
        "machine",
        Arc::clone(&machine_provider) as Arc<dyn ExecutorProvider>,
    );
    let registry = Arc::new(registry);

    for runner in &config.runners {
        if let Err(err) = coordinator.verify_runner(runner).await {
            warn!(
                runner = %runner.short_description(),
                error = %err,
                "Runner verification failed"
            );
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&coordinator),
        Arc::clone(&registry),
        config.check_interval(),
        config.concurrent,
    ));
    let mut workers = Vec::new();
    for runner in config.runners.clone() {
        let scheduler = Arc::clone(&scheduler);
        let shutdown_rx = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            scheduler.run_runner(runner, shutdown_rx).await;
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    // Drain the machine pool within the shutdown budget. Cancellation stops
    // new removals; in-flight ones complete.
    let (drain_cancel_tx, drain_cancel_rx) = watch::channel(false);
    let machine_runners: Vec<_> = config
        .runners
        .iter()
        .filter(|runner| runner.executor == "machine")
        .cloned()
        .collect();
    let mut drain = tokio::spawn({
        let provider = Arc::clone(&machine_provider);
        async move {
            for runner in machine_runners {
                provider.shutdown(&runner, drain_cancel_rx.clone()).await;
            }
        }
    });
    tokio::select! {
        _ = &mut drain => {}
        _ = tokio::time::sleep(config.shutdown_timeout()) => {
            warn!("Shutdown budget exhausted, cancelling machine pool drain");
            let _ = drain_cancel_tx.send(true);
            let _ = drain.await;
        }
    }

    info!("Waiting for runner loops to finish...");
    for worker in workers {
        // A loop stuck in a long job is abandoned; process exit reaps it.
        let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;
    }

    info!("Agent shutdown complete");
    Ok(())
}
