//! Machine-pool drain on agent shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use quarry_core::config::{DrainConfig, RunnerConfig};

use crate::details::{MachineDetails, MachineState};
use crate::driver::DriverError;
use crate::provider::MachineProvider;

impl MachineProvider {
    /// Remove every machine the pool owns, `drain.concurrency` at a time,
    /// retrying with linear backoff. Cancellation stops dispatching new
    /// removals; removals already in flight complete.
    pub async fn shutdown(&self, config: &RunnerConfig, mut cancel: watch::Receiver<bool>) {
        info!(runner = %config.short_description(), "Shutting down machine provider");

        let drain = match config.machine() {
            Ok(machine) => match &machine.shutdown_drain {
                Some(drain) => drain.clone(),
                None => {
                    info!("No shutdown drain config, skipping machine pool drain");
                    return;
                }
            },
            Err(_) => {
                info!("No machine configuration, skipping machine pool drain");
                return;
            }
        };

        if !drain.enabled {
            info!("Shutdown drain is disabled, skipping machine pool drain");
            return;
        }

        let machines = self.machine_snapshot().await;
        if machines.is_empty() {
            info!("No machines to drain");
            return;
        }
        info!(count = machines.len(), "Draining machine pool");

        let semaphore = Arc::new(Semaphore::new(drain.concurrency.max(1)));
        let mut tasks: JoinSet<bool> = JoinSet::new();

        for details in machines {
            if *cancel.borrow() {
                warn!("Drain operation cancelled or timed out");
                break;
            }

            let permit = tokio::select! {
                _ = cancel.changed() => {
                    warn!("Drain operation cancelled or timed out");
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
            };

            let Some(provider) = self.handle() else {
                break;
            };
            let config = config.clone();
            let drain = drain.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                provider
                    .drain_machine_with_retry(&config, details, &drain, cancel)
                    .await
            });
        }

        let mut success = 0usize;
        let mut failed = 0usize;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => success += 1,
                _ => failed += 1,
            }
        }
        info!(success, failed, "Machine pool drain completed");
    }

    async fn drain_machine_with_retry(
        &self,
        config: &RunnerConfig,
        details: MachineDetails,
        drain: &DrainConfig,
        mut cancel: watch::Receiver<bool>,
    ) -> bool {
        let name = details.name;

        {
            let mut inventory = self.inventory().write().await;
            match inventory.get_mut(&name) {
                None => return true,
                Some(details) if details.state == MachineState::Removing => {
                    debug!(machine = %name, "Machine already being removed, skipping");
                    return true;
                }
                Some(details) => {
                    details.state = MachineState::Removing;
                    details.reason = Some("shutdown drain".to_string());
                }
            }
        }

        for attempt in 0..=drain.max_retries {
            match self.remove_for_drain(&name).await {
                Ok(()) => {
                    {
                        let mut inventory = self.inventory().write().await;
                        inventory.remove(&name);
                    }
                    self.stats_removed().fetch_add(1, Ordering::Relaxed);
                    info!(machine = %name, "Machine drained successfully");
                    return true;
                }
                Err(err) => {
                    warn!(
                        machine = %name,
                        attempt = attempt + 1,
                        error = %err,
                        "Failed to drain machine"
                    );
                    if attempt < drain.max_retries {
                        tokio::select! {
                            _ = cancel.changed() => {
                                warn!(machine = %name, "Machine drain cancelled");
                                return false;
                            }
                            _ = tokio::time::sleep(drain.retry_backoff() * (attempt as u32 + 1)) => {}
                        }
                    }
                }
            }
        }

        error!(machine = %name, "Failed to drain machine after all retries");
        false
    }

    async fn remove_for_drain(&self, name: &str) -> Result<(), DriverError> {
        if !self.driver().exist(name).await {
            return Ok(());
        }
        self.driver().remove(name).await
    }
}
