//! The machine pool.
//!
//! The provider owns the inventory of every machine it knows about and keeps
//! it converged against the idle policy:
//!
//! - `acquire` reconciles the driver's machine list with the inventory,
//!   retires machines the policy rejects, pre-creates up to the idle target
//!   and hands out a reserved machine when one is reachable
//! - `use_machine` binds a reserved machine to a job, provisioning a fresh
//!   one just in time when the pool runs dry
//! - `release` returns a machine to the pool or retires it
//!
//! Removal is always asynchronous: one task per machine, with the driver
//! calls made outside any pool lock. Records are only deleted after the
//! driver confirms the machine is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use quarry_core::config::{MachineConfig, RunnerConfig};
use quarry_core::executor::{Executor, ExecutorData, ExecutorError, ExecutorProvider};

use crate::data::MachinesData;
use crate::details::{MachineDetails, MachineState};
use crate::driver::{DriverError, MachineDriver};
use crate::executor::MachineExecutor;
use crate::growth::GrowthCoordinator;
use crate::name::{filter_machine_list, new_machine_name};
use crate::policy;

/// Errors surfaced by the pool.
#[derive(Debug, Error)]
pub enum MachineProviderError {
    /// The pool is configured to keep idle machines but has none right now;
    /// the caller should back off and re-poll.
    #[error("no free machines that can process builds")]
    NoFreeMachine,

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Config(#[from] quarry_core::config::ConfigError),

    /// The provisioning task died before reporting a result.
    #[error("machine creation aborted")]
    CreationAborted,
}

/// Lifetime counters, exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderStatistics {
    pub created: u64,
    pub used: u64,
    pub removed: u64,
}

#[derive(Default)]
struct StatisticsCells {
    created: AtomicU64,
    used: AtomicU64,
    removed: AtomicU64,
}

/// Stop/remove tuning carried into detached removal tasks.
#[derive(Debug, Clone)]
struct RemovalTuning {
    stop_timeout: Duration,
    remove_retry_tries: usize,
    remove_retry_interval: Duration,
}

impl RemovalTuning {
    fn for_config(config: &RunnerConfig) -> Self {
        match config.machine() {
            Ok(machine) => Self {
                stop_timeout: machine.stop_timeout(),
                remove_retry_tries: machine.remove_retry_tries,
                remove_retry_interval: machine.remove_retry_interval(),
            },
            Err(_) => Self {
                stop_timeout: Duration::from_secs(60),
                remove_retry_tries: 3,
                remove_retry_interval: Duration::from_secs(30),
            },
        }
    }
}

/// Autoscaling pool of single-use machines.
pub struct MachineProvider {
    this: Weak<MachineProvider>,
    driver: Arc<dyn MachineDriver>,
    /// Provider of the executors that actually run jobs on a bound machine.
    inner: Arc<dyn ExecutorProvider>,

    inventory: RwLock<HashMap<String, MachineDetails>>,
    /// Serializes concurrent `acquire` calls.
    acquire_lock: Mutex<()>,
    /// Per-runner growth coordinators, created lazily.
    coordinators: Mutex<HashMap<String, Arc<GrowthCoordinator>>>,
    /// Serializes removal retries for stuck machines.
    stuck_removal_lock: Mutex<()>,

    stats: StatisticsCells,
}

impl MachineProvider {
    pub fn new(driver: Arc<dyn MachineDriver>, inner: Arc<dyn ExecutorProvider>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            driver,
            inner,
            inventory: RwLock::new(HashMap::new()),
            acquire_lock: Mutex::new(()),
            coordinators: Mutex::new(HashMap::new()),
            stuck_removal_lock: Mutex::new(()),
            stats: StatisticsCells::default(),
        })
    }

    pub(crate) fn handle(&self) -> Option<Arc<MachineProvider>> {
        self.this.upgrade()
    }

    pub(crate) fn inventory(&self) -> &RwLock<HashMap<String, MachineDetails>> {
        &self.inventory
    }

    pub(crate) fn driver(&self) -> &Arc<dyn MachineDriver> {
        &self.driver
    }

    pub(crate) fn stats_removed(&self) -> &AtomicU64 {
        &self.stats.removed
    }

    pub fn statistics(&self) -> ProviderStatistics {
        ProviderStatistics {
            created: self.stats.created.load(Ordering::Relaxed),
            used: self.stats.used.load(Ordering::Relaxed),
            removed: self.stats.removed.load(Ordering::Relaxed),
        }
    }

    /// Reserve an idle machine for the runner.
    ///
    /// Returns `Ok(Some(_))` with a reserved machine, `Ok(None)` when the
    /// caller should provision just in time through `use_machine`, and
    /// `Err(NoFreeMachine)` when the pool keeps idle machines but currently
    /// has none.
    pub async fn acquire(
        &self,
        config: &RunnerConfig,
    ) -> Result<Option<ExecutorData>, MachineProviderError> {
        let machine_cfg = config.machine()?.clone();

        // Two acquires must not interleave their scaling decisions.
        let _guard = self.acquire_lock.lock().await;

        let machines = self.load_machines(config, &machine_cfg).await?;
        let (mut data, valid) = self.update_machines(machines, config, &machine_cfg).await;

        self.create_machines(config, &machine_cfg, &mut data).await;

        debug!(
            runner = %config.short_description(),
            %data,
            idle_count = machine_cfg.idle_count(),
            limit = config.limit,
            "Machine pool status"
        );

        if let Some(name) = self.find_free_machine(config, &valid).await {
            return Ok(Some(ExecutorData::new(name)));
        }

        if machine_cfg.idle_count() > 0 && data.idle == 0 {
            return Err(MachineProviderError::NoFreeMachine);
        }

        Ok(None)
    }

    /// Bind a reserved machine to a job.
    ///
    /// When the passed machine is unusable or absent, a replacement is
    /// provisioned and returned as the second tuple element; the caller owns
    /// its release. The returned config carries the machine's credentials.
    pub async fn use_machine(
        &self,
        config: &RunnerConfig,
        data: Option<&ExecutorData>,
    ) -> Result<(RunnerConfig, Option<ExecutorData>), MachineProviderError> {
        let machine_cfg = config.machine()?.clone();

        let mut name = data.map(|d| d.as_str().to_string());
        let mut new_data = None;

        let usable = match &name {
            Some(n) => {
                let reserved = {
                    let inventory = self.inventory.read().await;
                    inventory.get(n).map(|d| d.can_be_used()).unwrap_or(false)
                };
                reserved && self.driver.can_connect(n, false).await
            }
            None => false,
        };

        if !usable {
            let fresh = self.retry_use_machine(config, &machine_cfg).await?;
            name = Some(fresh.clone());
            new_data = Some(ExecutorData::new(fresh));
        }

        let name = name.expect("machine name resolved above");

        let credentials = match self.driver.credentials(&name).await {
            Ok(credentials) => credentials,
            Err(err) => {
                if let Some(fresh) = new_data {
                    self.release(config, fresh).await;
                }
                return Err(err.into());
            }
        };

        let mut effective = config.clone();
        effective.host = Some(credentials);

        let used_count = {
            let mut inventory = self.inventory.write().await;
            match inventory.get_mut(&name) {
                Some(details) => {
                    details.state = MachineState::Used;
                    details.used = Instant::now();
                    details.used_count += 1;
                    details.used_count
                }
                None => return Err(MachineProviderError::Driver(DriverError::NotFound(name))),
            }
        };
        self.stats.used.fetch_add(1, Ordering::Relaxed);

        info!(name = %name, used_count, "Using machine");
        Ok((effective, new_data))
    }

    /// Return a machine to the pool, or retire it once its build budget is
    /// spent.
    pub async fn release(&self, config: &RunnerConfig, data: ExecutorData) {
        let name = data.as_str();

        let over_budget = {
            let mut inventory = self.inventory.write().await;
            let Some(details) = inventory.get_mut(name) else {
                return;
            };
            if details.state == MachineState::Used {
                details.used = Instant::now();
            }
            let max_builds = config.machine().map(|m| m.max_builds).unwrap_or(0);
            max_builds > 0 && details.used_count >= max_builds
        };

        if over_budget && self.request_removal(config, name, "Too many builds").await {
            return;
        }

        {
            let mut inventory = self.inventory.write().await;
            if let Some(details) = inventory.get_mut(name) {
                details.state = MachineState::Idle;
            }
        }
        self.coordinator_for(config).await.add_available_machine();
    }

    /// Per-runner growth coordinator, created lazily.
    pub async fn coordinator_for(&self, config: &RunnerConfig) -> Arc<GrowthCoordinator> {
        let mut coordinators = self.coordinators.lock().await;
        coordinators
            .entry(config.token.clone())
            .or_insert_with(|| Arc::new(GrowthCoordinator::new()))
            .clone()
    }

    /// Current inventory snapshot, newest records included.
    pub async fn machine_snapshot(&self) -> Vec<MachineDetails> {
        let inventory = self.inventory.read().await;
        inventory.values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Acquisition internals
    // ------------------------------------------------------------------

    /// Driver inventory filtered for this runner, merged with machines that
    /// are still being created and therefore invisible to the driver.
    async fn load_machines(
        &self,
        config: &RunnerConfig,
        machine_cfg: &MachineConfig,
    ) -> Result<Vec<String>, MachineProviderError> {
        let listed = self.driver.list().await?;
        let mut machines = filter_machine_list(listed, config, &machine_cfg.name_template);

        let inventory = self.inventory.read().await;
        for (name, details) in inventory.iter() {
            if details.state == MachineState::Creating && !machines.contains(name) {
                let mine =
                    !filter_machine_list(vec![name.clone()], config, &machine_cfg.name_template)
                        .is_empty();
                if mine {
                    machines.push(name.clone());
                }
            }
        }

        Ok(machines)
    }

    /// Refresh every known machine, retire what the policy rejects and count
    /// the rest. Counts accumulate during the walk so earlier machines fill
    /// the idle quota first.
    async fn update_machines(
        &self,
        machines: Vec<String>,
        config: &RunnerConfig,
        machine_cfg: &MachineConfig,
    ) -> (MachinesData, Vec<String>) {
        let mut data = MachinesData::default();
        let mut valid = Vec::with_capacity(machines.len());

        for name in machines {
            let now = Instant::now();
            let details = self.ensure_details(&name, now).await;

            let decision = policy::should_remove(&details, config, machine_cfg, &data, now);
            match decision {
                Some(reason) => {
                    self.request_removal(config, &name, reason.to_string()).await;
                }
                None => valid.push(name.clone()),
            }

            // Count the post-decision state; a retired machine counts as
            // removing, not idle.
            let inventory = self.inventory.read().await;
            if let Some(details) = inventory.get(&name) {
                data.add(details, machine_cfg.remove_retry_tries);
            }
        }

        (data, valid)
    }

    /// Pre-create idle machines while the policy allows it.
    async fn create_machines(
        &self,
        config: &RunnerConfig,
        machine_cfg: &MachineConfig,
        data: &mut MachinesData,
    ) {
        while policy::can_create(config, machine_cfg, data) {
            if self.create(config, MachineState::Idle).await.is_err() {
                break;
            }
            data.creating += 1;
        }
    }

    /// Walk candidates newest-first and reserve the first reachable one.
    /// Unreachable machines are retired on the spot.
    async fn find_free_machine(&self, config: &RunnerConfig, machines: &[String]) -> Option<String> {
        for name in machines.iter().rev() {
            if self.try_acquire_details(name).await.is_none() {
                continue;
            }

            if self.driver.can_connect(name, true).await {
                return Some(name.clone());
            }
            self.request_removal(config, name, "machine is unavailable").await;
        }
        None
    }

    /// Start provisioning a machine. The returned channel yields the
    /// provisioning outcome; the machine record is already `Creating`.
    async fn create(
        &self,
        config: &RunnerConfig,
        state: MachineState,
    ) -> Result<(String, oneshot::Receiver<Result<(), DriverError>>), MachineProviderError> {
        let machine_cfg = config.machine()?.clone();
        let name = new_machine_name(config, &machine_cfg.name_template);

        {
            let mut inventory = self.inventory.write().await;
            let details = inventory
                .entry(name.clone())
                .or_insert_with(|| MachineDetails::discovered(&name));
            details.state = MachineState::Creating;
            details.used_count = 0;
            details.retry_count = 0;
            details.last_seen = Instant::now();
        }

        let (tx, rx) = oneshot::channel();
        let Some(provider) = self.this.upgrade() else {
            return Err(MachineProviderError::CreationAborted);
        };
        let coordinator = self.coordinator_for(config).await;
        let config = config.clone();
        let task_name = name.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let result = coordinator
                .wait_for_growth_capacity(
                    machine_cfg.max_growth_rate,
                    provider.provision_machine(&config, &machine_cfg, &task_name),
                )
                .await;

            match result {
                Ok(retries) => {
                    {
                        let mut inventory = provider.inventory.write().await;
                        if let Some(details) = inventory.get_mut(&task_name) {
                            details.state = state;
                            details.used = Instant::now();
                        }
                    }
                    provider.stats.created.fetch_add(1, Ordering::Relaxed);
                    info!(
                        name = %task_name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        retries,
                        "Machine created"
                    );
                    if state == MachineState::Idle {
                        coordinator.add_available_machine();
                    }
                    let _ = tx.send(Ok(()));
                }
                Err(err) => {
                    error!(
                        name = %task_name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        error = %err,
                        "Machine creation failed"
                    );
                    provider.request_removal(&config, &task_name, "Failed to create").await;
                    let _ = tx.send(Err(err));
                }
            }
        });

        Ok((name, rx))
    }

    /// Drive the driver's create, falling back to re-provisioning up to
    /// three times before giving up.
    async fn provision_machine(
        &self,
        _config: &RunnerConfig,
        machine_cfg: &MachineConfig,
        name: &str,
    ) -> Result<usize, DriverError> {
        let mut result = self
            .driver
            .create(&machine_cfg.driver, name, &machine_cfg.options)
            .await;

        let mut retries = 0;
        for _ in 0..3 {
            let Err(err) = &result else {
                break;
            };
            retries += 1;
            {
                let mut inventory = self.inventory.write().await;
                if let Some(details) = inventory.get_mut(name) {
                    details.retry_count = retries;
                }
            }
            warn!(name, error = %err, "Machine creation failed, trying to provision");
            tokio::time::sleep(machine_cfg.provision_retry_interval()).await;
            result = self.driver.provision(name).await;
        }

        result.map(|_| retries)
    }

    /// Find a free machine in the driver inventory or provision one.
    async fn use_free_or_new(
        &self,
        config: &RunnerConfig,
        machine_cfg: &MachineConfig,
    ) -> Result<String, MachineProviderError> {
        let machines = self.load_machines(config, machine_cfg).await?;
        if let Some(name) = self.find_free_machine(config, &machines).await {
            return Ok(name);
        }
        self.create_and_acquire_machine(config, machine_cfg).await
    }

    async fn retry_use_machine(
        &self,
        config: &RunnerConfig,
        machine_cfg: &MachineConfig,
    ) -> Result<String, MachineProviderError> {
        let mut last_err = None;
        for attempt in 0..3 {
            match self.use_free_or_new(config, machine_cfg).await {
                Ok(name) => return Ok(name),
                Err(err) => {
                    warn!(attempt, error = %err, "Machine acquisition failed, retrying");
                    last_err = Some(err);
                    if attempt + 1 < 3 {
                        tokio::time::sleep(machine_cfg.provision_retry_interval()).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(MachineProviderError::CreationAborted))
    }

    /// Provision a machine and race its completion against machines other
    /// jobs return to the pool.
    ///
    /// The new machine lands in the shared pool as `Idle`, so two racing
    /// callers cannot both claim it: each waiter re-acquires through the
    /// inventory, and whoever loses keeps waiting for the next signal or
    /// tick.
    async fn create_and_acquire_machine(
        &self,
        config: &RunnerConfig,
        machine_cfg: &MachineConfig,
    ) -> Result<String, MachineProviderError> {
        let coordinator = self.coordinator_for(config).await;
        let (name, mut creation_rx) = self.create(config, MachineState::Idle).await?;

        let mut creation_pending = true;
        loop {
            if creation_pending {
                tokio::select! {
                    outcome = &mut creation_rx => {
                        creation_pending = false;
                        match outcome {
                            Ok(Ok(())) => {
                                if self.try_acquire_details(&name).await.is_some() {
                                    return Ok(name);
                                }
                                // A rival claimed it; keep waiting for the
                                // next machine to turn idle.
                            }
                            Ok(Err(err)) => return Err(err.into()),
                            Err(_) => return Err(MachineProviderError::CreationAborted),
                        }
                    }
                    _ = coordinator.available_signal() => {
                        if let Some(found) =
                            self.try_acquire_available(config, machine_cfg, &coordinator).await?
                        {
                            return Ok(found);
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        if let Some(found) =
                            self.try_acquire_available(config, machine_cfg, &coordinator).await?
                        {
                            return Ok(found);
                        }
                    }
                }
            } else {
                tokio::select! {
                    _ = coordinator.available_signal() => {
                        if let Some(found) =
                            self.try_acquire_available(config, machine_cfg, &coordinator).await?
                        {
                            return Ok(found);
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        if let Some(found) =
                            self.try_acquire_available(config, machine_cfg, &coordinator).await?
                        {
                            return Ok(found);
                        }
                    }
                }
            }
        }
    }

    /// Consume one availability credit and try to reserve whatever is free.
    async fn try_acquire_available(
        &self,
        config: &RunnerConfig,
        machine_cfg: &MachineConfig,
        coordinator: &GrowthCoordinator,
    ) -> Result<Option<String>, MachineProviderError> {
        if !coordinator.get_available_machine() {
            return Ok(None);
        }
        let machines = self.load_machines(config, machine_cfg).await?;
        Ok(self.find_free_machine(config, &machines).await)
    }

    // ------------------------------------------------------------------
    // Inventory records
    // ------------------------------------------------------------------

    /// Fetch or create the record for a machine seen in the driver
    /// inventory, refreshing its last-seen time.
    async fn ensure_details(&self, name: &str, now: Instant) -> MachineDetails {
        let mut inventory = self.inventory.write().await;
        let details = inventory
            .entry(name.to_string())
            .or_insert_with(|| MachineDetails::discovered(name));
        details.last_seen = now;
        details.clone()
    }

    /// Reserve the machine if it is idle.
    async fn try_acquire_details(&self, name: &str) -> Option<MachineDetails> {
        let mut inventory = self.inventory.write().await;
        let details = inventory
            .entry(name.to_string())
            .or_insert_with(|| MachineDetails::discovered(name));
        if details.is_used() {
            return None;
        }
        details.state = MachineState::Acquired;
        Some(details.clone())
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Transition a machine to `Removing` and clean it up in the background.
    /// Returns false when the machine is unknown.
    pub(crate) async fn request_removal(
        &self,
        config: &RunnerConfig,
        name: &str,
        reason: impl Into<String>,
    ) -> bool {
        let reason = reason.into();
        let tuning = RemovalTuning::for_config(config);

        {
            let mut inventory = self.inventory.write().await;
            let Some(details) = inventory.get_mut(name) else {
                return false;
            };
            warn!(
                name,
                reason = %reason,
                created_secs = details.created.elapsed().as_secs(),
                used_secs = details.used.elapsed().as_secs(),
                "Removing machine"
            );
            details.reason = Some(reason);
            details.state = MachineState::Removing;
            details.retry_count = 0;
            details.used = Instant::now();
        }

        let Some(provider) = self.this.upgrade() else {
            return false;
        };
        let name = name.to_string();
        tokio::spawn(async move {
            provider.finalize_removal(name, tuning).await;
        });
        true
    }

    /// Detached removal task: best-effort stop, then remove with bounded
    /// retries. A machine that exhausts its retry budget is stuck; its
    /// further attempts are serialized so one wedged machine cannot starve
    /// healthy removal throughput.
    async fn finalize_removal(&self, name: String, tuning: RemovalTuning) {
        let stop_started = Instant::now();
        if let Err(err) = self.driver.stop(&name, tuning.stop_timeout).await {
            debug!(name = %name, error = %err, "Machine stop failed");
        }
        debug!(
            name = %name,
            elapsed_ms = stop_started.elapsed().as_millis() as u64,
            "Machine stopped"
        );

        let mut removed = false;
        for attempt in 1..=tuning.remove_retry_tries {
            if !self.driver.exist(&name).await {
                warn!(name = %name, "Skipping machine removal, because it doesn't exist");
                removed = true;
                break;
            }
            match self.driver.remove(&name).await {
                Ok(()) => {
                    removed = true;
                    break;
                }
                Err(err) => {
                    self.record_removal_retry(&name, attempt).await;
                    warn!(name = %name, attempt, error = %err, "Retrying removal");
                    tokio::time::sleep(tuning.remove_retry_interval).await;
                }
            }
        }

        if !removed {
            warn!(name = %name, "Machine removal stuck, serializing further attempts");
            let mut attempt = tuning.remove_retry_tries;
            loop {
                let guard = self.stuck_removal_lock.lock().await;
                if !self.driver.exist(&name).await || self.driver.remove(&name).await.is_ok() {
                    break;
                }
                drop(guard);
                attempt += 1;
                self.record_removal_retry(&name, attempt).await;
                tokio::time::sleep(tuning.remove_retry_interval).await;
            }
        }

        let details = {
            let mut inventory = self.inventory.write().await;
            inventory.remove(&name)
        };
        self.stats.removed.fetch_add(1, Ordering::Relaxed);

        let (reason, retries) = details
            .map(|d| (d.reason.unwrap_or_default(), d.retry_count))
            .unwrap_or_default();
        info!(name = %name, reason = %reason, retries, "Machine removed");
    }

    async fn record_removal_retry(&self, name: &str, attempt: usize) {
        let mut inventory = self.inventory.write().await;
        if let Some(details) = inventory.get_mut(name) {
            details.retry_count = attempt;
        }
    }
}

#[async_trait]
impl ExecutorProvider for MachineProvider {
    fn create(&self) -> Box<dyn Executor> {
        Box::new(MachineExecutor::new(self.this.clone(), self.inner.clone()))
    }

    async fn acquire(&self, config: &RunnerConfig) -> Result<Option<ExecutorData>, ExecutorError> {
        MachineProvider::acquire(self, config)
            .await
            .map_err(|err| match err {
                MachineProviderError::NoFreeMachine => ExecutorError::NoFreeMachine,
                other => ExecutorError::system(other),
            })
    }

    async fn release(&self, config: &RunnerConfig, data: ExecutorData) {
        MachineProvider::release(self, config, data).await;
    }
}
