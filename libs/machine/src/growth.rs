//! Per-runner provisioning admission and availability signaling.

use std::future::Future;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Gates parallel provisioning for one runner and lets waiters race machine
/// availability against other events.
///
/// The two concerns are deliberately separate: the admission gate serializes
/// provisioning bursts, while the availability signal is fully non-blocking
/// on the producer side so a burst of releases never stalls a releasing
/// task. `available_signal` is select-friendly; the counter is the source of
/// truth.
#[derive(Default)]
pub struct GrowthCoordinator {
    growing: Mutex<usize>,
    growth_notify: Notify,

    available: Mutex<usize>,
    available_notify: Notify,
}

impl GrowthCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` once fewer than `max` provisions are in flight. A `max` of
    /// zero disables the gate entirely.
    pub async fn wait_for_growth_capacity<F, T>(&self, max: usize, work: F) -> T
    where
        F: Future<Output = T>,
    {
        if max == 0 {
            return work.await;
        }

        loop {
            let notified = self.growth_notify.notified();
            if self.try_grow(max) {
                break;
            }
            notified.await;
        }

        let _guard = GrowthGuard { coordinator: self };
        work.await
    }

    fn try_grow(&self, max: usize) -> bool {
        let mut growing = self.growing.lock().unwrap();
        if *growing >= max {
            return false;
        }
        *growing += 1;
        true
    }

    /// In-flight provisions; exposed for the pool's debug logging.
    pub fn growing(&self) -> usize {
        *self.growing.lock().unwrap()
    }

    /// Record a machine turning idle and wake one waiter. Never blocks.
    pub fn add_available_machine(&self) {
        *self.available.lock().unwrap() += 1;
        self.available_notify.notify_one();
    }

    /// Consume one availability credit if any is pending.
    pub fn get_available_machine(&self) -> bool {
        let mut available = self.available.lock().unwrap();
        if *available == 0 {
            return false;
        }
        *available -= 1;
        true
    }

    /// Completes when a machine is signaled available. For `select!` racing;
    /// a completed wait does not consume the availability credit.
    pub async fn available_signal(&self) {
        self.available_notify.notified().await;
    }
}

struct GrowthGuard<'a> {
    coordinator: &'a GrowthCoordinator,
}

impl Drop for GrowthGuard<'_> {
    fn drop(&mut self) {
        let mut growing = self.coordinator.growing.lock().unwrap();
        *growing -= 1;
        drop(growing);
        self.coordinator.growth_notify.notify_one();
    }
}
