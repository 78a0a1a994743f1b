//! Poller
//!
//! Fires the reconciler trigger on a fixed interval so drift caused outside
//! the engine (unplugged devices, modules unloaded by other tools) is noticed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;

use crate::reconciler::Trigger;

/// Periodic trigger source, run as its own task
pub struct Poller {
    interval: Duration,
    trigger: Arc<Trigger>,
    paused: watch::Receiver<bool>,
    force: Arc<Notify>,
    ticks: Arc<AtomicU64>,
}

/// Control side of a running [`Poller`]
#[derive(Clone)]
pub struct PollerHandle {
    paused: Arc<watch::Sender<bool>>,
    force: Arc<Notify>,
    ticks: Arc<AtomicU64>,
}

impl Poller {
    pub fn new(interval: Duration, trigger: Arc<Trigger>, start_paused: bool) -> (Self, PollerHandle) {
        let (paused_tx, paused_rx) = watch::channel(start_paused);
        let force = Arc::new(Notify::new());
        let ticks = Arc::new(AtomicU64::new(0));

        let poller = Self {
            interval,
            trigger,
            paused: paused_rx,
            force: force.clone(),
            ticks: ticks.clone(),
        };
        let handle = PollerHandle {
            paused: Arc::new(paused_tx),
            force,
            ticks,
        };
        (poller, handle)
    }

    /// Tick until `shutdown` flips to true or its sender goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval = ?self.interval, "Poller started");

        loop {
            let paused = *self.paused.borrow();

            tokio::select! {
                _ = ticker.tick(), if !paused => self.tick(),
                _ = self.force.notified() => self.tick(),
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let paused = *self.paused.borrow();
                    tracing::info!(paused, "Poller state changed");
                    if !paused {
                        // Resuming polls right away instead of waiting a full period.
                        self.tick();
                        ticker.reset();
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Poller stopped");
    }

    fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.trigger.fire();
    }
}

impl PollerHandle {
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Trigger an observation now, even while paused.
    pub fn force_tick(&self) {
        self.force.notify_one();
    }

    /// Ticks fired so far, forced ones included
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn(
        interval: Duration,
        start_paused: bool,
    ) -> (PollerHandle, Arc<Trigger>, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let trigger = Arc::new(Trigger::new());
        let (poller, handle) = Poller::new(interval, trigger.clone(), start_paused);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(poller.run(shutdown_rx));
        (handle, trigger, shutdown_tx, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_interval() {
        let (handle, trigger, shutdown, task) = spawn(Duration::from_secs(2), false);

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        // Immediate first tick, then one every two seconds
        assert_eq!(handle.ticks(), 3);
        assert_eq!(trigger.fired(), 3);

        shutdown.send_replace(true);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_poller_only_forced_ticks() {
        let (handle, _, shutdown, task) = spawn(Duration::from_secs(1), true);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.ticks(), 0);
        assert!(handle.is_paused());

        handle.force_tick();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.ticks(), 1);

        handle.resume();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.ticks(), 2);

        shutdown.send_replace(true);
        task.await.unwrap();
    }
}
