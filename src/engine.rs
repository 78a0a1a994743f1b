//! Routing engine
//!
//! Wires store, reconciler, intent queue and poller together and hands the
//! presentation layer an [`EngineHandle`]. The handle is the only surface
//! a UI needs: pull reads, a watch subscription, and intent submission.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::gateway::ServerGateway;
use crate::intent::{Intent, IntentOutcome, IntentQueue};
use crate::poller::{Poller, PollerHandle};
use crate::protocol::{DesiredGraph, ObservedSnapshot, RouteConfig, TopologyView};
use crate::reconciler::{Reconciler, Trigger};
use crate::store::TopologyStore;

/// Entry point for starting the engine
pub struct RoutingEngine;

impl RoutingEngine {
    /// Spawn the reconciler and poller tasks on the current runtime.
    pub fn start(config: &AppConfig, gateway: Arc<dyn ServerGateway>) -> EngineHandle {
        let store = Arc::new(TopologyStore::new());
        let trigger = Arc::new(Trigger::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reconciler = Reconciler::new(gateway, store.clone(), config.reconciler.clone());
        let (poller, poller_handle) = Poller::new(
            config.poller.interval(),
            trigger.clone(),
            config.poller.start_paused,
        );

        let tasks = vec![
            tokio::spawn(reconciler.run(trigger.clone(), shutdown_rx.clone())),
            tokio::spawn(poller.run(shutdown_rx)),
        ];

        // First observation happens even if the poller starts paused.
        trigger.fire();

        tracing::info!("Routing engine started");

        EngineHandle {
            intents: IntentQueue::new(store.clone(), trigger.clone()),
            store,
            trigger,
            poller: poller_handle,
            default_latency_ms: config.reconciler.default_latency_ms,
            shutdown: shutdown_tx,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        }
    }
}

/// Presentation-facing handle to a running engine
pub struct EngineHandle {
    store: Arc<TopologyStore>,
    intents: IntentQueue,
    trigger: Arc<Trigger>,
    poller: PollerHandle,
    default_latency_ms: u32,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EngineHandle {
    /// Submit a desired-state edit. Returns without waiting for the server.
    pub fn submit(&self, intent: Intent) -> Result<IntentOutcome> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::EngineStopped);
        }
        Ok(self.intents.submit(intent)?)
    }

    /// Route config with the configured default latency, or `latency_ms`.
    pub fn route_config(&self, latency_ms: Option<u32>) -> RouteConfig {
        RouteConfig::with_latency(latency_ms.unwrap_or(self.default_latency_ms))
    }

    /// Freshly derived view of the current state
    pub fn view(&self) -> TopologyView {
        self.store.view()
    }

    /// Last published view, without recomputing
    pub fn latest_view(&self) -> Arc<TopologyView> {
        self.store.latest_view()
    }

    /// Receive every published view
    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologyView>> {
        self.store.subscribe()
    }

    pub fn snapshot(&self) -> Arc<ObservedSnapshot> {
        self.store.snapshot()
    }

    pub fn desired(&self) -> DesiredGraph {
        self.store.desired().0
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    /// Observe and reconcile now
    pub fn refresh(&self) {
        self.poller.force_tick();
    }

    pub fn pause_polling(&self) {
        self.poller.pause();
    }

    pub fn resume_polling(&self) {
        self.poller.resume();
    }

    pub fn is_polling_paused(&self) -> bool {
        self.poller.is_paused()
    }

    /// Reconciliation triggers fired so far
    pub fn triggers_fired(&self) -> u64 {
        self.trigger.fired()
    }

    /// Stop the background tasks. The pass in progress finishes first, so
    /// commands already sent to the server are never abandoned.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down routing engine");
        self.shutdown.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Engine task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::FakeGateway;
    use crate::protocol::{Route, RouteKey, RouteState};
    use std::time::Duration;

    #[tokio::test]
    async fn test_engine_converges_and_stops() {
        let gateway = Arc::new(FakeGateway::with_endpoints(&["mic1"], &["spk1"]));
        let engine = RoutingEngine::start(&AppConfig::default(), gateway.clone());
        let key = RouteKey::new("mic1", "spk1");

        engine
            .submit(Intent::AddRoute(Route::new("mic1", "spk1", engine.route_config(None))))
            .unwrap();

        let mut views = engine.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            views.wait_for(|view| {
                view.route(&key).map(|r| r.state) == Some(RouteState::Active)
            }),
        )
        .await
        .unwrap()
        .unwrap();

        engine.shutdown().await;
        let err = engine.submit(Intent::RemoveRoute(key)).unwrap_err();
        assert!(matches!(err, Error::EngineStopped));
    }

    #[tokio::test]
    async fn test_poller_controls() {
        let gateway = Arc::new(FakeGateway::new());
        let engine = RoutingEngine::start(&AppConfig::default(), gateway);

        engine.pause_polling();
        assert!(engine.is_polling_paused());
        engine.resume_polling();
        assert!(!engine.is_polling_paused());

        engine.shutdown().await;
        engine.shutdown().await;
    }
}
