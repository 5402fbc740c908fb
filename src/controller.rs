use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::entry::IngressEntry;
use crate::k8s::{project, ClusterStores, EntryDefaults};
use crate::metrics::{INGRESS_ENTRIES, UPDATES};
use crate::updater::Updater;
use crate::{Error, Result};

/// Recovers from missed watch notifications by re-projecting everything.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Lets a burst of watch events settle into one dispatch.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Owns the updater pipeline: starts it, feeds it coalesced snapshots of
/// the cluster state, and tears it down in reverse order on shutdown.
pub struct Controller {
    updaters: Vec<Arc<dyn Updater>>,
    ingress_class: String,
    defaults: EntryDefaults,
    resync_interval: Duration,
}

impl Controller {
    pub fn new(
        updaters: Vec<Arc<dyn Updater>>,
        ingress_class: String,
        defaults: EntryDefaults,
    ) -> Self {
        Self {
            updaters,
            ingress_class,
            defaults,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }

    /// One-shot initialisation of every updater, in pipeline order. Any
    /// failure aborts startup.
    pub async fn start_updaters(&self) -> Result<()> {
        for updater in &self.updaters {
            info!("starting {}", updater.name());
            updater.start().await.inspect_err(|e| {
                error!("failed to start {}: {e}", updater.name());
            })?;
        }
        Ok(())
    }

    /// The event loop: one logical worker consuming coalesced watch
    /// notifications, with a periodic resync and signal-driven shutdown.
    /// Updates never run concurrently; events arriving mid-update collapse
    /// into a single trailing dispatch.
    pub async fn run(&self, stores: ClusterStores, mut events: mpsc::Receiver<()>) -> Result<()> {
        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                Some(()) = events.recv() => {
                    tokio::time::sleep(DEBOUNCE).await;
                    while events.try_recv().is_ok() {}
                    self.dispatch(&stores).await;
                }
                _ = resync.tick() => {
                    debug!("resync");
                    self.dispatch(&stores).await;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    async fn dispatch(&self, stores: &ClusterStores) {
        let entries = project(
            &stores.ingresses.state(),
            &stores.services.state(),
            &self.ingress_class,
            &self.defaults,
        );
        INGRESS_ENTRIES.set(entries.len() as i64);
        self.dispatch_entries(&entries).await;
    }

    /// Strict pipeline order with first-failure short-circuit: a failed
    /// updater keeps its successors from seeing the snapshot, and the next
    /// cycle retries from the top.
    pub async fn dispatch_entries(&self, entries: &[IngressEntry]) {
        for updater in &self.updaters {
            match updater.update(entries).await {
                Ok(()) => {
                    UPDATES.with_label_values(&[updater.name(), "success"]).inc();
                }
                Err(e) => {
                    warn!(
                        "update of {} failed, skipping remaining updaters this cycle: {e}",
                        updater.name()
                    );
                    UPDATES.with_label_values(&[updater.name(), "failure"]).inc();
                    break;
                }
            }
        }
    }

    /// Three-phase teardown in reverse pipeline order: drain every updater
    /// (frontends stop sending new traffic while nginx still serves), then
    /// stop (nginx quits and flushes in-flight requests), then deregister
    /// (backends leave the frontends only once nothing is serving).
    /// Failures are logged and folded into the result but never block the
    /// remaining phases.
    pub async fn shutdown(&self) -> Result<()> {
        let mut failures = Vec::new();

        for updater in self.updaters.iter().rev() {
            if let Err(e) = updater.drain().await {
                error!("failed to drain {}: {e}", updater.name());
                failures.push(format!("drain {}: {e}", updater.name()));
            }
        }

        for updater in self.updaters.iter().rev() {
            info!("stopping {}", updater.name());
            if let Err(e) = updater.stop().await {
                error!("failed to stop {}: {e}", updater.name());
                failures.push(format!("stop {}: {e}", updater.name()));
            }
        }

        for updater in self.updaters.iter().rev() {
            if let Err(e) = updater.deregister().await {
                error!("failed to deregister {}: {e}", updater.name());
                failures.push(format!("deregister {}: {e}", updater.name()));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Shutdown(failures.join("; ")))
        }
    }
}
