use async_trait::async_trait;

use crate::entry::IngressEntry;
use crate::Result;

/// Last-observed health of an updater, aggregated into the process health
/// endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdaterHealth {
    Ok,
    Unhealthy(String),
}

impl UpdaterHealth {
    pub fn is_ok(&self) -> bool {
        matches!(self, UpdaterHealth::Ok)
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        UpdaterHealth::Unhealthy(reason.into())
    }
}

/// Lifecycle contract shared by every side-effecting subsystem: the nginx
/// supervisor, the frontend attacher, the ingress status writer and the DNS
/// reconciler. The orchestrator depends only on this contract.
///
/// * `start` runs once before the event loop; a failure aborts startup.
/// * `update` is called with the current entry snapshot, never concurrently
///   with itself. A failure skips the rest of the pipeline for that cycle
///   and is retried on the next event or resync.
/// * Teardown happens in three ordered phases across the whole pipeline:
///   every updater's `drain` runs first (shed new traffic while everything
///   still serves), then every `stop` (the proxy quits and flushes here),
///   then every `deregister` (release external registrations once nothing
///   is serving). `drain` and `deregister` default to no-ops; `stop` must
///   be safe to call after a failed `start`.
/// * `health` is polled by the health endpoint at any time.
#[async_trait]
pub trait Updater: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<()>;

    async fn update(&self, entries: &[IngressEntry]) -> Result<()>;

    /// First shutdown phase: stop new traffic arriving, leaving in-flight
    /// requests to complete through the still-running proxy.
    async fn drain(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()>;

    /// Final shutdown phase, after every `stop` has returned.
    async fn deregister(&self) -> Result<()> {
        Ok(())
    }

    fn health(&self) -> UpdaterHealth;
}
