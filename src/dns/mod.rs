//! Reconciles a hosted zone against the ingress hostnames: lists the
//! records, plans the minimum change set, and applies it in size-bounded
//! batches.

pub mod clouddns;
pub mod plan;
pub mod route53;

pub use plan::{ChangeAction, ConsolidatedRecord, RecordChange, RecordStyle};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::entry::{IngressEntry, LbScheme};
use crate::frontend::{FrontendDetails, FrontendDiscoverer, FrontendMapping};
use crate::metrics::{
    DNS_CHANGES, DNS_FAILED_BATCHES, DNS_MANAGED_RECORDS, DNS_SKIPPED, DNS_UPDATES,
};
use crate::updater::{Updater, UpdaterHealth};
use crate::{Error, Result};

/// Provider capability: initialise against the zone, enumerate candidate
/// records, and apply change batches.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// The zone's domain name, e.g. `example.com.`; called once at start.
    async fn zone_domain(&self) -> Result<String>;

    /// Candidate records this controller could own: aliases, CNAMEs at the
    /// configured TTL, or single-datum A records, depending on provider.
    async fn list(&self) -> Result<Vec<ConsolidatedRecord>>;

    /// Apply one batch of changes atomically.
    async fn apply(&self, changes: &[RecordChange]) -> Result<()>;

    /// Provider limit on operations per batch.
    fn max_batch_size(&self) -> usize {
        100
    }
}

/// Where the frontend addresses come from: cloud discovery (shared with the
/// traffic daemon) or statically configured hostnames.
pub enum FrontendSource {
    Static {
        internal: Option<String>,
        external: Option<String>,
    },
    Discovered(Box<dyn FrontendDiscoverer>),
}

impl FrontendSource {
    async fn resolve(&self) -> Result<FrontendMapping> {
        match self {
            FrontendSource::Static { internal, external } => {
                let mut mapping = FrontendMapping::new();
                if let Some(hostname) = internal {
                    mapping.insert(
                        LbScheme::Internal,
                        FrontendDetails {
                            dns_name: hostname.clone(),
                            hosted_zone_id: None,
                            ip: None,
                        },
                    );
                }
                if let Some(hostname) = external {
                    mapping.insert(
                        LbScheme::InternetFacing,
                        FrontendDetails {
                            dns_name: hostname.clone(),
                            hosted_zone_id: None,
                            ip: None,
                        },
                    );
                }
                Ok(mapping)
            }
            FrontendSource::Discovered(discoverer) => {
                let mut mapping = FrontendMapping::new();
                for lb in discoverer.discover().await? {
                    mapping.entry(lb.scheme()).or_insert_with(|| lb.details());
                }
                Ok(mapping)
            }
        }
    }
}

pub struct DnsUpdater {
    provider: Box<dyn DnsProvider>,
    source: FrontendSource,
    style: RecordStyle,
    zone: Mutex<Option<String>>,
    frontends: Mutex<FrontendMapping>,
    last_error: Mutex<Option<String>>,
}

impl DnsUpdater {
    pub fn new(provider: Box<dyn DnsProvider>, source: FrontendSource, style: RecordStyle) -> Self {
        Self {
            provider,
            source,
            style,
            zone: Mutex::new(None),
            frontends: Mutex::new(FrontendMapping::new()),
            last_error: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Updater for DnsUpdater {
    fn name(&self) -> &'static str {
        "dns"
    }

    async fn start(&self) -> Result<()> {
        let domain = self.provider.zone_domain().await?;
        info!("reconciling zone {domain}");
        *self.zone.lock() = Some(domain);

        let frontends = self.source.resolve().await?;
        if frontends.is_empty() {
            return Err(Error::Discovery(
                "no frontends resolved; nothing to point records at".to_string(),
            ));
        }
        *self.frontends.lock() = frontends;
        Ok(())
    }

    async fn update(&self, entries: &[IngressEntry]) -> Result<()> {
        let zone = self
            .zone
            .lock()
            .clone()
            .ok_or_else(|| Error::Dns("updater not started".to_string()))?;
        let frontends = self.frontends.lock().clone();

        let existing = self.provider.list().await?;
        let plan = plan::compute(&zone, self.style, &frontends, &existing, entries);

        DNS_MANAGED_RECORDS.set(plan.managed as i64);
        for (host, reason) in &plan.skipped {
            info!("skipped {host}: {reason}");
            DNS_SKIPPED.with_label_values(&[reason]).inc();
        }

        let batches = plan::batch(plan.units, self.provider.max_batch_size());
        let mut failures = Vec::new();
        for batch in &batches {
            match self.provider.apply(batch).await {
                Ok(()) => {
                    for change in batch {
                        DNS_CHANGES
                            .with_label_values(&[change.action.as_str()])
                            .inc();
                    }
                }
                Err(e) => {
                    // Remaining batches still run so partial progress is
                    // preserved.
                    warn!("change batch of {} operations failed: {e}", batch.len());
                    DNS_FAILED_BATCHES.inc();
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            DNS_UPDATES.with_label_values(&["success"]).inc();
            *self.last_error.lock() = None;
            Ok(())
        } else {
            DNS_UPDATES.with_label_values(&["failure"]).inc();
            let joined = failures.join("; ");
            *self.last_error.lock() = Some(joined.clone());
            Err(Error::Dns(joined))
        }
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn health(&self) -> UpdaterHealth {
        match &*self.last_error.lock() {
            None => UpdaterHealth::Ok,
            Some(reason) => UpdaterHealth::Unhealthy(format!("record changes failing: {reason}")),
        }
    }
}
