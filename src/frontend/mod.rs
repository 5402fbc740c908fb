//! Registers the local instance as a backend of externally-discovered
//! frontends and removes it cleanly on shutdown. Providers implement the
//! `LoadBalancer` capability; the attacher drives one shared state machine
//! across all of them.

pub mod alb;
pub mod elb;
pub mod gce;
pub mod merlin;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::entry::{IngressEntry, LbScheme};
use crate::metrics::FRONTENDS_ATTACHED;
use crate::updater::{Updater, UpdaterHealth};
use crate::{Error, Result};

/// Tag marking a load balancer as a frontend of this cluster.
pub const FRONTEND_TAG: &str = "sky.uk/KubernetesClusterFrontend";
/// Optional tag further scoping a frontend to one ingress class.
pub const INGRESS_CLASS_TAG: &str = "sky.uk/KubernetesClusterIngressClass";

/// Deadline applied to every cloud API call.
pub const CLOUD_API_TIMEOUT: Duration = Duration::from_secs(10);

/// DNS details of one discovered frontend, keyed by scheme in the
/// `FrontendMapping`. Created once at startup and read-only afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrontendDetails {
    pub dns_name: String,
    pub hosted_zone_id: Option<String>,
    pub ip: Option<String>,
}

pub type FrontendMapping = HashMap<LbScheme, FrontendDetails>;

/// State of one backend registration. Registrations only exist once
/// discovery has named them, so they begin at `Discovered`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttachmentState {
    Discovered,
    Registering,
    Registered,
    Draining,
    Deregistered,
    Failed(String),
}

/// Capability set shared by every backend kind the attacher can register
/// with: classic ELBs, target groups, GCE instance groups and target pools,
/// and Merlin services.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Stable identifier used in logs and health reasons.
    fn identifier(&self) -> String;

    fn kind(&self) -> &'static str;

    fn scheme(&self) -> LbScheme;

    fn details(&self) -> FrontendDetails;

    /// Whether the local instance already appears in the member list. Used
    /// before attach and detach, since most cloud APIs reject duplicate
    /// registration.
    async fn is_attached(&self) -> Result<bool>;

    async fn attach(&self) -> Result<()>;

    /// Stop new traffic while leaving in-flight requests alone.
    async fn drain(&self) -> Result<()>;

    async fn detach(&self) -> Result<()>;
}

/// Enumerates the frontends matching this instance's configuration.
#[async_trait]
pub trait FrontendDiscoverer: Send + Sync {
    async fn discover(&self) -> Result<Vec<Box<dyn LoadBalancer>>>;
}

/// Build the discoverer selected by the frontend flags, or None when no
/// discriminator is set (the DNS daemon running in static-hostname mode).
pub async fn discoverer_from_args(
    args: &crate::settings::FrontendArgs,
    ingress_class_tag: Option<String>,
    readiness_marker: std::path::PathBuf,
) -> Result<Option<Box<dyn FrontendDiscoverer>>> {
    if let Some(label) = &args.elb_label_value {
        let discoverer = elb::ClassicElbDiscoverer::new(label.clone(), ingress_class_tag).await?;
        return Ok(Some(Box::new(discoverer)));
    }
    if !args.alb_names.is_empty() {
        let discoverer = alb::TargetGroupDiscoverer::new(args.alb_names.clone()).await?;
        return Ok(Some(Box::new(discoverer)));
    }
    if let Some(prefix) = &args.gce_instance_group_prefix {
        return Ok(Some(Box::new(gce::GceDiscoverer::new(
            gce::GceKind::InstanceGroup,
            prefix.clone(),
            readiness_marker,
        ))));
    }
    if let Some(prefix) = &args.gce_target_pool_prefix {
        return Ok(Some(Box::new(gce::GceDiscoverer::new(
            gce::GceKind::TargetPool,
            prefix.clone(),
            readiness_marker,
        ))));
    }
    if let Some(endpoint) = &args.merlin_endpoint {
        return Ok(Some(Box::new(merlin::MerlinDiscoverer::new(
            merlin::MerlinConfig {
                endpoint: endpoint.clone(),
                internal_service_id: args.merlin_internal_service_id.clone(),
                internet_facing_service_id: args.merlin_internet_facing_service_id.clone(),
                vip: args.merlin_vip.clone(),
                vip_interface: args.merlin_vip_interface.clone(),
            },
        ))));
    }
    Ok(None)
}

struct Registration {
    lb: Box<dyn LoadBalancer>,
    state: AttachmentState,
}

pub struct FrontendAttacher {
    discoverer: Box<dyn FrontendDiscoverer>,
    expected: Option<usize>,
    drain_delay: Duration,
    registrations: tokio::sync::Mutex<Vec<Registration>>,
    mapping: Arc<Mutex<FrontendMapping>>,
}

impl FrontendAttacher {
    pub fn new(
        discoverer: Box<dyn FrontendDiscoverer>,
        expected: Option<usize>,
        drain_delay: Duration,
    ) -> Self {
        Self {
            discoverer,
            expected,
            drain_delay,
            registrations: tokio::sync::Mutex::new(Vec::new()),
            mapping: Arc::new(Mutex::new(FrontendMapping::new())),
        }
    }

    /// Scheme-to-frontend details, filled during `start`. Shared with the
    /// status writer and recreated only on restart.
    pub fn frontend_mapping(&self) -> Arc<Mutex<FrontendMapping>> {
        self.mapping.clone()
    }

    fn registered_count(registrations: &[Registration]) -> usize {
        registrations
            .iter()
            .filter(|r| r.state == AttachmentState::Registered)
            .count()
    }
}

#[async_trait]
impl Updater for FrontendAttacher {
    fn name(&self) -> &'static str {
        "frontend-attacher"
    }

    async fn start(&self) -> Result<()> {
        let discovered = self.discoverer.discover().await?;
        if let Some(expected) = self.expected {
            if discovered.len() != expected {
                return Err(Error::Discovery(format!(
                    "expected {expected} frontends but discovered {}",
                    discovered.len()
                )));
            }
        }

        let mut mapping = FrontendMapping::new();
        for lb in &discovered {
            let scheme = lb.scheme();
            if let Some(existing) = mapping.insert(scheme, lb.details()) {
                warn!(
                    "multiple {scheme} frontends discovered; keeping {} for DNS details",
                    existing.dns_name
                );
                mapping.insert(scheme, existing);
            }
            info!("discovered {} frontend {}", lb.kind(), lb.identifier());
        }
        *self.mapping.lock() = mapping;

        *self.registrations.lock().await = discovered
            .into_iter()
            .map(|lb| Registration {
                lb,
                state: AttachmentState::Discovered,
            })
            .collect();
        Ok(())
    }

    /// Registration happens on the first update, which the orchestrator only
    /// reaches once the proxy is accepting connections, so frontend health
    /// checks succeed immediately.
    async fn update(&self, _entries: &[IngressEntry]) -> Result<()> {
        let mut registrations = self.registrations.lock().await;
        let mut errors = Vec::new();

        for registration in registrations.iter_mut() {
            if registration.state != AttachmentState::Discovered {
                continue;
            }
            let id = registration.lb.identifier();

            match registration.lb.is_attached().await {
                Ok(true) => {
                    info!("already registered with {id}");
                    registration.state = AttachmentState::Registered;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    errors.push(format!("{id}: {e}"));
                    continue;
                }
            }

            registration.state = AttachmentState::Registering;
            match registration.lb.attach().await {
                Ok(()) => {
                    info!("registered with {id}");
                    registration.state = AttachmentState::Registered;
                }
                Err(e) => {
                    warn!("failed to register with {id}: {e}");
                    registration.state = AttachmentState::Failed(e.to_string());
                    errors.push(format!("{id}: {e}"));
                }
            }
        }

        FRONTENDS_ATTACHED.set(Self::registered_count(&registrations) as i64);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Cloud(errors.join("; ")))
        }
    }

    /// Shed new traffic from every frontend and sit out the drain delay
    /// while the proxy keeps serving in-flight requests. A failed drain
    /// leaves the backend registered so the deregister phase still
    /// removes it.
    async fn drain(&self) -> Result<()> {
        let mut registrations = self.registrations.lock().await;
        let mut errors = Vec::new();

        let mut draining = false;
        for registration in registrations.iter_mut() {
            if registration.state != AttachmentState::Registered {
                continue;
            }
            let id = registration.lb.identifier();
            match registration.lb.drain().await {
                Ok(()) => {
                    info!("draining {id}");
                    registration.state = AttachmentState::Draining;
                    draining = true;
                }
                Err(e) => {
                    warn!("failed to drain {id}: {e}");
                    errors.push(format!("drain {id}: {e}"));
                }
            }
        }

        if draining {
            info!("waiting {:?} for in-flight requests to drain", self.drain_delay);
            tokio::time::sleep(self.drain_delay).await;
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Cloud(errors.join("; ")))
        }
    }

    /// All teardown work happens in the drain and deregister phases around
    /// the proxy's own stop, so there is nothing left to do here.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Remove the local instance from every frontend. Runs only after the
    /// proxy has quit and flushed in-flight requests; a failed
    /// deregistration does not stop the remaining ones.
    async fn deregister(&self) -> Result<()> {
        let mut registrations = self.registrations.lock().await;
        let mut errors = Vec::new();

        for registration in registrations.iter_mut() {
            let draining_or_registered = matches!(
                registration.state,
                AttachmentState::Draining | AttachmentState::Registered
            );
            if !draining_or_registered {
                continue;
            }
            let id = registration.lb.identifier();
            match registration.lb.detach().await {
                Ok(()) => {
                    info!("deregistered from {id}");
                    registration.state = AttachmentState::Deregistered;
                }
                Err(e) => {
                    warn!("failed to deregister from {id}: {e}");
                    registration.state = AttachmentState::Failed(e.to_string());
                    errors.push(format!("deregister {id}: {e}"));
                }
            }
        }

        FRONTENDS_ATTACHED.set(Self::registered_count(&registrations) as i64);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Cloud(errors.join("; ")))
        }
    }

    fn health(&self) -> UpdaterHealth {
        let failed: Vec<String> = match self.registrations.try_lock() {
            Ok(registrations) => registrations
                .iter()
                .filter_map(|r| match &r.state {
                    AttachmentState::Failed(reason) => {
                        Some(format!("{}: {reason}", r.lb.identifier()))
                    }
                    _ => None,
                })
                .collect(),
            // An update is in flight; report the last aggregate instead of
            // blocking the health endpoint.
            Err(_) => return UpdaterHealth::Ok,
        };
        if failed.is_empty() {
            UpdaterHealth::Ok
        } else {
            UpdaterHealth::Unhealthy(failed.join("; "))
        }
    }
}
