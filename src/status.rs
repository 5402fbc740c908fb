use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::entry::IngressEntry;
use crate::frontend::{FrontendDetails, FrontendMapping};
use crate::updater::{Updater, UpdaterHealth};
use crate::{Error, Result};

/// Writes the discovered frontend address into the status of every in-scope
/// ingress, so `kubectl get ingress` shows where traffic enters.
///
/// Writes are skipped when the recorded value already matches. The patch
/// carries the resourceVersion observed by the projection, so a concurrent
/// writer (a second replica of the daemon) loses with a conflict instead of
/// clobbering; conflicts surface as transient errors and the next cycle
/// retries against the fresher object.
pub struct StatusWriter {
    client: Client,
    mapping: Arc<Mutex<FrontendMapping>>,
    last_error: Mutex<Option<String>>,
}

impl StatusWriter {
    pub fn new(client: Client, mapping: Arc<Mutex<FrontendMapping>>) -> Self {
        Self {
            client,
            mapping,
            last_error: Mutex::new(None),
        }
    }
}

/// The address to publish for an entry: the frontend's DNS name, or its IP
/// when the frontend has no name (GCE, Merlin).
fn desired_address(details: &FrontendDetails) -> Option<serde_json::Value> {
    if !details.dns_name.is_empty() && details.ip.as_deref() != Some(details.dns_name.as_str()) {
        return Some(json!({ "hostname": details.dns_name }));
    }
    details.ip.as_ref().map(|ip| json!({ "ip": ip }))
}

/// Hostnames an entry should carry, sorted for stable comparison against the
/// currently recorded (also sorted) status.
fn desired_hostnames(details: &FrontendDetails) -> Vec<String> {
    let mut hostnames: Vec<String> = if !details.dns_name.is_empty() {
        vec![details.dns_name.clone()]
    } else {
        details.ip.iter().cloned().collect()
    };
    hostnames.sort();
    hostnames
}

#[async_trait]
impl Updater for StatusWriter {
    fn name(&self) -> &'static str {
        "status-writer"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, entries: &[IngressEntry]) -> Result<()> {
        // One representative entry per ingress; scheme and recorded status
        // are identical across an ingress's entries.
        let mut per_ingress: BTreeMap<(String, String), &IngressEntry> = BTreeMap::new();
        for entry in entries {
            per_ingress
                .entry((entry.namespace.clone(), entry.name.clone()))
                .or_insert(entry);
        }

        let mut errors = Vec::new();
        for ((namespace, name), entry) in per_ingress {
            let details = match self.mapping.lock().get(&entry.lb_scheme) {
                Some(details) => details.clone(),
                None => {
                    debug!(
                        "no {} frontend known, not writing status for {namespace}/{name}",
                        entry.lb_scheme
                    );
                    continue;
                }
            };

            if entry.status_hostnames == desired_hostnames(&details) {
                continue;
            }
            let Some(address) = desired_address(&details) else {
                continue;
            };

            let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
            let patch = json!({
                "metadata": { "resourceVersion": entry.resource_version },
                "status": { "loadBalancer": { "ingress": [ address ] } }
            });
            match api
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => info!("updated status of ingress {namespace}/{name}"),
                Err(e) => {
                    warn!("failed to update status of {namespace}/{name}: {e}");
                    errors.push(format!("{namespace}/{name}: {e}"));
                }
            }
        }

        if errors.is_empty() {
            *self.last_error.lock() = None;
            Ok(())
        } else {
            let joined = errors.join("; ");
            *self.last_error.lock() = Some(joined.clone());
            Err(Error::Cloud(joined))
        }
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn health(&self) -> UpdaterHealth {
        match &*self.last_error.lock() {
            None => UpdaterHealth::Ok,
            Some(reason) => UpdaterHealth::Unhealthy(format!("status writes failing: {reason}")),
        }
    }
}
