use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::{FrontendDetails, FrontendDiscoverer, LoadBalancer, CLOUD_API_TIMEOUT};
use crate::entry::LbScheme;
use crate::{Error, Result};

const METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";
const COMPUTE_BASE: &str = "https://compute.googleapis.com/compute/v1";

/// Which attachment primitive the discovered pools use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GceKind {
    InstanceGroup,
    TargetPool,
}

/// Discovers GCE instance groups or target pools by name prefix and
/// attaches the local instance.
///
/// Target pools have no weight primitive; draining is done by deleting the
/// readiness marker file their HTTP health check serves, which flips the
/// instance unhealthy and stops new traffic.
pub struct GceDiscoverer {
    client: reqwest::Client,
    kind: GceKind,
    name_prefix: String,
    readiness_marker: PathBuf,
}

impl GceDiscoverer {
    pub fn new(kind: GceKind, name_prefix: String, readiness_marker: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            kind,
            name_prefix,
            readiness_marker,
        }
    }
}

#[derive(Clone)]
struct GceContext {
    client: reqwest::Client,
    project: String,
    zone: String,
    region: String,
    instance_url: String,
}

impl GceContext {
    async fn load(client: &reqwest::Client) -> Result<Self> {
        let project = metadata(client, "project/project-id").await?;
        // e.g. "projects/1234/zones/europe-west1-b"
        let zone_path = metadata(client, "instance/zone").await?;
        let zone = zone_path
            .rsplit('/')
            .next()
            .unwrap_or(&zone_path)
            .to_string();
        let region = zone
            .rsplit_once('-')
            .map(|(region, _)| region.to_string())
            .ok_or_else(|| Error::Discovery(format!("malformed zone {zone:?}")))?;
        let instance = metadata(client, "instance/name").await?;
        let instance_url = format!(
            "{COMPUTE_BASE}/projects/{project}/zones/{zone}/instances/{instance}"
        );
        Ok(Self {
            client: client.clone(),
            project,
            zone,
            region,
            instance_url,
        })
    }

    async fn token(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct Token {
            access_token: String,
        }
        let token: Token = self
            .client
            .get(format!(
                "{METADATA_BASE}/instance/service-accounts/default/token"
            ))
            .header("Metadata-Flavor", "Google")
            .timeout(CLOUD_API_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(token.access_token)
    }

    async fn get(&self, url: &str) -> Result<serde_json::Value> {
        let token = self.token().await?;
        let value = self
            .client
            .get(url)
            .bearer_auth(token)
            .timeout(CLOUD_API_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Cloud(format!("GET {url}: {e}")))?
            .json()
            .await?;
        Ok(value)
    }

    async fn post(&self, url: &str, body: serde_json::Value) -> Result<()> {
        let token = self.token().await?;
        self.client
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .timeout(CLOUD_API_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Cloud(format!("POST {url}: {e}")))?;
        Ok(())
    }
}

async fn metadata(client: &reqwest::Client, path: &str) -> Result<String> {
    let value = client
        .get(format!("{METADATA_BASE}/{path}"))
        .header("Metadata-Flavor", "Google")
        .timeout(CLOUD_API_TIMEOUT)
        .send()
        .await
        .map_err(|e| Error::Discovery(format!("metadata {path}: {e}")))?
        .error_for_status()
        .map_err(|e| Error::Discovery(format!("metadata {path}: {e}")))?
        .text()
        .await
        .map_err(|e| Error::Discovery(format!("metadata {path}: {e}")))?;
    Ok(value.trim().to_string())
}

#[derive(Deserialize)]
struct NamedItems {
    #[serde(default)]
    items: Vec<NamedItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct NamedItem {
    name: String,
}

#[derive(Deserialize)]
struct ForwardingRules {
    #[serde(default)]
    items: Vec<ForwardingRule>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ForwardingRule {
    name: String,
    #[serde(rename = "IPAddress")]
    ip_address: Option<String>,
    #[serde(rename = "loadBalancingScheme")]
    load_balancing_scheme: Option<String>,
}

async fn list_names(ctx: &GceContext, base_url: &str, prefix: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let url = match &page_token {
            Some(token) => format!("{base_url}?pageToken={token}"),
            None => base_url.to_string(),
        };
        let page: NamedItems = serde_json::from_value(ctx.get(&url).await?)?;
        names.extend(
            page.items
                .into_iter()
                .map(|i| i.name)
                .filter(|n| n.starts_with(prefix)),
        );
        page_token = page.next_page_token;
        if page_token.is_none() {
            break;
        }
    }
    Ok(names)
}

/// The frontend details of a pool come from the forwarding rule sharing its
/// name prefix; GCE frontends are addressed by IP rather than DNS name.
async fn frontend_details(
    ctx: &GceContext,
    prefix: &str,
) -> Result<(LbScheme, FrontendDetails)> {
    let base_url = format!(
        "{COMPUTE_BASE}/projects/{}/regions/{}/forwardingRules",
        ctx.project, ctx.region
    );
    let mut page_token: Option<String> = None;
    loop {
        let url = match &page_token {
            Some(token) => format!("{base_url}?pageToken={token}"),
            None => base_url.clone(),
        };
        let page: ForwardingRules = serde_json::from_value(ctx.get(&url).await?)?;
        for rule in page.items {
            if !rule.name.starts_with(prefix) {
                continue;
            }
            let scheme = match rule.load_balancing_scheme.as_deref() {
                Some("INTERNAL") | Some("INTERNAL_MANAGED") => LbScheme::Internal,
                _ => LbScheme::InternetFacing,
            };
            let ip = rule.ip_address.unwrap_or_default();
            return Ok((
                scheme,
                FrontendDetails {
                    dns_name: ip.clone(),
                    hosted_zone_id: None,
                    ip: Some(ip),
                },
            ));
        }
        page_token = page.next_page_token;
        if page_token.is_none() {
            break;
        }
    }
    Err(Error::Discovery(format!(
        "no forwarding rule matching prefix {prefix:?}"
    )))
}

#[async_trait]
impl FrontendDiscoverer for GceDiscoverer {
    async fn discover(&self) -> Result<Vec<Box<dyn LoadBalancer>>> {
        let ctx = GceContext::load(&self.client).await?;
        let (scheme, details) = frontend_details(&ctx, &self.name_prefix).await?;

        let base_url = match self.kind {
            GceKind::InstanceGroup => format!(
                "{COMPUTE_BASE}/projects/{}/zones/{}/instanceGroups",
                ctx.project, ctx.zone
            ),
            GceKind::TargetPool => format!(
                "{COMPUTE_BASE}/projects/{}/regions/{}/targetPools",
                ctx.project, ctx.region
            ),
        };
        let names = list_names(&ctx, &base_url, &self.name_prefix).await?;

        let mut frontends: Vec<Box<dyn LoadBalancer>> = Vec::new();
        for name in names {
            info!("discovered {:?} {name}", self.kind);
            frontends.push(Box::new(GceBackend {
                ctx: ctx.clone(),
                kind: self.kind,
                url: format!("{base_url}/{name}"),
                name,
                scheme,
                details: details.clone(),
                readiness_marker: self.readiness_marker.clone(),
            }));
        }
        Ok(frontends)
    }
}

struct GceBackend {
    ctx: GceContext,
    kind: GceKind,
    url: String,
    name: String,
    scheme: LbScheme,
    details: FrontendDetails,
    readiness_marker: PathBuf,
}

#[derive(Deserialize)]
struct InstanceList {
    #[serde(default)]
    items: Vec<InstanceRef>,
}

#[derive(Deserialize)]
struct InstanceRef {
    instance: String,
}

impl GceBackend {
    fn instances_body(&self) -> serde_json::Value {
        json!({ "instances": [{ "instance": self.ctx.instance_url }] })
    }
}

#[async_trait]
impl LoadBalancer for GceBackend {
    fn identifier(&self) -> String {
        match self.kind {
            GceKind::InstanceGroup => format!("instance-group/{}", self.name),
            GceKind::TargetPool => format!("target-pool/{}", self.name),
        }
    }

    fn kind(&self) -> &'static str {
        match self.kind {
            GceKind::InstanceGroup => "instance-group",
            GceKind::TargetPool => "target-pool",
        }
    }

    fn scheme(&self) -> LbScheme {
        self.scheme
    }

    fn details(&self) -> FrontendDetails {
        self.details.clone()
    }

    async fn is_attached(&self) -> Result<bool> {
        let members: InstanceList = match self.kind {
            GceKind::InstanceGroup => {
                // listInstances is a POST in the compute API.
                let token = self.ctx.token().await?;
                let url = format!("{}/listInstances", self.url);
                let value = self
                    .ctx
                    .client
                    .post(&url)
                    .bearer_auth(token)
                    .json(&json!({}))
                    .timeout(CLOUD_API_TIMEOUT)
                    .send()
                    .await?
                    .error_for_status()
                    .map_err(|e| Error::Cloud(format!("POST {url}: {e}")))?
                    .json()
                    .await?;
                value
            }
            GceKind::TargetPool => {
                #[derive(Deserialize)]
                struct TargetPool {
                    #[serde(default)]
                    instances: Vec<String>,
                }
                let pool: TargetPool = serde_json::from_value(self.ctx.get(&self.url).await?)?;
                InstanceList {
                    items: pool
                        .instances
                        .into_iter()
                        .map(|instance| InstanceRef { instance })
                        .collect(),
                }
            }
        };
        Ok(members
            .items
            .iter()
            .any(|i| i.instance == self.ctx.instance_url))
    }

    async fn attach(&self) -> Result<()> {
        let action = match self.kind {
            GceKind::InstanceGroup => "addInstances",
            GceKind::TargetPool => "addInstance",
        };
        self.ctx
            .post(&format!("{}/{action}", self.url), self.instances_body())
            .await?;

        if self.kind == GceKind::TargetPool {
            // (Re)create the readiness marker so the pool's health check
            // starts passing.
            tokio::fs::write(&self.readiness_marker, b"ready\n").await?;
        }
        Ok(())
    }

    async fn drain(&self) -> Result<()> {
        match self.kind {
            GceKind::InstanceGroup => {
                // Removal stops the backend service sending new traffic.
                let url = format!("{}/removeInstances", self.url);
                self.ctx.post(&url, self.instances_body()).await
            }
            GceKind::TargetPool => {
                debug!(
                    "removing readiness marker {} to fail the pool health check",
                    self.readiness_marker.display()
                );
                match tokio::fs::remove_file(&self.readiness_marker).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn detach(&self) -> Result<()> {
        if !self.is_attached().await? {
            debug!("instance already absent from {}", self.identifier());
            return Ok(());
        }
        let action = match self.kind {
            GceKind::InstanceGroup => "removeInstances",
            GceKind::TargetPool => "removeInstance",
        };
        if let Err(e) = self
            .ctx
            .post(&format!("{}/{action}", self.url), self.instances_body())
            .await
        {
            warn!("failed to remove instance from {}: {e}", self.identifier());
            return Err(e);
        }
        Ok(())
    }
}
