use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::net::UdpSocket;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{FrontendDetails, FrontendDiscoverer, LoadBalancer, CLOUD_API_TIMEOUT};
use crate::entry::LbScheme;
use crate::{Error, Result};

/// Configuration of the Merlin attacher: the admin endpoint, the service ids
/// per scheme, and an optional virtual IP managed on a local interface.
#[derive(Clone, Debug)]
pub struct MerlinConfig {
    pub endpoint: String,
    pub internal_service_id: Option<String>,
    pub internet_facing_service_id: Option<String>,
    pub vip: Option<String>,
    pub vip_interface: String,
}

pub struct MerlinDiscoverer {
    client: reqwest::Client,
    config: MerlinConfig,
}

impl MerlinDiscoverer {
    pub fn new(config: MerlinConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

/// Manages the virtual IP on the local interface. Adding the address needs
/// NET_ADMIN, so the add happens during discovery and surfaces privilege
/// problems at start time.
struct Vip {
    address: String,
    interface: String,
}

impl Vip {
    async fn add(address: &str, interface: &str) -> Result<Arc<Self>> {
        run_ip(&["addr", "replace", &format!("{address}/32"), "dev", interface]).await?;
        info!("added VIP {address} to {interface}");
        Ok(Arc::new(Self {
            address: address.to_string(),
            interface: interface.to_string(),
        }))
    }

    async fn remove(&self) {
        match run_ip(&[
            "addr",
            "del",
            &format!("{}/32", self.address),
            "dev",
            &self.interface,
        ])
        .await
        {
            Ok(()) => info!("removed VIP {} from {}", self.address, self.interface),
            Err(e) => warn!("failed to remove VIP {}: {e}", self.address),
        }
    }
}

async fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Discovery(format!("failed to run ip {}: {e}", args.join(" "))))?;
    if !output.status.success() {
        return Err(Error::Discovery(format!(
            "ip {} failed (NET_ADMIN required?): {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// The IP the kernel would route towards the Merlin endpoint from, which is
/// the address Merlin will health-check and forward to.
fn local_ip(endpoint: &str) -> Result<String> {
    let authority = endpoint
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let target = if authority.contains(':') {
        authority
    } else {
        format!("{authority}:80")
    };
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| Error::Discovery(format!("failed to bind probe socket: {e}")))?;
    socket
        .connect(&target)
        .map_err(|e| Error::Discovery(format!("cannot route to merlin at {target}: {e}")))?;
    let addr = socket
        .local_addr()
        .map_err(|e| Error::Discovery(format!("failed to read local address: {e}")))?;
    Ok(addr.ip().to_string())
}

#[derive(Deserialize, Debug)]
struct MerlinService {
    #[serde(default)]
    vip: Option<String>,
    #[serde(default)]
    servers: Vec<MerlinServer>,
}

#[derive(Deserialize, Debug)]
struct MerlinServer {
    ip: String,
}

#[async_trait]
impl FrontendDiscoverer for MerlinDiscoverer {
    async fn discover(&self) -> Result<Vec<Box<dyn LoadBalancer>>> {
        let instance_ip = local_ip(&self.config.endpoint)?;

        let vip = match &self.config.vip {
            Some(address) => Some(Vip::add(address, &self.config.vip_interface).await?),
            None => None,
        };

        let services = [
            (LbScheme::Internal, self.config.internal_service_id.clone()),
            (
                LbScheme::InternetFacing,
                self.config.internet_facing_service_id.clone(),
            ),
        ];

        let mut frontends: Vec<Box<dyn LoadBalancer>> = Vec::new();
        for (scheme, service_id) in services {
            let Some(service_id) = service_id else { continue };
            let url = format!(
                "{}/services/{service_id}",
                self.config.endpoint.trim_end_matches('/')
            );
            let service: MerlinService = self
                .client
                .get(&url)
                .timeout(CLOUD_API_TIMEOUT)
                .send()
                .await
                .map_err(|e| Error::Discovery(format!("merlin service {service_id}: {e}")))?
                .error_for_status()
                .map_err(|e| Error::Discovery(format!("merlin service {service_id}: {e}")))?
                .json()
                .await
                .map_err(|e| Error::Discovery(format!("merlin service {service_id}: {e}")))?;

            let service_vip = service
                .vip
                .or_else(|| self.config.vip.clone())
                .unwrap_or_default();
            info!("discovered merlin service {service_id} (vip {service_vip})");
            frontends.push(Box::new(MerlinBackend {
                client: self.client.clone(),
                url,
                service_id,
                instance_ip: instance_ip.clone(),
                scheme,
                details: FrontendDetails {
                    dns_name: service_vip.clone(),
                    hosted_zone_id: None,
                    ip: Some(service_vip),
                },
                vip: vip.clone(),
            }));
        }
        Ok(frontends)
    }
}

struct MerlinBackend {
    client: reqwest::Client,
    url: String,
    service_id: String,
    instance_ip: String,
    scheme: LbScheme,
    details: FrontendDetails,
    vip: Option<Arc<Vip>>,
}

impl MerlinBackend {
    async fn set_weight(&self, weight: u32) -> Result<()> {
        let url = format!("{}/servers/{}", self.url, self.instance_ip);
        self.client
            .put(&url)
            .json(&json!({ "weight": weight }))
            .timeout(CLOUD_API_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Cloud(format!("PUT {url}: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl LoadBalancer for MerlinBackend {
    fn identifier(&self) -> String {
        format!("merlin/{}", self.service_id)
    }

    fn kind(&self) -> &'static str {
        "merlin-service-id"
    }

    fn scheme(&self) -> LbScheme {
        self.scheme
    }

    fn details(&self) -> FrontendDetails {
        self.details.clone()
    }

    async fn is_attached(&self) -> Result<bool> {
        let service: MerlinService = self
            .client
            .get(&self.url)
            .timeout(CLOUD_API_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Cloud(format!("GET {}: {e}", self.url)))?
            .json()
            .await?;
        Ok(service.servers.iter().any(|s| s.ip == self.instance_ip))
    }

    async fn attach(&self) -> Result<()> {
        let url = format!("{}/servers", self.url);
        let result = self
            .client
            .post(&url)
            .json(&json!({ "ip": self.instance_ip, "weight": 1 }))
            .timeout(CLOUD_API_TIMEOUT)
            .send()
            .await
            .map_err(Error::from)
            .and_then(|resp| {
                resp.error_for_status()
                    .map_err(|e| Error::Cloud(format!("POST {url}: {e}")))
            });

        if let Err(e) = result {
            // Registration failed: roll the VIP back so traffic for it is
            // not blackholed on this host.
            if let Some(vip) = &self.vip {
                vip.remove().await;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn drain(&self) -> Result<()> {
        debug!("setting weight 0 on merlin service {}", self.service_id);
        self.set_weight(0).await
    }

    async fn detach(&self) -> Result<()> {
        if self.is_attached().await? {
            let url = format!("{}/servers/{}", self.url, self.instance_ip);
            self.client
                .delete(&url)
                .timeout(CLOUD_API_TIMEOUT)
                .send()
                .await?
                .error_for_status()
                .map_err(|e| Error::Cloud(format!("DELETE {url}: {e}")))?;
        }
        if let Some(vip) = &self.vip {
            vip.remove().await;
        }
        Ok(())
    }
}
