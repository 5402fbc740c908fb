use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::SdkConfig;
use aws_sdk_elasticloadbalancing::types::Instance;
use aws_sdk_elasticloadbalancing::Client;
use tracing::{debug, info};

use super::{
    FrontendDetails, FrontendDiscoverer, LoadBalancer, CLOUD_API_TIMEOUT, FRONTEND_TAG,
    INGRESS_CLASS_TAG,
};
use crate::entry::LbScheme;
use crate::{Error, Result};

/// Shared AWS configuration: every call carries the cloud API deadline.
pub(crate) async fn aws_config() -> SdkConfig {
    aws_config::defaults(aws_config::BehaviorVersion::latest())
        .timeout_config(
            TimeoutConfig::builder()
                .operation_timeout(CLOUD_API_TIMEOUT)
                .build(),
        )
        .load()
        .await
}

/// Tag batch limit of the DescribeTags API.
const DESCRIBE_TAGS_BATCH: usize = 20;

/// Discovers classic ELBs tagged for this cluster and registers the local
/// EC2 instance with them.
pub struct ClassicElbDiscoverer {
    client: Client,
    instance_id: String,
    cluster_label: String,
    ingress_class_label: Option<String>,
}

impl ClassicElbDiscoverer {
    pub async fn new(cluster_label: String, ingress_class_label: Option<String>) -> Result<Self> {
        let config = aws_config().await;
        Ok(Self {
            client: Client::new(&config),
            instance_id: imds_instance_id().await?,
            cluster_label,
            ingress_class_label,
        })
    }
}

/// The local instance id, from the EC2 instance metadata service.
pub(crate) async fn imds_instance_id() -> Result<String> {
    let imds = aws_config::imds::Client::builder().build();
    let instance_id = imds
        .get("/latest/meta-data/instance-id")
        .await
        .map_err(|e| Error::Discovery(format!("failed to query instance metadata: {e}")))?;
    Ok(instance_id.into())
}

#[async_trait]
impl FrontendDiscoverer for ClassicElbDiscoverer {
    async fn discover(&self) -> Result<Vec<Box<dyn LoadBalancer>>> {
        let mut descriptions = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let resp = self
                .client
                .describe_load_balancers()
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| Error::Discovery(format!("DescribeLoadBalancers: {e}")))?;
            descriptions.extend(resp.load_balancer_descriptions().to_vec());
            marker = resp.next_marker().map(str::to_string);
            if marker.is_none() {
                break;
            }
        }

        let mut frontends: Vec<Box<dyn LoadBalancer>> = Vec::new();
        for chunk in descriptions.chunks(DESCRIBE_TAGS_BATCH) {
            let names: Vec<String> = chunk
                .iter()
                .filter_map(|d| d.load_balancer_name().map(str::to_string))
                .collect();
            if names.is_empty() {
                continue;
            }
            let tags = self
                .client
                .describe_tags()
                .set_load_balancer_names(Some(names))
                .send()
                .await
                .map_err(|e| Error::Discovery(format!("DescribeTags: {e}")))?;

            for description in tags.tag_descriptions() {
                let Some(name) = description.load_balancer_name() else {
                    continue;
                };
                let tag = |key: &str| {
                    description
                        .tags()
                        .iter()
                        .find(|t| t.key() == key)
                        .and_then(|t| t.value())
                };
                if tag(FRONTEND_TAG) != Some(self.cluster_label.as_str()) {
                    debug!("ignoring untagged load balancer {name}");
                    continue;
                }
                if let Some(class) = &self.ingress_class_label {
                    if tag(INGRESS_CLASS_TAG) != Some(class.as_str()) {
                        debug!("ignoring load balancer {name} for another ingress class");
                        continue;
                    }
                }
                let Some(lb) = chunk.iter().find(|d| d.load_balancer_name() == Some(name))
                else {
                    continue;
                };
                let scheme = match lb.scheme() {
                    Some("internet-facing") => LbScheme::InternetFacing,
                    _ => LbScheme::Internal,
                };
                frontends.push(Box::new(ClassicElbBackend {
                    client: self.client.clone(),
                    instance_id: self.instance_id.clone(),
                    lb_name: name.to_string(),
                    scheme,
                    details: FrontendDetails {
                        dns_name: lb.dns_name().unwrap_or_default().to_string(),
                        hosted_zone_id: lb
                            .canonical_hosted_zone_name_id()
                            .map(str::to_string),
                        ip: None,
                    },
                }));
            }
        }
        Ok(frontends)
    }
}

struct ClassicElbBackend {
    client: Client,
    instance_id: String,
    lb_name: String,
    scheme: LbScheme,
    details: FrontendDetails,
}

#[async_trait]
impl LoadBalancer for ClassicElbBackend {
    fn identifier(&self) -> String {
        format!("elb/{}", self.lb_name)
    }

    fn kind(&self) -> &'static str {
        "classic-lb"
    }

    fn scheme(&self) -> LbScheme {
        self.scheme
    }

    fn details(&self) -> FrontendDetails {
        self.details.clone()
    }

    async fn is_attached(&self) -> Result<bool> {
        let resp = self
            .client
            .describe_load_balancers()
            .load_balancer_names(&self.lb_name)
            .send()
            .await
            .map_err(|e| Error::Cloud(format!("DescribeLoadBalancers {}: {e}", self.lb_name)))?;
        let attached = resp
            .load_balancer_descriptions()
            .iter()
            .flat_map(|d| d.instances())
            .any(|i| i.instance_id() == Some(self.instance_id.as_str()));
        Ok(attached)
    }

    async fn attach(&self) -> Result<()> {
        self.client
            .register_instances_with_load_balancer()
            .load_balancer_name(&self.lb_name)
            .instances(Instance::builder().instance_id(&self.instance_id).build())
            .send()
            .await
            .map_err(|e| Error::Cloud(format!("RegisterInstances {}: {e}", self.lb_name)))?;
        Ok(())
    }

    /// Classic ELBs have no per-backend weight: stopping new traffic is the
    /// deregistration itself, with in-flight requests protected by the ELB's
    /// connection-draining attribute.
    async fn drain(&self) -> Result<()> {
        info!(
            "elb {} relies on connection draining; deregistering at drain time",
            self.lb_name
        );
        self.detach().await
    }

    async fn detach(&self) -> Result<()> {
        if !self.is_attached().await? {
            debug!("instance already absent from {}", self.lb_name);
            return Ok(());
        }
        self.client
            .deregister_instances_from_load_balancer()
            .load_balancer_name(&self.lb_name)
            .instances(Instance::builder().instance_id(&self.instance_id).build())
            .send()
            .await
            .map_err(|e| Error::Cloud(format!("DeregisterInstances {}: {e}", self.lb_name)))?;
        Ok(())
    }
}
