use async_trait::async_trait;
use aws_sdk_elasticloadbalancingv2::types::{LoadBalancerSchemeEnum, TargetDescription};
use aws_sdk_elasticloadbalancingv2::Client;
use tracing::debug;

use super::elb::{aws_config, imds_instance_id};
use super::{FrontendDetails, FrontendDiscoverer, LoadBalancer};
use crate::entry::LbScheme;
use crate::{Error, Result};

/// Discovers the configured target groups (behind ALBs or NLBs) and
/// registers the local EC2 instance as a target.
pub struct TargetGroupDiscoverer {
    client: Client,
    instance_id: String,
    names: Vec<String>,
}

impl TargetGroupDiscoverer {
    pub async fn new(names: Vec<String>) -> Result<Self> {
        let config = aws_config().await;
        Ok(Self {
            client: Client::new(&config),
            instance_id: imds_instance_id().await?,
            names,
        })
    }
}

#[async_trait]
impl FrontendDiscoverer for TargetGroupDiscoverer {
    async fn discover(&self) -> Result<Vec<Box<dyn LoadBalancer>>> {
        let groups = self
            .client
            .describe_target_groups()
            .set_names(Some(self.names.clone()))
            .send()
            .await
            .map_err(|e| Error::Discovery(format!("DescribeTargetGroups: {e}")))?;

        let mut frontends: Vec<Box<dyn LoadBalancer>> = Vec::new();
        for group in groups.target_groups() {
            let Some(arn) = group.target_group_arn() else {
                continue;
            };
            let name = group.target_group_name().unwrap_or(arn).to_string();
            let lb_arns = group.load_balancer_arns().to_vec();
            if lb_arns.is_empty() {
                return Err(Error::Discovery(format!(
                    "target group {name} has no associated load balancer"
                )));
            }

            let lbs = self
                .client
                .describe_load_balancers()
                .set_load_balancer_arns(Some(lb_arns))
                .send()
                .await
                .map_err(|e| Error::Discovery(format!("DescribeLoadBalancers: {e}")))?;
            let Some(lb) = lbs.load_balancers().first() else {
                return Err(Error::Discovery(format!(
                    "load balancer of target group {name} not found"
                )));
            };

            let scheme = match lb.scheme() {
                Some(LoadBalancerSchemeEnum::InternetFacing) => LbScheme::InternetFacing,
                _ => LbScheme::Internal,
            };
            frontends.push(Box::new(TargetGroupBackend {
                client: self.client.clone(),
                instance_id: self.instance_id.clone(),
                arn: arn.to_string(),
                name,
                scheme,
                details: FrontendDetails {
                    dns_name: lb.dns_name().unwrap_or_default().to_string(),
                    hosted_zone_id: lb.canonical_hosted_zone_id().map(str::to_string),
                    ip: None,
                },
            }));
        }
        Ok(frontends)
    }
}

struct TargetGroupBackend {
    client: Client,
    instance_id: String,
    arn: String,
    name: String,
    scheme: LbScheme,
    details: FrontendDetails,
}

impl TargetGroupBackend {
    fn target(&self) -> Result<TargetDescription> {
        Ok(TargetDescription::builder()
            .id(&self.instance_id)
            .build())
    }
}

#[async_trait]
impl LoadBalancer for TargetGroupBackend {
    fn identifier(&self) -> String {
        format!("target-group/{}", self.name)
    }

    fn kind(&self) -> &'static str {
        "network-lb"
    }

    fn scheme(&self) -> LbScheme {
        self.scheme
    }

    fn details(&self) -> FrontendDetails {
        self.details.clone()
    }

    async fn is_attached(&self) -> Result<bool> {
        let health = self
            .client
            .describe_target_health()
            .target_group_arn(&self.arn)
            .send()
            .await
            .map_err(|e| Error::Cloud(format!("DescribeTargetHealth {}: {e}", self.name)))?;
        let attached = health
            .target_health_descriptions()
            .iter()
            .filter_map(|d| d.target())
            .any(|t| t.id() == Some(self.instance_id.as_str()));
        Ok(attached)
    }

    async fn attach(&self) -> Result<()> {
        self.client
            .register_targets()
            .target_group_arn(&self.arn)
            .targets(self.target()?)
            .send()
            .await
            .map_err(|e| Error::Cloud(format!("RegisterTargets {}: {e}", self.name)))?;
        Ok(())
    }

    /// Deregistering a target moves it to `draining`: the frontend stops
    /// routing new connections while in-flight ones complete, which is the
    /// weight-zero primitive for target groups.
    async fn drain(&self) -> Result<()> {
        self.client
            .deregister_targets()
            .target_group_arn(&self.arn)
            .targets(self.target()?)
            .send()
            .await
            .map_err(|e| Error::Cloud(format!("DeregisterTargets {}: {e}", self.name)))?;
        Ok(())
    }

    async fn detach(&self) -> Result<()> {
        if !self.is_attached().await? {
            debug!("instance already absent from target group {}", self.name);
            return Ok(());
        }
        self.drain().await
    }
}
