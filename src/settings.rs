use clap::{Args, Parser};
use std::time::Duration;

use crate::{Error, Result};

/// Flags shared by both daemons: logging and the metrics surface.
#[derive(Args, Debug, Clone)]
pub struct SharedArgs {
    /// Default log level, overridable with RUST_LOG
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Port for the /health and /metrics endpoints
    #[arg(long, default_value_t = 12082)]
    pub health_port: u16,

    /// Prometheus pushgateway base URL; pushing is disabled when unset
    #[arg(long)]
    pub pushgateway: Option<String>,

    /// Seconds between pushgateway pushes
    #[arg(long, default_value_t = 60)]
    pub pushgateway_interval: u64,

    /// Extra pushgateway grouping label, as name=value; repeatable
    #[arg(long = "pushgateway-label", value_parser = parse_label)]
    pub pushgateway_labels: Vec<(String, String)>,
}

fn parse_label(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() && !value.is_empty() => {
            Ok((name.to_string(), value.to_string()))
        }
        _ => Err(format!("expected name=value, got {raw:?}")),
    }
}

/// Frontend selection flags, shared between the attacher (feed-ingress) and
/// the frontend resolver (feed-dns). Exactly one discriminator must be set.
#[derive(Args, Debug, Clone, Default)]
pub struct FrontendArgs {
    /// Value of the sky.uk/KubernetesClusterFrontend tag identifying this
    /// cluster's classic ELBs
    #[arg(long)]
    pub elb_label_value: Option<String>,

    /// Target group names to register with; repeatable
    #[arg(long = "alb-names", value_delimiter = ',')]
    pub alb_names: Vec<String>,

    /// GCE instance group name prefix to attach to
    #[arg(long)]
    pub gce_instance_group_prefix: Option<String>,

    /// GCE target pool name prefix to attach to
    #[arg(long)]
    pub gce_target_pool_prefix: Option<String>,

    /// Merlin admin endpoint, e.g. http://merlin:4567
    #[arg(long)]
    pub merlin_endpoint: Option<String>,

    /// Merlin service id backing internal traffic
    #[arg(long)]
    pub merlin_internal_service_id: Option<String>,

    /// Merlin service id backing internet-facing traffic
    #[arg(long)]
    pub merlin_internet_facing_service_id: Option<String>,

    /// Virtual IP to add to the local interface for Merlin traffic
    #[arg(long)]
    pub merlin_vip: Option<String>,

    /// Interface the Merlin VIP is added to
    #[arg(long, default_value = "lo")]
    pub merlin_vip_interface: String,

    /// Fail startup unless discovery finds exactly this many frontends
    #[arg(long)]
    pub expected_frontends: Option<usize>,
}

impl FrontendArgs {
    /// Count the discriminators the operator supplied.
    pub fn discriminators(&self) -> usize {
        [
            self.elb_label_value.is_some(),
            !self.alb_names.is_empty(),
            self.gce_instance_group_prefix.is_some() || self.gce_target_pool_prefix.is_some(),
            self.merlin_endpoint.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    pub fn validate(&self) -> Result<()> {
        if self.merlin_endpoint.is_some()
            && self.merlin_internal_service_id.is_none()
            && self.merlin_internet_facing_service_id.is_none()
        {
            return Err(Error::Config(
                "--merlin-endpoint requires at least one merlin service id".to_string(),
            ));
        }
        Ok(())
    }
}

/// The traffic-plane daemon.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "feed-ingress",
    about = "Attaches the local nginx to cloud load balancers and keeps its config in step with ingress resources",
    version
)]
pub struct IngressSettings {
    #[command(flatten)]
    pub shared: SharedArgs,

    #[command(flatten)]
    pub frontend: FrontendArgs,

    /// Port nginx serves ingress traffic on
    #[arg(long, default_value_t = 8080)]
    pub ingress_port: u16,

    /// Port nginx serves its private status endpoint on
    #[arg(long, default_value_t = 8090)]
    pub nginx_status_port: u16,

    /// Ingress class annotation value this controller manages
    #[arg(long)]
    pub ingress_class: String,

    /// Seconds to wait after draining before deregistering
    #[arg(long, default_value_t = 60)]
    pub drain_delay: u64,

    /// Seconds between checks for a required nginx reload; successive
    /// updates within one period coalesce into one reload
    #[arg(long, default_value_t = 30)]
    pub update_period: u64,

    /// Path of the nginx binary
    #[arg(long, default_value = "/usr/sbin/nginx")]
    pub nginx_binary: String,

    /// Directory holding nginx.conf and the rendered template
    #[arg(long, default_value = "/etc/nginx")]
    pub nginx_workdir: String,

    /// nginx worker process count
    #[arg(long, default_value_t = 4)]
    pub nginx_workers: u64,

    /// Client-facing keepalive seconds
    #[arg(long, default_value_t = 65)]
    pub nginx_keepalive_seconds: u64,

    /// Default upstream connect timeout, overridable per ingress
    #[arg(long, default_value_t = 1)]
    pub nginx_backend_connect_timeout_seconds: u64,

    /// Default upstream read/send timeout, overridable per ingress
    #[arg(long, default_value_t = 60)]
    pub nginx_backend_timeout_seconds: u64,

    /// Keepalive connection pool size per upstream
    #[arg(long, default_value_t = 512)]
    pub nginx_backend_keepalive_count: u64,

    /// CIDRs allowed to set the PROXY protocol header; repeatable
    #[arg(long = "nginx-trusted-frontends", value_delimiter = ',')]
    pub nginx_trusted_frontends: Vec<String>,

    /// Expect the PROXY protocol on the ingress listener
    #[arg(long, default_value_t = false)]
    pub nginx_proxy_protocol: bool,

    /// Path to a combined certificate and key; enables the TLS listener
    #[arg(long)]
    pub ssl_path: Option<String>,

    /// Write an access log
    #[arg(long, default_value_t = false)]
    pub access_log: bool,

    /// Directory the access log is written to
    #[arg(long, default_value = "/var/log/nginx")]
    pub access_log_dir: String,

    /// Ingress class value also required on the frontend tag, when set
    #[arg(long)]
    pub elb_ingress_class_tag: Option<String>,
}

impl IngressSettings {
    pub fn validate(&self) -> Result<()> {
        if self.ingress_class.is_empty() {
            return Err(Error::Config("--ingress-class must not be empty".to_string()));
        }
        match self.frontend.discriminators() {
            0 => Err(Error::Config(
                "one of --elb-label-value, --alb-names, --gce-instance-group-prefix, \
                 --gce-target-pool-prefix or --merlin-endpoint is required"
                    .to_string(),
            )),
            1 => self.frontend.validate(),
            _ => Err(Error::Config(
                "only one frontend kind may be configured".to_string(),
            )),
        }
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_secs(self.drain_delay)
    }

    pub fn update_period(&self) -> Duration {
        Duration::from_secs(self.update_period)
    }
}

/// The DNS daemon.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "feed-dns",
    about = "Reconciles a hosted zone against the ingress hostnames of the cluster",
    version
)]
pub struct DnsSettings {
    #[command(flatten)]
    pub shared: SharedArgs,

    #[command(flatten)]
    pub frontend: FrontendArgs,

    /// Ingress class annotation value this controller manages
    #[arg(long)]
    pub ingress_class: String,

    /// Route 53 hosted zone id to reconcile
    #[arg(long)]
    pub r53_hosted_zone: Option<String>,

    /// Cloud DNS managed zone name to reconcile
    #[arg(long)]
    pub clouddns_managed_zone: Option<String>,

    /// Static hostname backing internal ingresses (CNAME mode)
    #[arg(long)]
    pub internal_hostname: Option<String>,

    /// Static hostname backing internet-facing ingresses (CNAME mode)
    #[arg(long)]
    pub external_hostname: Option<String>,

    /// TTL for CNAME records created in static-hostname mode
    #[arg(long, default_value_t = 300)]
    pub cname_ttl: i64,

    /// Retry budget for AWS API calls
    #[arg(long, default_value_t = 3)]
    pub aws_api_retries: u32,
}

impl DnsSettings {
    pub fn validate(&self) -> Result<()> {
        if self.ingress_class.is_empty() {
            return Err(Error::Config("--ingress-class must not be empty".to_string()));
        }
        match (&self.r53_hosted_zone, &self.clouddns_managed_zone) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "--r53-hosted-zone and --clouddns-managed-zone are mutually exclusive"
                        .to_string(),
                ))
            }
            (None, None) => {
                return Err(Error::Config(
                    "one of --r53-hosted-zone or --clouddns-managed-zone is required".to_string(),
                ))
            }
            _ => {}
        }

        let static_hostnames =
            self.internal_hostname.is_some() || self.external_hostname.is_some();
        if static_hostnames && self.frontend.discriminators() > 0 {
            return Err(Error::Config(
                "static hostnames and a frontend discriminator are mutually exclusive".to_string(),
            ));
        }
        if !static_hostnames && self.frontend.discriminators() == 0 {
            return Err(Error::Config(
                "either static hostnames or a frontend discriminator is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingress_requires_exactly_one_frontend_kind() {
        for (args, ok) in [
            (vec!["feed-ingress", "--ingress-class", "prod"], false),
            (
                vec![
                    "feed-ingress",
                    "--ingress-class",
                    "prod",
                    "--elb-label-value",
                    "cluster-a",
                ],
                true,
            ),
            (
                vec![
                    "feed-ingress",
                    "--ingress-class",
                    "prod",
                    "--elb-label-value",
                    "cluster-a",
                    "--merlin-endpoint",
                    "http://merlin:4567",
                    "--merlin-internal-service-id",
                    "svc-1",
                ],
                false,
            ),
            (
                vec![
                    "feed-ingress",
                    "--ingress-class",
                    "prod",
                    "--alb-names",
                    "tg-a,tg-b",
                ],
                true,
            ),
            (
                vec![
                    "feed-ingress",
                    "--ingress-class",
                    "prod",
                    "--merlin-endpoint",
                    "http://merlin:4567",
                ],
                false,
            ),
        ] {
            let settings = IngressSettings::parse_from(&args);
            assert_eq!(settings.validate().is_ok(), ok, "{args:?}");
        }
    }

    #[test]
    fn dns_requires_one_zone_and_one_frontend_source() {
        for (args, ok) in [
            (
                vec![
                    "feed-dns",
                    "--ingress-class",
                    "prod",
                    "--r53-hosted-zone",
                    "Z123",
                    "--elb-label-value",
                    "cluster-a",
                ],
                true,
            ),
            (
                vec![
                    "feed-dns",
                    "--ingress-class",
                    "prod",
                    "--r53-hosted-zone",
                    "Z123",
                    "--internal-hostname",
                    "internal-lb.example.com",
                ],
                true,
            ),
            (
                vec!["feed-dns", "--ingress-class", "prod", "--r53-hosted-zone", "Z123"],
                false,
            ),
            (
                vec![
                    "feed-dns",
                    "--ingress-class",
                    "prod",
                    "--r53-hosted-zone",
                    "Z123",
                    "--clouddns-managed-zone",
                    "prod-zone",
                    "--elb-label-value",
                    "cluster-a",
                ],
                false,
            ),
            (
                vec![
                    "feed-dns",
                    "--ingress-class",
                    "prod",
                    "--r53-hosted-zone",
                    "Z123",
                    "--internal-hostname",
                    "internal-lb.example.com",
                    "--elb-label-value",
                    "cluster-a",
                ],
                false,
            ),
        ] {
            let settings = DnsSettings::parse_from(&args);
            assert_eq!(settings.validate().is_ok(), ok, "{args:?}");
        }
    }

    #[test]
    fn pushgateway_labels_parse_as_pairs() {
        let settings = IngressSettings::parse_from([
            "feed-ingress",
            "--ingress-class",
            "prod",
            "--elb-label-value",
            "cluster-a",
            "--pushgateway-label",
            "env=prod",
            "--pushgateway-label",
            "region=eu-west-1",
        ]);
        assert_eq!(
            settings.shared.pushgateway_labels,
            vec![
                ("env".to_string(), "prod".to_string()),
                ("region".to_string(), "eu-west-1".to_string())
            ]
        );
    }
}
