use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use feed::controller::Controller;
use feed::dns::{
    clouddns::CloudDnsProvider, route53::Route53Provider, DnsProvider, DnsUpdater,
    FrontendSource, RecordStyle,
};
use feed::frontend::discoverer_from_args;
use feed::k8s::{self, EntryDefaults};
use feed::settings::DnsSettings;
use feed::updater::Updater;
use feed::{metrics, telemetry, web};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = DnsSettings::parse();
    telemetry::init(&settings.shared.log_level);
    settings.validate().context("invalid flags")?;
    metrics::register_dns_metrics();

    let client = kube::Client::try_default()
        .await
        .context("failed to create kubernetes client")?;

    let static_hostnames =
        settings.internal_hostname.is_some() || settings.external_hostname.is_some();
    let source = if static_hostnames {
        FrontendSource::Static {
            internal: settings.internal_hostname.clone(),
            external: settings.external_hostname.clone(),
        }
    } else {
        let discoverer = discoverer_from_args(
            &settings.frontend,
            None,
            PathBuf::from("/var/run/feed/.ready"),
        )
        .await
        .context("failed to initialise frontend discovery")?
        .context("a frontend source is required")?;
        FrontendSource::Discovered(discoverer)
    };

    let (provider, style): (Box<dyn DnsProvider>, RecordStyle) =
        if let Some(zone_id) = settings.r53_hosted_zone.clone() {
            let provider =
                Route53Provider::new(zone_id, settings.cname_ttl, settings.aws_api_retries).await;
            let style = if static_hostnames {
                RecordStyle::Cname {
                    ttl: settings.cname_ttl,
                }
            } else {
                RecordStyle::AliasA
            };
            (Box::new(provider), style)
        } else {
            let zone = settings
                .clouddns_managed_zone
                .clone()
                .context("a hosted zone is required")?;
            let provider = CloudDnsProvider::new(zone, settings.cname_ttl)
                .await
                .context("failed to initialise Cloud DNS")?;
            (
                Box::new(provider),
                RecordStyle::PlainA {
                    ttl: settings.cname_ttl,
                },
            )
        };

    let dns = Arc::new(DnsUpdater::new(provider, source, style));
    let updaters: Vec<Arc<dyn Updater>> = vec![dns];

    let controller = Controller::new(
        updaters.clone(),
        settings.ingress_class.clone(),
        EntryDefaults::default(),
    );
    controller.start_updaters().await?;

    let (stores, events) = k8s::watch_cluster(client).await?;

    let (push_stop, push_stop_rx) = watch::channel(false);
    if let Some(pushgateway) = settings.shared.pushgateway.clone() {
        let interval = Duration::from_secs(settings.shared.pushgateway_interval);
        let labels = settings.shared.pushgateway_labels.clone();
        tokio::spawn(async move {
            metrics::push_loop(pushgateway, interval, "feed-dns", labels, push_stop_rx).await;
        });
    }

    let server = web::serve(settings.shared.health_port, web::State::new(updaters))?;
    let server_handle = server.handle();
    info!(
        "feed-dns serving health and metrics on port {}",
        settings.shared.health_port
    );

    tokio::select! {
        result = controller.run(stores, events) => {
            let _ = push_stop.send(true);
            server_handle.stop(true).await;
            result?;
        }
        result = server => {
            result.context("health server failed")?;
        }
    }
    Ok(())
}
