use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use feed::controller::Controller;
use feed::frontend::{discoverer_from_args, FrontendAttacher};
use feed::k8s::{self, EntryDefaults};
use feed::nginx::{NginxConfig, NginxSupervisor};
use feed::settings::IngressSettings;
use feed::status::StatusWriter;
use feed::updater::Updater;
use feed::{metrics, telemetry, web};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = IngressSettings::parse();
    telemetry::init(&settings.shared.log_level);
    settings.validate().context("invalid flags")?;
    metrics::register_ingress_metrics();

    let client = kube::Client::try_default()
        .await
        .context("failed to create kubernetes client")?;

    let readiness_marker = PathBuf::from(&settings.nginx_workdir).join(".ready");
    let discoverer = discoverer_from_args(
        &settings.frontend,
        settings.elb_ingress_class_tag.clone(),
        readiness_marker,
    )
    .await
    .context("failed to initialise frontend discovery")?
    .context("a frontend kind is required")?;

    let attacher = Arc::new(FrontendAttacher::new(
        discoverer,
        settings.frontend.expected_frontends,
        settings.drain_delay(),
    ));
    let frontend_mapping = attacher.frontend_mapping();

    let nginx = Arc::new(NginxSupervisor::new(NginxConfig::from_settings(&settings))?);
    let status = Arc::new(StatusWriter::new(client.clone(), frontend_mapping));

    // Pipeline order matters: the attacher only registers once nginx is
    // serving, and the status writer only reports known frontends.
    let updaters: Vec<Arc<dyn Updater>> = vec![nginx, attacher, status];

    let defaults = EntryDefaults {
        backend_connect_timeout_seconds: settings.nginx_backend_connect_timeout_seconds,
        backend_timeout_seconds: settings.nginx_backend_timeout_seconds,
        ..EntryDefaults::default()
    };
    let controller = Controller::new(
        updaters.clone(),
        settings.ingress_class.clone(),
        defaults,
    );
    controller.start_updaters().await?;

    let (stores, events) = k8s::watch_cluster(client).await?;

    let (push_stop, push_stop_rx) = watch::channel(false);
    if let Some(pushgateway) = settings.shared.pushgateway.clone() {
        let interval = Duration::from_secs(settings.shared.pushgateway_interval);
        let labels = settings.shared.pushgateway_labels.clone();
        tokio::spawn(async move {
            metrics::push_loop(pushgateway, interval, "feed-ingress", labels, push_stop_rx).await;
        });
    }

    let server = web::serve(settings.shared.health_port, web::State::new(updaters))?;
    let server_handle = server.handle();
    info!(
        "feed-ingress serving health and metrics on port {}",
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
