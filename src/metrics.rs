use once_cell::sync::Lazy;
use prometheus::{
    opts, Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder,
};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

// The process-wide registry. Metric statics are created eagerly but only
// appear on the exposition surface once the relevant register_* call has
// run; tests exercise the statics without registering them.
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        opts!(
            "feed_ingress_updates_total",
            "Update cycles dispatched per updater, by result"
        ),
        &["updater", "result"],
    )
    .expect("metric creation")
});

pub static INGRESS_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "feed_ingress_entries",
        "Ingress entries in the last projected snapshot",
    )
    .expect("metric creation")
});

pub static SKIPPED_ENTRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        opts!(
            "feed_ingress_skipped_entries_total",
            "Entries dropped during projection or rendering, by reason"
        ),
        &["reason"],
    )
    .expect("metric creation")
});

pub static NGINX_RELOADS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "feed_ingress_nginx_reloads_total",
        "Reload signals delivered to the nginx master",
    )
    .expect("metric creation")
});

pub static NGINX_CONNECTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        opts!(
            "feed_ingress_nginx_connections",
            "Current nginx connections by state"
        ),
        &["state"],
    )
    .expect("metric creation")
});

pub static NGINX_CONNECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        opts!(
            "feed_ingress_nginx_connections_total",
            "Accepted, handled and requested connection totals"
        ),
        &["type"],
    )
    .expect("metric creation")
});

pub static NGINX_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        opts!(
            "feed_ingress_nginx_requests_total",
            "Requests per ingress host and path, by response class"
        ),
        &["host", "path", "code"],
    )
    .expect("metric creation")
});

pub static NGINX_BYTES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        opts!(
            "feed_ingress_nginx_bytes_total",
            "Bytes transferred per ingress host and path"
        ),
        &["host", "path", "direction"],
    )
    .expect("metric creation")
});

pub static NGINX_UPSTREAM_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        opts!(
            "feed_ingress_nginx_upstream_requests_total",
            "Requests per upstream and endpoint, by response class"
        ),
        &["name", "endpoint", "code"],
    )
    .expect("metric creation")
});

pub static FRONTENDS_ATTACHED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "feed_ingress_frontends_attached",
        "Frontends this instance is currently registered with",
    )
    .expect("metric creation")
});

pub static DNS_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        opts!("feed_dns_updates_total", "DNS reconciliations, by result"),
        &["result"],
    )
    .expect("metric creation")
});

pub static DNS_CHANGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        opts!(
            "feed_dns_record_changes_total",
            "Record changes applied to the hosted zone, by action"
        ),
        &["action"],
    )
    .expect("metric creation")
});

pub static DNS_SKIPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        opts!(
            "feed_dns_skipped_entries_total",
            "Entries not reconciled into the zone, by reason"
        ),
        &["reason"],
    )
    .expect("metric creation")
});

pub static DNS_MANAGED_RECORDS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "feed_dns_managed_records",
        "Records in the zone pointing at a managed frontend",
    )
    .expect("metric creation")
});

pub static DNS_FAILED_BATCHES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "feed_dns_failed_batches_total",
        "Change batches rejected by the DNS provider",
    )
    .expect("metric creation")
});

fn register(registry: &Registry, collector: Box<dyn prometheus::core::Collector>) {
    if let Err(e) = registry.register(collector) {
        warn!("metric registration failed: {e}");
    }
}

/// Register the traffic-daemon metrics. Called once from main.
pub fn register_ingress_metrics() {
    register(&REGISTRY, Box::new(UPDATES.clone()));
    register(&REGISTRY, Box::new(INGRESS_ENTRIES.clone()));
    register(&REGISTRY, Box::new(SKIPPED_ENTRIES.clone()));
    register(&REGISTRY, Box::new(NGINX_RELOADS.clone()));
    register(&REGISTRY, Box::new(NGINX_CONNECTIONS.clone()));
    register(&REGISTRY, Box::new(NGINX_CONNECTIONS_TOTAL.clone()));
    register(&REGISTRY, Box::new(NGINX_REQUESTS.clone()));
    register(&REGISTRY, Box::new(NGINX_BYTES.clone()));
    register(&REGISTRY, Box::new(NGINX_UPSTREAM_REQUESTS.clone()));
    register(&REGISTRY, Box::new(FRONTENDS_ATTACHED.clone()));
}

/// Register the DNS-daemon metrics. Called once from main.
pub fn register_dns_metrics() {
    register(&REGISTRY, Box::new(UPDATES.clone()));
    register(&REGISTRY, Box::new(INGRESS_ENTRIES.clone()));
    register(&REGISTRY, Box::new(DNS_UPDATES.clone()));
    register(&REGISTRY, Box::new(DNS_CHANGES.clone()));
    register(&REGISTRY, Box::new(DNS_SKIPPED.clone()));
    register(&REGISTRY, Box::new(DNS_MANAGED_RECORDS.clone()));
    register(&REGISTRY, Box::new(DNS_FAILED_BATCHES.clone()));
}

/// Text exposition of the registry, shared by the /metrics endpoint and the
/// pushgateway pusher.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Periodically push the registry to a prometheus pushgateway.
///
/// Terminates when the shutdown channel flips to true.
pub async fn push_loop(
    pushgateway: String,
    interval: Duration,
    job: &str,
    labels: Vec<(String, String)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut url = format!("{}/metrics/job/{}", pushgateway.trim_end_matches('/'), job);
    for (name, value) in &labels {
        url.push_str(&format!("/{name}/{value}"));
    }

    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let body = gather();
                match client
                    .put(&url)
                    .header("Content-Type", "text/plain; version=0.0.4")
                    .body(body)
                    .timeout(Duration::from_secs(10))
                    .send()
                    .await
                {
                    Ok(resp) if resp.status().is_success() => {
                        debug!("pushed metrics to {url}");
                    }
                    Ok(resp) => warn!("pushgateway returned {}", resp.status()),
                    Err(e) => warn!("failed to push metrics: {e}"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
