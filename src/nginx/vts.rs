use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

use crate::metrics::{
    NGINX_BYTES, NGINX_CONNECTIONS, NGINX_CONNECTIONS_TOTAL, NGINX_REQUESTS,
    NGINX_UPSTREAM_REQUESTS,
};
use crate::Result;

pub const SCRAPE_INTERVAL: Duration = Duration::from_secs(10);
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON document served by the virtual-host traffic-status module.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VtsStatus {
    pub connections: Connections,
    pub server_zones: HashMap<String, Zone>,
    /// Keyed by filter name (the server name), then by filter key (the
    /// location path).
    pub filter_zones: HashMap<String, HashMap<String, Zone>>,
    pub upstream_zones: HashMap<String, Vec<UpstreamZone>>,
}

#[derive(Deserialize, Debug, Default)]
pub struct Connections {
    pub active: u64,
    pub reading: u64,
    pub writing: u64,
    pub waiting: u64,
    pub accepted: u64,
    pub handled: u64,
    pub requests: u64,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Zone {
    pub request_counter: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub responses: Responses,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamZone {
    pub server: String,
    pub request_counter: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub responses: Responses,
}

#[derive(Deserialize, Debug, Default)]
pub struct Responses {
    #[serde(rename = "1xx")]
    pub one_xx: u64,
    #[serde(rename = "2xx")]
    pub two_xx: u64,
    #[serde(rename = "3xx")]
    pub three_xx: u64,
    #[serde(rename = "4xx")]
    pub four_xx: u64,
    #[serde(rename = "5xx")]
    pub five_xx: u64,
}

impl Responses {
    fn classes(&self) -> [(&'static str, u64); 5] {
        [
            ("1xx", self.one_xx),
            ("2xx", self.two_xx),
            ("3xx", self.three_xx),
            ("4xx", self.four_xx),
            ("5xx", self.five_xx),
        ]
    }
}

/// Tracks the previously observed cumulative values so the scraper can feed
/// prometheus counters with deltas. A value falling below its predecessor
/// means nginx restarted and the whole value is the delta.
#[derive(Default)]
pub struct CounterState {
    last: HashMap<String, u64>,
}

impl CounterState {
    fn delta(&mut self, key: String, current: u64) -> u64 {
        match self.last.insert(key, current) {
            Some(previous) if current >= previous => current - previous,
            Some(_) | None => current,
        }
    }
}

/// Fetch and record one scrape of the status endpoint.
///
/// `routes` bounds the exported filter-zone labels: keys that do not match a
/// currently-known `(host, path)` are dropped so a removed ingress cannot
/// leave unbounded label cardinality behind.
pub async fn scrape(
    client: &reqwest::Client,
    url: &str,
    routes: &HashSet<(String, String)>,
    state: &mut CounterState,
) -> Result<()> {
    let status: VtsStatus = client
        .get(url)
        .timeout(SCRAPE_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    record(&status, routes, state);
    Ok(())
}

fn record(status: &VtsStatus, routes: &HashSet<(String, String)>, state: &mut CounterState) {
    let connections = &status.connections;
    NGINX_CONNECTIONS
        .with_label_values(&["active"])
        .set(connections.active as i64);
    NGINX_CONNECTIONS
        .with_label_values(&["reading"])
        .set(connections.reading as i64);
    NGINX_CONNECTIONS
        .with_label_values(&["writing"])
        .set(connections.writing as i64);
    NGINX_CONNECTIONS
        .with_label_values(&["waiting"])
        .set(connections.waiting as i64);

    for (kind, value) in [
        ("accepted", connections.accepted),
        ("handled", connections.handled),
        ("requests", connections.requests),
    ] {
        let delta = state.delta(format!("connections.{kind}"), value);
        NGINX_CONNECTIONS_TOTAL.with_label_values(&[kind]).inc_by(delta);
    }

    for (host, by_path) in &status.filter_zones {
        for (path, zone) in by_path {
            if !routes.contains(&(host.clone(), path.clone())) {
                debug!("dropping unknown filter zone {host}{path}");
                continue;
            }
            for (class, value) in zone.responses.classes() {
                let delta = state.delta(format!("filter.{host}.{path}.{class}"), value);
                NGINX_REQUESTS
                    .with_label_values(&[host, path, class])
                    .inc_by(delta);
            }
            let delta = state.delta(format!("filter.{host}.{path}.in"), zone.in_bytes);
            NGINX_BYTES
                .with_label_values(&[host, path, "in"])
                .inc_by(delta);
            let delta = state.delta(format!("filter.{host}.{path}.out"), zone.out_bytes);
            NGINX_BYTES
                .with_label_values(&[host, path, "out"])
                .inc_by(delta);
        }
    }

    for (name, members) in &status.upstream_zones {
        for member in members {
            for (class, value) in member.responses.classes() {
                let delta = state.delta(
                    format!("upstream.{name}.{}.{class}", member.server),
                    value,
                );
                NGINX_UPSTREAM_REQUESTS
                    .with_label_values(&[name, &member.server, class])
                    .inc_by(delta);
            }
        }
    }
}
