use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tera::{Context, Tera};
use tracing::info;

use crate::entry::IngressEntry;
use crate::metrics::SKIPPED_ENTRIES;
use crate::settings::IngressSettings;
use crate::Result;

/// Name of the template looked up in the working directory before falling
/// back to the built-in one.
pub const TEMPLATE_FILE: &str = "nginx.tmpl";

const DEFAULT_TEMPLATE: &str = include_str!("nginx.conf.tera");

/// Daemon-level nginx settings, fixed for the process lifetime.
#[derive(Clone, Debug)]
pub struct NginxConfig {
    pub binary: String,
    pub workdir: PathBuf,
    pub ingress_port: u16,
    pub ssl_port: u16,
    pub status_port: u16,
    pub worker_processes: u64,
    pub worker_connections: u64,
    pub keepalive_seconds: u64,
    pub backend_keepalive_count: u64,
    pub trusted_frontends: Vec<String>,
    pub proxy_protocol: bool,
    pub ssl_path: Option<String>,
    pub access_log: bool,
    pub access_log_dir: String,
    pub log_level: String,
    pub update_period: Duration,
}

impl NginxConfig {
    pub fn from_settings(settings: &IngressSettings) -> Self {
        Self {
            binary: settings.nginx_binary.clone(),
            workdir: PathBuf::from(&settings.nginx_workdir),
            ingress_port: settings.ingress_port,
            ssl_port: 8443,
            status_port: settings.nginx_status_port,
            worker_processes: settings.nginx_workers,
            worker_connections: 1024,
            keepalive_seconds: settings.nginx_keepalive_seconds,
            backend_keepalive_count: settings.nginx_backend_keepalive_count,
            trusted_frontends: settings.nginx_trusted_frontends.clone(),
            proxy_protocol: settings.nginx_proxy_protocol,
            ssl_path: settings.ssl_path.clone(),
            access_log: settings.access_log,
            access_log_dir: settings.access_log_dir.clone(),
            log_level: settings.shared.log_level.clone(),
            update_period: settings.update_period(),
        }
    }

    pub fn conf_path(&self) -> PathBuf {
        self.workdir.join("nginx.conf")
    }

    pub fn status_url(&self) -> String {
        format!("http://127.0.0.1:{}/status", self.status_port)
    }

    /// The template shipped with the binary, unless the operator placed an
    /// override next to nginx.conf.
    pub fn load_template(&self) -> Result<Tera> {
        let mut tera = Tera::default();
        let override_path = self.workdir.join(TEMPLATE_FILE);
        match std::fs::read_to_string(&override_path) {
            Ok(contents) => tera.add_raw_template(TEMPLATE_FILE, &contents)?,
            Err(_) => tera.add_raw_template(TEMPLATE_FILE, DEFAULT_TEMPLATE)?,
        }
        Ok(tera)
    }
}

#[derive(Serialize, Debug, PartialEq)]
struct Upstream {
    name: String,
    server: String,
    max_connections: u64,
    keepalive_requests: u64,
    keepalive_timeout_seconds: Option<u64>,
}

#[derive(Serialize, Debug)]
struct Location {
    path: String,
    exact: bool,
    /// None renders a fail-closed `return 404`.
    upstream: Option<String>,
    allow: Vec<String>,
    strip_path: bool,
    connect_timeout: u64,
    timeout: u64,
    buffer_size_kb: u64,
    buffer_blocks: u64,
}

#[derive(Serialize, Debug)]
struct Server {
    name: String,
    locations: Vec<Location>,
}

/// A rendered candidate configuration plus the `(host, path)` routes it
/// serves, used to bound the cardinality of scraped traffic metrics.
pub struct Rendered {
    pub config: String,
    pub routes: HashSet<(String, String)>,
}

/// Drop entries that duplicate an already-seen `(host, normalised path)`.
///
/// Entries are considered in ascending identity order, so the
/// lexicographically smallest `(namespace, name, ...)` tuple wins
/// deterministically regardless of input order.
pub fn dedup(entries: &[IngressEntry]) -> Vec<&IngressEntry> {
    let mut sorted: Vec<&IngressEntry> = entries.iter().collect();
    sorted.sort();

    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(sorted.len());
    for entry in sorted {
        if seen.insert((entry.host.clone(), entry.normalised_path())) {
            kept.push(entry);
        } else {
            info!("skipping duplicate ingress entry {entry}");
            SKIPPED_ENTRIES.with_label_values(&["duplicate"]).inc();
        }
    }
    kept
}

/// Render the candidate nginx configuration for an entry set.
///
/// The output is deterministic for a given set: entries are deduplicated in
/// identity order and upstreams and servers are emitted in sorted order.
pub fn render(cfg: &NginxConfig, tera: &Tera, entries: &[IngressEntry]) -> Result<Rendered> {
    let kept = dedup(entries);

    let mut upstreams: BTreeMap<String, Upstream> = BTreeMap::new();
    let mut servers: BTreeMap<String, BTreeMap<String, Location>> = BTreeMap::new();
    let mut routes = HashSet::new();

    for entry in &kept {
        let upstream_name = upstream_name(entry);
        upstreams.entry(upstream_name.clone()).or_insert(Upstream {
            name: upstream_name.clone(),
            server: entry.service_endpoint(),
            max_connections: entry.backend_max_connections,
            keepalive_requests: entry.backend_max_requests_per_connection,
            keepalive_timeout_seconds: entry.backend_keepalive_seconds,
        });

        let path = entry.normalised_path();
        routes.insert((entry.host.clone(), path.clone()));
        servers.entry(entry.host.clone()).or_default().insert(
            path.clone(),
            Location {
                path,
                exact: entry.exact_path,
                upstream: Some(upstream_name),
                allow: entry.allow.clone(),
                strip_path: entry.strip_path,
                connect_timeout: entry.backend_connect_timeout_seconds,
                timeout: entry.backend_timeout_seconds,
                buffer_size_kb: entry.proxy_buffer_size_kb,
                buffer_blocks: entry.proxy_buffer_blocks,
            },
        );
    }

    // Unrouted requests fail closed.
    for locations in servers.values_mut() {
        let has_root = locations.values().any(|l| l.path == "/" && !l.exact);
        if !has_root {
            locations.insert(
                "/".to_string(),
                Location {
                    path: "/".to_string(),
                    exact: false,
                    upstream: None,
                    allow: vec![],
                    strip_path: false,
                    connect_timeout: 0,
                    timeout: 0,
                    buffer_size_kb: 0,
                    buffer_blocks: 0,
                },
            );
        }
    }

    let servers: Vec<Server> = servers
        .into_iter()
        .map(|(name, locations)| Server {
            name,
            locations: locations.into_values().collect(),
        })
        .collect();
    let upstreams: Vec<Upstream> = upstreams.into_values().collect();

    let mut context = Context::new();
    context.insert("workdir", &cfg.workdir.display().to_string());
    context.insert("ingress_port", &cfg.ingress_port);
    context.insert("ssl_port", &cfg.ssl_port);
    context.insert("status_port", &cfg.status_port);
    context.insert("worker_processes", &cfg.worker_processes);
    context.insert("worker_connections", &cfg.worker_connections);
    context.insert("keepalive_seconds", &cfg.keepalive_seconds);
    context.insert("backend_keepalive_count", &cfg.backend_keepalive_count);
    context.insert("trusted_frontends", &cfg.trusted_frontends);
    context.insert("proxy_protocol", &cfg.proxy_protocol);
    context.insert("ssl_path", &cfg.ssl_path);
    context.insert("access_log", &cfg.access_log);
    context.insert("access_log_dir", &cfg.access_log_dir);
    context.insert("log_level", &cfg.log_level);
    context.insert("upstreams", &upstreams);
    context.insert("servers", &servers);

    let config = tera.render(TEMPLATE_FILE, &context)?;
    Ok(Rendered { config, routes })
}

/// `namespace.name.service.port`, the stable identifier of a synthesised
/// upstream.
pub fn upstream_name(entry: &IngressEntry) -> String {
    format!(
        "{}.{}.{}.{}",
        entry.namespace, entry.name, entry.service_address, entry.service_port
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entry::{LbScheme, DEFAULT_MAX_REQUESTS_PER_CONNECTION};
    use chrono::{TimeZone, Utc};

    pub(crate) fn test_config() -> NginxConfig {
        NginxConfig {
            binary: "/usr/sbin/nginx".into(),
            workdir: PathBuf::from("/tmp/feed-test"),
            ingress_port: 8080,
            ssl_port: 8443,
            status_port: 8090,
            worker_processes: 2,
            worker_connections: 1024,
            keepalive_seconds: 65,
            backend_keepalive_count: 512,
            trusted_frontends: vec![],
            proxy_protocol: false,
            ssl_path: None,
            access_log: false,
            access_log_dir: "/var/log/nginx".into(),
            log_level: "warn".into(),
            update_period: Duration::from_secs(30),
        }
    }

    pub(crate) fn entry(
        namespace: &str,
        name: &str,
        host: &str,
        path: &str,
        service: &str,
        port: i32,
    ) -> IngressEntry {
        IngressEntry {
            namespace: namespace.into(),
            name: name.into(),
            host: host.into(),
            path: path.into(),
            service_address: service.into(),
            service_port: port,
            allow: vec![],
            strip_path: false,
            exact_path: false,
            lb_scheme: LbScheme::Internal,
            ingress_class: None,
            backend_connect_timeout_seconds: 1,
            backend_timeout_seconds: 10,
            backend_keepalive_seconds: None,
            backend_max_connections: 0,
            backend_max_requests_per_connection: DEFAULT_MAX_REQUESTS_PER_CONNECTION,
            proxy_buffer_size_kb: 4,
            proxy_buffer_blocks: 4,
            created: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            resource_version: None,
            status_hostnames: vec![],
        }
    }

    fn render_str(entries: &[IngressEntry]) -> String {
        let cfg = test_config();
        let tera = load_embedded();
        render(&cfg, &tera, entries).unwrap().config
    }

    fn load_embedded() -> Tera {
        let mut tera = Tera::default();
        tera.add_raw_template(TEMPLATE_FILE, DEFAULT_TEMPLATE).unwrap();
        tera
    }

    #[test]
    fn renders_basic_entry() {
        let mut e = entry("default", "ing", "foo.com", "/api", "svc", 8080);
        e.allow = vec!["10.0.0.0/8".into()];
        let config = render_str(&[e]);

        assert!(config.contains("upstream default.ing.svc.8080 {"), "{config}");
        assert!(config.contains("server svc:8080;"), "{config}");
        assert!(config.contains("server_name foo.com;"), "{config}");
        assert!(config.contains("location /api/ {"), "{config}");
        assert!(config.contains("allow 10.0.0.0/8;"), "{config}");
        assert!(config.contains("deny all;"), "{config}");
        assert!(config.contains("proxy_pass http://default.ing.svc.8080;"), "{config}");
        // Unrouted requests on a known host fail closed.
        assert!(config.contains("location / {"), "{config}");
        assert!(config.contains("return 404;"), "{config}");
    }

    #[test]
    fn lexicographically_smallest_duplicate_wins() {
        let mut newer = entry("default", "ingress-a", "a.com", "/x", "svc-a", 80);
        newer.created = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
        let mut older = entry("default", "ingress-b", "a.com", "/x", "svc-b", 80);
        older.created = Utc.with_ymd_and_hms(2019, 6, 1, 0, 0, 0).unwrap();

        let config = render_str(&[older.clone(), newer.clone()]);
        assert!(config.contains("default.ingress-a.svc-a.80"), "{config}");
        assert!(!config.contains("default.ingress-b.svc-b.80"), "{config}");

        // Insertion order must not matter.
        assert_eq!(config, render_str(&[newer, older]));
    }

    #[test]
    fn exact_paths_render_verbatim() {
        let mut e = entry("default", "ing", "foo.com", "/exact", "svc", 8080);
        e.exact_path = true;
        let config = render_str(&[e]);
        assert!(config.contains("location = /exact {"), "{config}");
    }

    #[test]
    fn rendering_is_deterministic_across_input_order() {
        let entries = vec![
            entry("default", "b", "b.com", "/x", "svc-b", 80),
            entry("default", "a", "a.com", "/y", "svc-a", 81),
            entry("team", "c", "a.com", "/z", "svc-c", 82),
        ];
        let mut reversed = entries.clone();
        reversed.reverse();
        assert_eq!(render_str(&entries), render_str(&reversed));
    }

    #[test]
    fn one_upstream_per_identity_tuple() {
        let entries = vec![
            entry("default", "ing", "a.com", "/x", "svc", 80),
            entry("default", "ing", "a.com", "/y", "svc", 80),
            entry("default", "ing", "b.com", "/z", "svc2", 81),
        ];
        let kept = dedup(&entries);
        let names: HashSet<String> = kept.iter().map(|e| upstream_name(e)).collect();
        assert_eq!(
            names,
            HashSet::from([
                "default.ing.svc.80".to_string(),
                "default.ing.svc2.81".to_string()
            ])
        );

        let config = render_str(&entries);
        assert_eq!(config.matches("upstream default.ing.svc.80 {").count(), 1);
    }

    #[test]
    fn hosts_are_unique_and_sorted() {
        let entries = vec![
            entry("default", "ing", "z.com", "/x", "svc", 80),
            entry("default", "ing", "a.com", "/x", "svc", 80),
            entry("default", "ing2", "a.com", "/y", "svc", 80),
        ];
        let config = render_str(&entries);
        assert_eq!(config.matches("server_name a.com;").count(), 1);
        let a = config.find("server_name a.com;").unwrap();
        let z = config.find("server_name z.com;").unwrap();
        assert!(a < z);
    }

    #[test]
    fn strip_path_rewrites_to_root() {
        let mut e = entry("default", "ing", "foo.com", "/api", "svc", 8080);
        e.strip_path = true;
        let config = render_str(&[e]);
        assert!(config.contains("rewrite ^/api/(.*)$ /$1 break;"), "{config}");
    }

    #[test]
    fn keepalive_attributes_render_when_set() {
        let mut e = entry("default", "ing", "foo.com", "/api", "svc", 8080);
        e.backend_max_connections = 256;
        e.backend_keepalive_seconds = Some(30);
        e.backend_max_requests_per_connection = 4096;
        let config = render_str(&[e]);
        assert!(config.contains("server svc:8080 max_conns=256;"), "{config}");
        assert!(config.contains("keepalive_timeout 30s;"), "{config}");
        assert!(config.contains("keepalive_requests 4096;"), "{config}");
    }

    #[test]
    fn existing_root_location_suppresses_synthetic_404() {
        let e = entry("default", "ing", "foo.com", "/", "svc", 8080);
        let config = render_str(&[e]);
        assert_eq!(config.matches("location / {").count(), 1);
        assert!(!config.contains("return 404;"), "{config}");
    }

    #[test]
    fn routes_cover_deduplicated_host_paths() {
        let entries = vec![
            entry("default", "ing", "a.com", "/x", "svc", 80),
            entry("default", "ing", "b.com", "", "svc", 80),
        ];
        let cfg = test_config();
        let rendered = render(&cfg, &load_embedded(), &entries).unwrap();
        assert_eq!(
            rendered.routes,
            HashSet::from([
                ("a.com".to_string(), "/x/".to_string()),
                ("b.com".to_string(), "/".to_string())
            ])
        );
    }

    #[test]
    fn proxy_protocol_listener_and_trusted_frontends() {
        let mut cfg = test_config();
        cfg.proxy_protocol = true;
        cfg.trusted_frontends = vec!["10.10.0.0/16".into()];
        let e = entry("default", "ing", "foo.com", "/api", "svc", 8080);
        let config = render(&cfg, &load_embedded(), &[e]).unwrap().config;
        assert!(config.contains("listen 8080 proxy_protocol;"), "{config}");
        assert!(config.contains("set_real_ip_from 10.10.0.0/16;"), "{config}");
        assert!(config.contains("real_ip_header proxy_protocol;"), "{config}");
    }

    #[test]
    fn ssl_listener_renders_when_configured() {
        let mut cfg = test_config();
        cfg.ssl_path = Some("/etc/ssl/feed.pem".into());
        let e = entry("default", "ing", "foo.com", "/api", "svc", 8080);
        let config = render(&cfg, &load_embedded(), &[e]).unwrap().config;
        assert!(config.contains("listen 8443 ssl;"), "{config}");
        assert!(config.contains("ssl_certificate /etc/ssl/feed.pem;"), "{config}");
    }
}
