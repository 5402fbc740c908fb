// Round-trip check on the rendering pipeline: projecting ingress resources,
// rendering the nginx configuration and parsing the server blocks back out
// yields the same host/path set that went in (modulo deduplication).

use feed::entry::{IngressEntry, LbScheme};
use feed::k8s::{project, EntryDefaults};
use feed::nginx::conf;
use feed::nginx::NginxConfig;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use regex::Regex;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn nginx_config() -> NginxConfig {
    NginxConfig {
        binary: "/usr/sbin/nginx".into(),
        workdir: PathBuf::from("/nonexistent"),
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

fn ingress(name: &str, host: &str, paths: &[&str]) -> Arc<Ingress> {
    let paths: Vec<_> = paths
        .iter()
        .map(|path| {
            json!({
                "path": path,
                "pathType": "Prefix",
                "backend": {"service": {"name": "svc", "port": {"number": 8080}}}
            })
        })
        .collect();
    Arc::new(
        serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {
                "namespace": "default",
                "name": name,
                "annotations": {"kubernetes.io/ingress.class": "prod"},
                "creationTimestamp": "2020-05-01T00:00:00Z"
            },
            "spec": {
                "rules": [{"host": host, "http": {"paths": paths}}]
            }
        }))
        .unwrap(),
    )
}

fn service() -> Arc<Service> {
    Arc::new(
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"namespace": "default", "name": "svc"},
            "spec": {"clusterIP": "10.254.0.9", "ports": [{"port": 8080}]}
        }))
        .unwrap(),
    )
}

/// Extract `(host, path)` pairs from the rendered configuration, skipping
/// the private status server and the synthetic fail-closed root locations.
fn parse_routes(config: &str) -> BTreeSet<(String, String)> {
    let server_re = Regex::new(r"server_name (\S+);").unwrap();
    let location_re = Regex::new(r"location (?:= )?(\S+) \{").unwrap();

    let mut routes = BTreeSet::new();
    let mut host: Option<String> = None;
    let mut synthetic_root = false;
    for line in config.lines() {
        if let Some(captures) = server_re.captures(line) {
            host = Some(captures[1].to_string()).filter(|h| h.as_str() != "status.localhost");
            continue;
        }
        if let Some(captures) = location_re.captures(line) {
            synthetic_root = false;
            if let Some(host) = &host {
                routes.insert((host.clone(), captures[1].to_string()));
                synthetic_root = &captures[1] == "/";
            }
        }
        // A root location that only returns 404 was synthesised; it does not
        // correspond to an input entry.
        if synthetic_root && line.trim() == "return 404;" {
            if let Some(host) = &host {
                routes.remove(&(host.clone(), "/".to_string()));
            }
        }
    }
    routes
}

#[test]
fn projection_render_parse_round_trips() {
    let ingresses = vec![
        ingress("ing-a", "a.example.com", &["/api", "/web"]),
        ingress("ing-b", "b.example.com", &["/"]),
        // Duplicate host/path of ing-a: deduplicated away.
        ingress("ing-z", "a.example.com", &["/api"]),
    ];
    let services = vec![service()];

    let entries = project(&ingresses, &services, "prod", &EntryDefaults::default());
    assert_eq!(entries.len(), 4);

    let cfg = nginx_config();
    let tera = {
        let mut tera = tera::Tera::default();
        // Render with the shipped template.
        tera.add_raw_template(
            conf::TEMPLATE_FILE,
            include_str!("../src/nginx/nginx.conf.tera"),
        )
        .unwrap();
        tera
    };
    let rendered = conf::render(&cfg, &tera, &entries).unwrap();

    let expected: BTreeSet<(String, String)> = [
        ("a.example.com", "/api/"),
        ("a.example.com", "/web/"),
        ("b.example.com", "/"),
    ]
    .into_iter()
    .map(|(h, p)| (h.to_string(), p.to_string()))
    .collect();

    assert_eq!(parse_routes(&rendered.config), expected);
    assert_eq!(
        rendered.routes.into_iter().collect::<BTreeSet<_>>(),
        expected
    );
}

#[test]
fn rendering_is_stable_across_projection_order() {
    let services = vec![service()];
    let forward = vec![
        ingress("ing-a", "a.example.com", &["/api"]),
        ingress("ing-b", "b.example.com", &["/"]),
    ];
    let mut backward = forward.clone();
    backward.reverse();

    let cfg = nginx_config();
    let mut tera = tera::Tera::default();
    tera.add_raw_template(
        conf::TEMPLATE_FILE,
        include_str!("../src/nginx/nginx.conf.tera"),
    )
    .unwrap();

    let defaults = EntryDefaults::default();
    let first = conf::render(&cfg, &tera, &project(&forward, &services, "prod", &defaults))
        .unwrap()
        .config;
    let second = conf::render(&cfg, &tera, &project(&backward, &services, "prod", &defaults))
        .unwrap()
        .config;
    assert_eq!(first, second);
}

#[test]
fn entries_order_deterministically() {
    let mut entries: Vec<IngressEntry> = Vec::new();
    for name in ["zz", "aa", "mm"] {
        let ingresses = vec![ingress(name, "a.example.com", &["/x"])];
        entries.extend(project(
            &ingresses,
            &[service()],
            "prod",
            &EntryDefaults::default(),
        ));
    }
    entries.sort();
    let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, ["aa", "mm", "zz"]);
    assert!(entries.iter().all(|e| e.lb_scheme == LbScheme::Internal));
}
