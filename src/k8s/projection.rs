use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::entry::{IngressEntry, LbScheme, DEFAULT_MAX_REQUESTS_PER_CONNECTION};
use crate::metrics::SKIPPED_ENTRIES;

/// Annotation keys recognised on ingress resources.
pub mod annotations {
    pub const INGRESS_CLASS: &str = "kubernetes.io/ingress.class";
    pub const FRONTEND_SCHEME: &str = "sky.uk/frontend-scheme";
    /// Legacy name, still honoured.
    pub const FRONTEND_ELB_SCHEME: &str = "sky.uk/frontend-elb-scheme";
    pub const ALLOW: &str = "sky.uk/allow";
    pub const STRIP_PATH: &str = "sky.uk/strip-path";
    pub const EXACT_PATH: &str = "sky.uk/exact-path";
    pub const BACKEND_TIMEOUT_SECONDS: &str = "sky.uk/backend-timeout-seconds";
    pub const BACKEND_CONNECT_TIMEOUT_SECONDS: &str = "sky.uk/backend-connect-timeout-seconds";
    pub const BACKEND_KEEPALIVE_SECONDS: &str = "sky.uk/backend-keepalive-seconds";
    pub const BACKEND_MAX_CONNECTIONS: &str = "sky.uk/backend-max-connections";
    pub const BACKEND_MAX_REQUESTS_PER_CONNECTION: &str =
        "sky.uk/backend-max-requests-per-connection";
    pub const PROXY_BUFFER_SIZE_KB: &str = "sky.uk/proxy-buffer-size-in-kb";
    pub const PROXY_BUFFER_BLOCKS: &str = "sky.uk/proxy-buffer-blocks";
}

const MAX_PROXY_BUFFER_SIZE_KB: u64 = 64;
const MAX_PROXY_BUFFER_BLOCKS: u64 = 8;

/// Daemon-level defaults applied where an ingress carries no annotation.
#[derive(Clone, Debug)]
pub struct EntryDefaults {
    pub backend_connect_timeout_seconds: u64,
    pub backend_timeout_seconds: u64,
    pub proxy_buffer_size_kb: u64,
    pub proxy_buffer_blocks: u64,
}

impl Default for EntryDefaults {
    fn default() -> Self {
        Self {
            backend_connect_timeout_seconds: 1,
            backend_timeout_seconds: 60,
            proxy_buffer_size_kb: 4,
            proxy_buffer_blocks: 4,
        }
    }
}

/// Project the watched cluster state into the canonical entry list.
///
/// One entry per `(rule host, http path)` of every in-scope ingress. An
/// ingress is in scope when its class annotation (or `spec.ingressClassName`)
/// matches `ingress_class`. Entries whose backing service cannot be resolved
/// to a `host:port` are dropped.
pub fn project(
    ingresses: &[Arc<Ingress>],
    services: &[Arc<Service>],
    ingress_class: &str,
    defaults: &EntryDefaults,
) -> Vec<IngressEntry> {
    let service_map = index_services(services);
    let mut entries = Vec::new();

    for ingress in ingresses {
        if !matches_class(ingress, ingress_class) {
            continue;
        }
        project_ingress(ingress, &service_map, defaults, &mut entries);
    }

    debug!("projected {} entries from {} ingresses", entries.len(), ingresses.len());
    entries
}

struct ServiceInfo {
    cluster_ip: String,
    named_ports: BTreeMap<String, i32>,
}

fn index_services(services: &[Arc<Service>]) -> HashMap<(String, String), ServiceInfo> {
    let mut map = HashMap::new();
    for service in services {
        let Some(namespace) = service.namespace() else {
            continue;
        };
        let name = service.name_any();
        let Some(spec) = &service.spec else { continue };
        let Some(cluster_ip) = spec.cluster_ip.clone() else {
            continue;
        };
        if cluster_ip.is_empty() || cluster_ip == "None" {
            continue;
        }
        let named_ports = spec
            .ports
            .iter()
            .flatten()
            .filter_map(|p| p.name.clone().map(|n| (n, p.port)))
            .collect();
        map.insert(
            (namespace, name),
            ServiceInfo {
                cluster_ip,
                named_ports,
            },
        );
    }
    map
}

fn matches_class(ingress: &Ingress, ingress_class: &str) -> bool {
    if let Some(value) = ingress.annotations().get(annotations::INGRESS_CLASS) {
        return value == ingress_class;
    }
    ingress
        .spec
        .as_ref()
        .and_then(|s| s.ingress_class_name.as_deref())
        == Some(ingress_class)
}

fn project_ingress(
    ingress: &Arc<Ingress>,
    services: &HashMap<(String, String), ServiceInfo>,
    defaults: &EntryDefaults,
    entries: &mut Vec<IngressEntry>,
) {
    let namespace = ingress.namespace().unwrap_or_default();
    let name = ingress.name_any();
    let anns = ingress.annotations();

    let lb_scheme = match scheme_of(ingress) {
        Ok(scheme) => scheme,
        Err(raw) => {
            warn!("ingress {namespace}/{name} has unrecognised scheme {raw:?}, skipping");
            SKIPPED_ENTRIES.with_label_values(&["invalid-scheme"]).inc();
            return;
        }
    };

    let allow: Vec<String> = anns
        .get(annotations::ALLOW)
        .map(|raw| {
            raw.split(',')
                .map(|cidr| cidr.trim().to_string())
                .filter(|cidr| !cidr.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let created: DateTime<Utc> = ingress
        .meta()
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or_else(Utc::now);

    let status_hostnames = current_status_hostnames(ingress);

    let proxy_buffer_size_kb = bounded_annotation(
        anns,
        annotations::PROXY_BUFFER_SIZE_KB,
        defaults.proxy_buffer_size_kb,
        MAX_PROXY_BUFFER_SIZE_KB,
        &namespace,
        &name,
    );
    let proxy_buffer_blocks = bounded_annotation(
        anns,
        annotations::PROXY_BUFFER_BLOCKS,
        defaults.proxy_buffer_blocks,
        MAX_PROXY_BUFFER_BLOCKS,
        &namespace,
        &name,
    );

    for rule in ingress.spec.iter().flat_map(|s| s.rules.iter().flatten()) {
        let Some(host) = rule.host.clone().filter(|h| !h.is_empty()) else {
            debug!("ingress {namespace}/{name} rule without host, skipping");
            SKIPPED_ENTRIES.with_label_values(&["no-host"]).inc();
            continue;
        };
        for path in rule.http.iter().flat_map(|h| h.paths.iter()) {
            let Some(backend) = &path.backend.service else {
                SKIPPED_ENTRIES.with_label_values(&["no-service"]).inc();
                continue;
            };
            let Some(service) = services.get(&(namespace.clone(), backend.name.clone())) else {
                warn!(
                    "ingress {namespace}/{name} references unknown service {}, skipping",
                    backend.name
                );
                SKIPPED_ENTRIES.with_label_values(&["no-service"]).inc();
                continue;
            };
            let Some(service_port) = resolve_port(backend, service) else {
                warn!(
                    "ingress {namespace}/{name} references unresolvable port on service {}, skipping",
                    backend.name
                );
                SKIPPED_ENTRIES.with_label_values(&["no-port"]).inc();
                continue;
            };

            let entry = IngressEntry {
                namespace: namespace.clone(),
                name: name.clone(),
                host: host.clone(),
                path: path.path.clone().unwrap_or_default(),
                service_address: service.cluster_ip.clone(),
                service_port,
                allow: allow.clone(),
                strip_path: bool_annotation(anns, annotations::STRIP_PATH),
                exact_path: bool_annotation(anns, annotations::EXACT_PATH),
                lb_scheme,
                ingress_class: anns.get(annotations::INGRESS_CLASS).cloned(),
                backend_connect_timeout_seconds: u64_annotation(
                    anns,
                    annotations::BACKEND_CONNECT_TIMEOUT_SECONDS,
                    defaults.backend_connect_timeout_seconds,
                ),
                backend_timeout_seconds: u64_annotation(
                    anns,
                    annotations::BACKEND_TIMEOUT_SECONDS,
                    defaults.backend_timeout_seconds,
                ),
                backend_keepalive_seconds: anns
                    .get(annotations::BACKEND_KEEPALIVE_SECONDS)
                    .and_then(|raw| raw.parse().ok()),
                backend_max_connections: u64_annotation(
                    anns,
                    annotations::BACKEND_MAX_CONNECTIONS,
                    0,
                ),
                backend_max_requests_per_connection: u64_annotation(
                    anns,
                    annotations::BACKEND_MAX_REQUESTS_PER_CONNECTION,
                    DEFAULT_MAX_REQUESTS_PER_CONNECTION,
                ),
                proxy_buffer_size_kb,
                proxy_buffer_blocks,
                created,
                resource_version: ingress.meta().resource_version.clone(),
                status_hostnames: status_hostnames.clone(),
            };

            if let Err(reason) = entry.validate() {
                warn!("skipping invalid entry: {reason}");
                SKIPPED_ENTRIES.with_label_values(&["invalid"]).inc();
                continue;
            }
            entries.push(entry);
        }
    }
}

fn scheme_of(ingress: &Ingress) -> Result<LbScheme, String> {
    let anns = ingress.annotations();
    let raw = anns
        .get(annotations::FRONTEND_SCHEME)
        .or_else(|| anns.get(annotations::FRONTEND_ELB_SCHEME));
    match raw {
        Some(value) => value.parse().map_err(|_| value.clone()),
        None => Ok(LbScheme::Internal),
    }
}

fn current_status_hostnames(ingress: &Ingress) -> Vec<String> {
    let mut hostnames: Vec<String> = ingress
        .status
        .iter()
        .flat_map(|s| s.load_balancer.iter())
        .flat_map(|lb| lb.ingress.iter().flatten())
        .filter_map(|i| i.hostname.clone().or_else(|| i.ip.clone()))
        .collect();
    hostnames.sort();
    hostnames
}

fn resolve_port(
    backend: &k8s_openapi::api::networking::v1::IngressServiceBackend,
    service: &ServiceInfo,
) -> Option<i32> {
    let port = backend.port.as_ref()?;
    if let Some(number) = port.number {
        return Some(number);
    }
    port.name
        .as_ref()
        .and_then(|name| service.named_ports.get(name))
        .copied()
}

fn bool_annotation(anns: &BTreeMap<String, String>, key: &str) -> bool {
    anns.get(key).map(|v| v == "true").unwrap_or(false)
}

fn u64_annotation(anns: &BTreeMap<String, String>, key: &str, default: u64) -> u64 {
    match anns.get(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("annotation {key}={raw:?} is not a number, using {default}");
            default
        }),
    }
}

fn bounded_annotation(
    anns: &BTreeMap<String, String>,
    key: &str,
    default: u64,
    max: u64,
    namespace: &str,
    name: &str,
) -> u64 {
    let value = u64_annotation(anns, key, default);
    if value > max {
        warn!("ingress {namespace}/{name} {key}={value} exceeds {max}, clamping");
        max
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ingress(namespace: &str, name: &str, anns: serde_json::Value) -> Arc<Ingress> {
        Arc::new(
            serde_json::from_value(json!({
                "apiVersion": "networking.k8s.io/v1",
                "kind": "Ingress",
                "metadata": {
                    "namespace": namespace,
                    "name": name,
                    "annotations": anns,
                    "creationTimestamp": "2020-05-01T00:00:00Z",
                    "resourceVersion": "41"
                },
                "spec": {
                    "rules": [{
                        "host": "foo.com",
                        "http": {
                            "paths": [{
                                "path": "/api",
                                "pathType": "Prefix",
                                "backend": {"service": {"name": "svc", "port": {"number": 8080}}}
                            }]
                        }
                    }]
                }
            }))
            .unwrap(),
        )
    }

    fn service(namespace: &str, name: &str, cluster_ip: &str) -> Arc<Service> {
        Arc::new(
            serde_json::from_value(json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"namespace": namespace, "name": name},
                "spec": {
                    "clusterIP": cluster_ip,
                    "ports": [{"name": "http", "port": 8080}]
                }
            }))
            .unwrap(),
        )
    }

    #[test]
    fn projects_annotated_ingress() {
        let ingresses = vec![ingress(
            "default",
            "ing",
            json!({
                "kubernetes.io/ingress.class": "prod",
                "sky.uk/frontend-scheme": "internet-facing",
                "sky.uk/allow": "10.0.0.0/8, 192.168.0.0/16",
                "sky.uk/strip-path": "true",
                "sky.uk/backend-timeout-seconds": "20",
                "sky.uk/backend-max-connections": "512"
            }),
        )];
        let services = vec![service("default", "svc", "10.254.0.9")];

        let entries = project(&ingresses, &services, "prod", &EntryDefaults::default());
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.host, "foo.com");
        assert_eq!(e.path, "/api");
        assert_eq!(e.service_endpoint(), "10.254.0.9:8080");
        assert_eq!(e.lb_scheme, LbScheme::InternetFacing);
        assert_eq!(e.allow, vec!["10.0.0.0/8", "192.168.0.0/16"]);
        assert!(e.strip_path);
        assert!(!e.exact_path);
        assert_eq!(e.backend_timeout_seconds, 20);
        assert_eq!(e.backend_max_connections, 512);
        assert_eq!(e.resource_version.as_deref(), Some("41"));
    }

    #[test]
    fn filters_by_ingress_class() {
        let ingresses = vec![
            ingress("default", "mine", json!({"kubernetes.io/ingress.class": "prod"})),
            ingress("default", "other", json!({"kubernetes.io/ingress.class": "dev"})),
            ingress("default", "unclassed", json!({})),
        ];
        let services = vec![service("default", "svc", "10.254.0.9")];

        let entries = project(&ingresses, &services, "prod", &EntryDefaults::default());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "mine");
    }

    #[test]
    fn honours_legacy_scheme_annotation() {
        let ingresses = vec![ingress(
            "default",
            "ing",
            json!({
                "kubernetes.io/ingress.class": "prod",
                "sky.uk/frontend-elb-scheme": "internet-facing"
            }),
        )];
        let services = vec![service("default", "svc", "10.254.0.9")];

        let entries = project(&ingresses, &services, "prod", &EntryDefaults::default());
        assert_eq!(entries[0].lb_scheme, LbScheme::InternetFacing);
    }

    #[test]
    fn skips_entries_with_unknown_service() {
        let ingresses = vec![ingress(
            "default",
            "ing",
            json!({"kubernetes.io/ingress.class": "prod"}),
        )];
        let entries = project(&ingresses, &[], "prod", &EntryDefaults::default());
        assert!(entries.is_empty());
    }

    #[test]
    fn resolves_named_ports_through_the_service() {
        let mut ing: Ingress = (*ingress(
            "default",
            "ing",
            json!({"kubernetes.io/ingress.class": "prod"}),
        ))
        .clone();
        let rule = ing
            .spec
            .as_mut()
            .and_then(|s| s.rules.as_mut())
            .and_then(|r| r.first_mut())
            .and_then(|r| r.http.as_mut())
            .unwrap();
        let backend = rule.paths[0].backend.service.as_mut().unwrap();
        backend.port = serde_json::from_value(json!({"name": "http"})).ok();
        let services = vec![service("default", "svc", "10.254.0.9")];

        let entries = project(
            &[Arc::new(ing)],
            &services,
            "prod",
            &EntryDefaults::default(),
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].service_port, 8080);
    }

    #[test]
    fn clamps_oversized_proxy_buffers() {
        let ingresses = vec![ingress(
            "default",
            "ing",
            json!({
                "kubernetes.io/ingress.class": "prod",
                "sky.uk/proxy-buffer-size-in-kb": "1024",
                "sky.uk/proxy-buffer-blocks": "100"
            }),
        )];
        let services = vec![service("default", "svc", "10.254.0.9")];

        let entries = project(&ingresses, &services, "prod", &EntryDefaults::default());
        assert_eq!(entries[0].proxy_buffer_size_kb, MAX_PROXY_BUFFER_SIZE_KB);
        assert_eq!(entries[0].proxy_buffer_blocks, MAX_PROXY_BUFFER_BLOCKS);
    }
}
