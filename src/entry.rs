use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Which load-balancer frontend an ingress wants to be reachable through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LbScheme {
    Internal,
    InternetFacing,
}

impl LbScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            LbScheme::Internal => "internal",
            LbScheme::InternetFacing => "internet-facing",
        }
    }
}

impl fmt::Display for LbScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LbScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(LbScheme::Internal),
            "internet-facing" => Ok(LbScheme::InternetFacing),
            other => Err(format!("unknown load-balancer scheme {other:?}")),
        }
    }
}

/// Default for `keepalive_requests` on a synthesised upstream.
pub const DEFAULT_MAX_REQUESTS_PER_CONNECTION: u64 = 1024;

/// The canonical projection of one path of one ingress resource.
///
/// Entries are immutable once projected; a fresh set replaces the previous
/// one on every watch event or resync. Identity (and therefore duplicate
/// detection) is the `(namespace, name, host, path, service_address,
/// service_port)` tuple; the remaining fields are attributes carried along
/// for rendering and status reporting.
#[derive(Clone, Debug)]
pub struct IngressEntry {
    pub namespace: String,
    pub name: String,
    pub host: String,
    pub path: String,
    pub service_address: String,
    pub service_port: i32,

    pub allow: Vec<String>,
    pub strip_path: bool,
    pub exact_path: bool,
    pub lb_scheme: LbScheme,
    pub ingress_class: Option<String>,

    pub backend_connect_timeout_seconds: u64,
    pub backend_timeout_seconds: u64,
    pub backend_keepalive_seconds: Option<u64>,
    /// 0 means unlimited.
    pub backend_max_connections: u64,
    pub backend_max_requests_per_connection: u64,
    pub proxy_buffer_size_kb: u64,
    pub proxy_buffer_blocks: u64,

    /// Taken from the ingress resource, used as tie-breaker context in logs.
    pub created: DateTime<Utc>,
    /// resourceVersion of the backing ingress, carried for optimistic
    /// concurrency on status writes.
    pub resource_version: Option<String>,
    /// Hostnames currently recorded in the ingress status, so the status
    /// writer only patches on change.
    pub status_hostnames: Vec<String>,
}

impl IngressEntry {
    /// `host:port` of the backing service.
    pub fn service_endpoint(&self) -> String {
        format!("{}:{}", self.service_address, self.service_port)
    }

    /// Identity tuple; equality on this tuple defines duplicate entries and
    /// its ascending order decides which duplicate wins.
    pub fn identity(&self) -> (&str, &str, &str, &str, &str, i32) {
        (
            &self.namespace,
            &self.name,
            &self.host,
            &self.path,
            &self.service_address,
            self.service_port,
        )
    }

    /// Path as rendered into the proxy configuration: exact paths verbatim,
    /// everything else trimmed of surrounding slashes and re-wrapped.
    pub fn normalised_path(&self) -> String {
        normalise_path(&self.path, self.exact_path)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err(format!(
                "ingress {}/{} has an empty host",
                self.namespace, self.name
            ));
        }
        if self.service_address.is_empty() {
            return Err(format!(
                "ingress {}/{} has no resolvable service address",
                self.namespace, self.name
            ));
        }
        if !(1..=65535).contains(&self.service_port) {
            return Err(format!(
                "ingress {}/{} has service port {} out of range",
                self.namespace, self.name, self.service_port
            ));
        }
        Ok(())
    }
}

impl PartialEq for IngressEntry {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for IngressEntry {}

impl PartialOrd for IngressEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IngressEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl fmt::Display for IngressEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {}{} -> {}",
            self.namespace,
            self.name,
            self.host,
            self.path,
            self.service_endpoint()
        )
    }
}

/// Normalise an ingress path for use as an nginx location.
///
/// Exact paths are kept verbatim. Non-exact paths lose their surrounding
/// slashes and are wrapped as `/trimmed/`; an empty remainder collapses to
/// `/`.
pub fn normalise_path(path: &str, exact: bool) -> String {
    if exact {
        return path.to_string();
    }
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(namespace: &str, name: &str, host: &str, path: &str) -> IngressEntry {
        IngressEntry {
            namespace: namespace.into(),
            name: name.into(),
            host: host.into(),
            path: path.into(),
            service_address: "10.254.0.1".into(),
            service_port: 8080,
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

    #[test]
    fn normalises_paths() {
        for (path, exact, expected) in [
            ("", false, "/"),
            ("/", false, "/"),
            ("//", false, "/"),
            ("/api", false, "/api/"),
            ("api/", false, "/api/"),
            ("//api//v1//", false, "/api//v1/"),
            ("/exact", true, "/exact"),
            ("/exact/", true, "/exact/"),
            ("", true, ""),
        ] {
            assert_eq!(normalise_path(path, exact), expected, "path {path:?}");
        }
    }

    #[test]
    fn ordering_follows_identity_tuple() {
        let mut entries = vec![
            entry("default", "ingress-b", "a.com", "/x"),
            entry("default", "ingress-a", "a.com", "/x"),
            entry("aardvark", "ingress-z", "a.com", "/x"),
        ];
        entries.sort();
        let names: Vec<_> = entries
            .iter()
            .map(|e| format!("{}/{}", e.namespace, e.name))
            .collect();
        assert_eq!(
            names,
            ["aardvark/ingress-z", "default/ingress-a", "default/ingress-b"]
        );
    }

    #[test]
    fn equality_ignores_attributes() {
        let mut a = entry("default", "ing", "a.com", "/x");
        let mut b = entry("default", "ing", "a.com", "/x");
        a.allow = vec!["10.0.0.0/8".into()];
        b.strip_path = true;
        assert_eq!(a, b);
    }

    #[test]
    fn scheme_round_trips() {
        for scheme in [LbScheme::Internal, LbScheme::InternetFacing] {
            assert_eq!(scheme.as_str().parse::<LbScheme>().unwrap(), scheme);
        }
        assert!("external".parse::<LbScheme>().is_err());
    }

    #[test]
    fn validation_rejects_bad_entries() {
        let mut e = entry("default", "ing", "", "/x");
        assert!(e.validate().is_err());
        e.host = "a.com".into();
        assert!(e.validate().is_ok());
        e.service_port = 0;
        assert!(e.validate().is_err());
    }
}
