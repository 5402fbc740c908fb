use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use crate::entry::{IngressEntry, LbScheme};
use crate::frontend::FrontendMapping;

/// The reconciler's view of one record in the hosted zone: its name, what it
/// points at, and enough detail to recreate or delete it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsolidatedRecord {
    /// FQDN without the trailing dot, lowercase.
    pub name: String,
    /// Alias target, CNAME value or A datum, normalised like `name`.
    pub points_to: String,
    pub alias_hosted_zone: Option<String>,
    pub ttl: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeAction {
    Create,
    Upsert,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Upsert => "upsert",
            ChangeAction::Delete => "delete",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordChange {
    pub action: ChangeAction,
    pub record: ConsolidatedRecord,
}

/// How desired records are expressed in the zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordStyle {
    /// AWS alias A records pointing at an ELB/ALB hosted zone.
    AliasA,
    /// CNAMEs at a fixed TTL pointing at a static frontend hostname.
    Cname { ttl: i64 },
    /// Plain single-datum A records (Cloud DNS).
    PlainA { ttl: i64 },
}

/// A unit is one or two changes forming a logical replacement; batching
/// never splits a unit, so a rename stays atomic within its batch.
pub type ChangeUnit = Vec<RecordChange>;

pub struct Plan {
    pub units: Vec<ChangeUnit>,
    /// Records in the zone pointing at one of our frontends.
    pub managed: usize,
    /// `(host, reason)` pairs for entries that were not reconciled.
    pub skipped: Vec<(String, &'static str)>,
}

fn normalise(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

/// The FQDN an entry's host maps to inside the zone, or None when the host
/// lives outside it.
fn fqdn_in_zone(host: &str, zone: &str) -> Option<String> {
    let host = normalise(host);
    let zone = normalise(zone);
    if host == zone || host.ends_with(&format!(".{zone}")) {
        Some(host)
    } else if !host.contains('.') {
        Some(format!("{host}.{zone}"))
    } else {
        None
    }
}

/// Compute the minimum set of change units bringing the zone in agreement
/// with the entry set.
pub fn compute(
    zone: &str,
    style: RecordStyle,
    frontends: &FrontendMapping,
    existing: &[ConsolidatedRecord],
    entries: &[IngressEntry],
) -> Plan {
    let mut skipped = Vec::new();

    // Restrict to records we own: those pointing at a managed frontend.
    let targets: HashSet<String> = frontends
        .values()
        .flat_map(|d| {
            [Some(normalise(&d.dns_name)), d.ip.as_deref().map(normalise)]
        })
        .flatten()
        .filter(|t| !t.is_empty())
        .collect();
    let managed: BTreeMap<String, &ConsolidatedRecord> = existing
        .iter()
        .filter(|r| targets.contains(&normalise(&r.points_to)))
        .map(|r| (normalise(&r.name), r))
        .collect();
    for record in existing {
        if !managed.contains_key(&normalise(&record.name)) {
            debug!("leaving unmanaged record {} untouched", record.name);
        }
    }

    // host -> entry scheme, first (sorted) entry wins; a second entry for
    // the same host with a different scheme is a conflict.
    let mut sorted: Vec<&IngressEntry> = entries.iter().collect();
    sorted.sort();
    let mut host_to_scheme: BTreeMap<String, LbScheme> = BTreeMap::new();
    for entry in sorted {
        let Some(fqdn) = fqdn_in_zone(&entry.host, zone) else {
            debug!("host {} is outside zone {zone}, skipping", entry.host);
            skipped.push((entry.host.clone(), "outside-zone"));
            continue;
        };
        if !frontends.contains_key(&entry.lb_scheme) {
            skipped.push((entry.host.clone(), "unknown-scheme"));
            continue;
        }
        match host_to_scheme.get(&fqdn) {
            None => {
                host_to_scheme.insert(fqdn, entry.lb_scheme);
            }
            Some(scheme) if *scheme != entry.lb_scheme => {
                skipped.push((entry.host.clone(), "conflicting-scheme"));
            }
            Some(_) => {}
        }
    }

    let mut units: Vec<ChangeUnit> = Vec::new();

    // Upserts for hosts whose record is missing or wrong.
    for (fqdn, scheme) in &host_to_scheme {
        let details = &frontends[scheme];
        let (points_to, ttl, alias_hosted_zone) = match style {
            RecordStyle::AliasA => (
                normalise(&details.dns_name),
                None,
                details.hosted_zone_id.clone(),
            ),
            RecordStyle::Cname { ttl } => (normalise(&details.dns_name), Some(ttl), None),
            RecordStyle::PlainA { ttl } => (
                normalise(details.ip.as_deref().unwrap_or(&details.dns_name)),
                Some(ttl),
                None,
            ),
        };
        let desired = ConsolidatedRecord {
            name: fqdn.clone(),
            points_to,
            alias_hosted_zone,
            ttl,
        };

        match managed.get(fqdn) {
            Some(current)
                if current.points_to == desired.points_to && current.ttl == desired.ttl =>
            {
                continue;
            }
            Some(current) => {
                // Replacement: the deletion of the old record travels with
                // the new one so the rename is atomic within its batch.
                units.push(vec![
                    RecordChange {
                        action: ChangeAction::Delete,
                        record: (*current).clone(),
                    },
                    RecordChange {
                        action: replacement_action(style),
                        record: desired,
                    },
                ]);
            }
            None => {
                units.push(vec![RecordChange {
                    action: replacement_action(style),
                    record: desired,
                }]);
            }
        }
    }

    // Deletions for managed records whose host is gone.
    for (name, record) in &managed {
        if !host_to_scheme.contains_key(name) {
            info!("record {name} no longer backed by an ingress, deleting");
            units.push(vec![RecordChange {
                action: ChangeAction::Delete,
                record: (*record).clone(),
            }]);
        }
    }

    Plan {
        units,
        managed: managed.len(),
        skipped,
    }
}

fn replacement_action(style: RecordStyle) -> ChangeAction {
    match style {
        // Cloud DNS has no upsert; additions and deletions are explicit.
        RecordStyle::PlainA { .. } => ChangeAction::Create,
        RecordStyle::AliasA | RecordStyle::Cname { .. } => ChangeAction::Upsert,
    }
}

/// Pack units into batches of at most `max` operations, preserving order and
/// never splitting a unit.
pub fn batch(units: Vec<ChangeUnit>, max: usize) -> Vec<Vec<RecordChange>> {
    let mut batches = Vec::new();
    let mut current: Vec<RecordChange> = Vec::new();
    for unit in units {
        if !current.is_empty() && current.len() + unit.len() > max {
            batches.push(std::mem::take(&mut current));
        }
        current.extend(unit);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::FrontendDetails;
    use chrono::{TimeZone, Utc};

    fn entry(host: &str, scheme: LbScheme) -> IngressEntry {
        IngressEntry {
            namespace: "default".into(),
            name: format!("ing-{host}"),
            host: host.into(),
            path: "/".into(),
            service_address: "10.254.0.1".into(),
            service_port: 8080,
            allow: vec![],
            strip_path: false,
            exact_path: false,
            lb_scheme: scheme,
            ingress_class: None,
            backend_connect_timeout_seconds: 1,
            backend_timeout_seconds: 10,
            backend_keepalive_seconds: None,
            backend_max_connections: 0,
            backend_max_requests_per_connection: 1024,
            proxy_buffer_size_kb: 4,
            proxy_buffer_blocks: 4,
            created: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            resource_version: None,
            status_hostnames: vec![],
        }
    }

    fn frontends() -> FrontendMapping {
        FrontendMapping::from([
            (
                LbScheme::Internal,
                FrontendDetails {
                    dns_name: "internal-lb.example.com".into(),
                    hosted_zone_id: Some("Z-LB-INT".into()),
                    ip: None,
                },
            ),
            (
                LbScheme::InternetFacing,
                FrontendDetails {
                    dns_name: "public-lb.example.com".into(),
                    hosted_zone_id: Some("Z-LB-EXT".into()),
                    ip: None,
                },
            ),
        ])
    }

    fn cname(name: &str, points_to: &str, ttl: i64) -> ConsolidatedRecord {
        ConsolidatedRecord {
            name: name.into(),
            points_to: points_to.into(),
            alias_hosted_zone: None,
            ttl: Some(ttl),
        }
    }

    #[test]
    fn replaces_stale_cname_with_paired_delete_and_upsert() {
        let existing = vec![cname("a.example.com", "old-lb.example.com", 60)];
        let frontends = FrontendMapping::from([(
            LbScheme::Internal,
            FrontendDetails {
                dns_name: "old-lb.example.com".into(),
                hosted_zone_id: None,
                ip: None,
            },
        ), (
            LbScheme::InternetFacing,
            FrontendDetails {
                dns_name: "new-lb.example.com".into(),
                hosted_zone_id: None,
                ip: None,
            },
        )]);
        let entries = vec![entry("a.example.com", LbScheme::InternetFacing)];

        let plan = compute(
            "example.com",
            RecordStyle::Cname { ttl: 300 },
            &frontends,
            &existing,
            &entries,
        );

        assert_eq!(plan.units.len(), 1);
        let unit = &plan.units[0];
        assert_eq!(unit.len(), 2);
        assert_eq!(unit[0].action, ChangeAction::Delete);
        assert_eq!(unit[0].record.points_to, "old-lb.example.com");
        assert_eq!(unit[1].action, ChangeAction::Upsert);
        assert_eq!(unit[1].record.points_to, "new-lb.example.com");
        assert_eq!(unit[1].record.ttl, Some(300));
    }

    #[test]
    fn ttl_change_alone_forces_a_replacement() {
        // Same target, but the record predates the configured TTL.
        let existing = vec![cname("a.example.com", "internal-lb.example.com", 60)];
        let entries = vec![entry("a.example.com", LbScheme::Internal)];

        let plan = compute(
            "example.com",
            RecordStyle::Cname { ttl: 300 },
            &frontends(),
            &existing,
            &entries,
        );

        assert_eq!(plan.units.len(), 1);
        let unit = &plan.units[0];
        assert_eq!(unit[0].action, ChangeAction::Delete);
        assert_eq!(unit[0].record.ttl, Some(60));
        assert_eq!(unit[1].action, ChangeAction::Upsert);
        assert_eq!(unit[1].record.ttl, Some(300));
    }

    #[test]
    fn fresh_alias_upserts_without_preceding_delete() {
        let entries = vec![entry("a.example.com", LbScheme::Internal)];
        let plan = compute("example.com", RecordStyle::AliasA, &frontends(), &[], &entries);
        assert_eq!(plan.units.len(), 1);
        assert_eq!(plan.units[0].len(), 1);
        assert_eq!(plan.units[0][0].action, ChangeAction::Upsert);
        assert_eq!(
            plan.units[0][0].record.alias_hosted_zone.as_deref(),
            Some("Z-LB-INT")
        );
    }

    #[test]
    fn matching_record_yields_no_change() {
        let existing = vec![ConsolidatedRecord {
            name: "a.example.com".into(),
            points_to: "internal-lb.example.com".into(),
            alias_hosted_zone: Some("Z-LB-INT".into()),
            ttl: None,
        }];
        let entries = vec![entry("a.example.com", LbScheme::Internal)];
        let plan = compute(
            "example.com",
            RecordStyle::AliasA,
            &frontends(),
            &existing,
            &entries,
        );
        assert!(plan.units.is_empty());
        assert_eq!(plan.managed, 1);
    }

    #[test]
    fn orphaned_managed_records_are_deleted_but_foreign_ones_kept() {
        let existing = vec![
            cname("gone.example.com", "internal-lb.example.com", 300),
            cname("foreign.example.com", "somebody-else.example.net", 300),
        ];
        let plan = compute(
            "example.com",
            RecordStyle::Cname { ttl: 300 },
            &frontends(),
            &existing,
            &[],
        );
        assert_eq!(plan.units.len(), 1);
        assert_eq!(plan.units[0][0].action, ChangeAction::Delete);
        assert_eq!(plan.units[0][0].record.name, "gone.example.com");
    }

    #[test]
    fn hosts_outside_the_zone_are_skipped() {
        let entries = vec![
            entry("a.example.com", LbScheme::Internal),
            entry("b.other-zone.net", LbScheme::Internal),
        ];
        let plan = compute("example.com", RecordStyle::AliasA, &frontends(), &[], &entries);
        assert_eq!(plan.units.len(), 1);
        assert_eq!(
            plan.skipped,
            vec![("b.other-zone.net".to_string(), "outside-zone")]
        );
    }

    #[test]
    fn bare_hosts_gain_the_zone_suffix() {
        let entries = vec![entry("api", LbScheme::Internal)];
        let plan = compute("example.com.", RecordStyle::AliasA, &frontends(), &[], &entries);
        assert_eq!(plan.units[0][0].record.name, "api.example.com");
    }

    #[test]
    fn conflicting_schemes_keep_first_and_report_skip() {
        let mut first = entry("a.example.com", LbScheme::Internal);
        first.name = "ing-a".into();
        let mut second = entry("a.example.com", LbScheme::InternetFacing);
        second.name = "ing-b".into();

        let plan = compute(
            "example.com",
            RecordStyle::AliasA,
            &frontends(),
            &[],
            &[second, first],
        );
        assert_eq!(plan.units.len(), 1);
        assert_eq!(
            plan.units[0][0].record.points_to,
            "internal-lb.example.com"
        );
        assert_eq!(
            plan.skipped,
            vec![("a.example.com".to_string(), "conflicting-scheme")]
        );
    }

    #[test]
    fn batches_split_at_the_limit_without_splitting_units() {
        // 51 replacement units of two ops each against a 100-op limit: the
        // 50th unit would straddle the boundary and must move wholesale.
        let units: Vec<ChangeUnit> = (0..51)
            .map(|i| {
                vec![
                    RecordChange {
                        action: ChangeAction::Delete,
                        record: cname(&format!("h{i}.example.com"), "old", 60),
                    },
                    RecordChange {
                        action: ChangeAction::Upsert,
                        record: cname(&format!("h{i}.example.com"), "new", 300),
                    },
                ]
            })
            .collect();

        let batches = batch(units, 100);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 100);
        assert_eq!(batches[1].len(), 2);
        // The split batch still starts with the delete of its pair.
        assert_eq!(batches[1][0].action, ChangeAction::Delete);
    }

    #[test]
    fn plain_a_replacement_uses_create_and_delete() {
        let existing = vec![ConsolidatedRecord {
            name: "a.example.com".into(),
            points_to: "10.1.1.1".into(),
            alias_hosted_zone: None,
            ttl: Some(300),
        }];
        let frontends = FrontendMapping::from([(
            LbScheme::Internal,
            FrontendDetails {
                dns_name: "10.2.2.2".into(),
                hosted_zone_id: None,
                ip: Some("10.2.2.2".into()),
            },
        )]);
        let entries = vec![entry("a.example.com", LbScheme::Internal)];

        let plan = compute(
            "example.com",
            RecordStyle::PlainA { ttl: 300 },
            &frontends,
            &existing,
            &entries,
        );
        let unit = &plan.units[0];
        assert_eq!(unit[0].action, ChangeAction::Delete);
        assert_eq!(unit[1].action, ChangeAction::Create);
        assert_eq!(unit[1].record.points_to, "10.2.2.2");
    }
}
