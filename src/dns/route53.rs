use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_route53::types::{
    AliasTarget, Change, ChangeAction as AwsChangeAction, ChangeBatch, ResourceRecord,
    ResourceRecordSet, RrType,
};
use aws_sdk_route53::Client;
use tracing::debug;

use super::plan::{ChangeAction, ConsolidatedRecord, RecordChange};
use super::DnsProvider;
use crate::{Error, Result};

/// Route 53 provider: A-alias records for discovered ELBs/ALBs, CNAMEs at
/// the configured TTL in static-hostname mode.
pub struct Route53Provider {
    client: Client,
    hosted_zone_id: String,
    cname_ttl: i64,
}

impl Route53Provider {
    pub async fn new(hosted_zone_id: String, cname_ttl: i64, api_retries: u32) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .retry_config(RetryConfig::standard().with_max_attempts(api_retries))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(crate::frontend::CLOUD_API_TIMEOUT)
                    .build(),
            )
            .load()
            .await;
        Self {
            client: Client::new(&config),
            hosted_zone_id,
            cname_ttl,
        }
    }

    fn to_record_set(&self, record: &ConsolidatedRecord) -> Result<ResourceRecordSet> {
        let name = format!("{}.", record.name.trim_end_matches('.'));
        let builder = match &record.alias_hosted_zone {
            Some(alias_zone) => ResourceRecordSet::builder()
                .name(name)
                .r#type(RrType::A)
                .alias_target(
                    AliasTarget::builder()
                        .hosted_zone_id(alias_zone)
                        .dns_name(format!("{}.", record.points_to.trim_end_matches('.')))
                        .evaluate_target_health(false)
                        .build()
                        .map_err(|e| Error::Dns(format!("building alias target: {e}")))?,
                ),
            None => ResourceRecordSet::builder()
                .name(name)
                .r#type(RrType::Cname)
                .ttl(record.ttl.unwrap_or(self.cname_ttl))
                .resource_records(
                    ResourceRecord::builder()
                        .value(&record.points_to)
                        .build()
                        .map_err(|e| Error::Dns(format!("building resource record: {e}")))?,
                ),
        };
        builder
            .build()
            .map_err(|e| Error::Dns(format!("building record set: {e}")))
    }
}

fn trim_name(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

#[async_trait]
impl DnsProvider for Route53Provider {
    async fn zone_domain(&self) -> Result<String> {
        let zone = self
            .client
            .get_hosted_zone()
            .id(&self.hosted_zone_id)
            .send()
            .await
            .map_err(|e| Error::Discovery(format!("GetHostedZone {}: {e}", self.hosted_zone_id)))?;
        zone.hosted_zone()
            .map(|z| z.name().to_string())
            .ok_or_else(|| {
                Error::Discovery(format!("hosted zone {} not found", self.hosted_zone_id))
            })
    }

    async fn list(&self) -> Result<Vec<ConsolidatedRecord>> {
        let mut records = Vec::new();
        let mut start_name: Option<String> = None;
        let mut start_type: Option<RrType> = None;
        loop {
            let resp = self
                .client
                .list_resource_record_sets()
                .hosted_zone_id(&self.hosted_zone_id)
                .set_start_record_name(start_name.take())
                .set_start_record_type(start_type.take())
                .send()
                .await
                .map_err(|e| Error::Dns(format!("ListResourceRecordSets: {e}")))?;

            for rrs in resp.resource_record_sets() {
                match (rrs.r#type(), rrs.alias_target()) {
                    (RrType::A, Some(alias)) => records.push(ConsolidatedRecord {
                        name: trim_name(rrs.name()),
                        points_to: trim_name(alias.dns_name()),
                        alias_hosted_zone: Some(alias.hosted_zone_id().to_string()),
                        ttl: None,
                    }),
                    // Ownership is decided later by where the record points;
                    // a stale CNAME at another TTL must still be replaceable.
                    (RrType::Cname, None) => {
                        let Some(value) = rrs.resource_records().first() else {
                            continue;
                        };
                        records.push(ConsolidatedRecord {
                            name: trim_name(rrs.name()),
                            points_to: trim_name(value.value()),
                            alias_hosted_zone: None,
                            ttl: rrs.ttl(),
                        });
                    }
                    _ => debug!("ignoring record {} of foreign type", rrs.name()),
                }
            }

            if !resp.is_truncated() {
                break;
            }
            start_name = resp.next_record_name().map(str::to_string);
            start_type = resp.next_record_type().cloned();
        }
        Ok(records)
    }

    async fn apply(&self, changes: &[RecordChange]) -> Result<()> {
        let mut aws_changes = Vec::with_capacity(changes.len());
        for change in changes {
            let action = match change.action {
                ChangeAction::Create => AwsChangeAction::Create,
                ChangeAction::Upsert => AwsChangeAction::Upsert,
                ChangeAction::Delete => AwsChangeAction::Delete,
            };
            aws_changes.push(
                Change::builder()
                    .action(action)
                    .resource_record_set(self.to_record_set(&change.record)?)
                    .build()
                    .map_err(|e| Error::Dns(format!("building change: {e}")))?,
            );
        }

        let batch = ChangeBatch::builder()
            .set_changes(Some(aws_changes))
            .build()
            .map_err(|e| Error::Dns(format!("building change batch: {e}")))?;
        self.client
            .change_resource_record_sets()
            .hosted_zone_id(&self.hosted_zone_id)
            .change_batch(batch)
            .send()
            .await
            .map_err(|e| Error::Dns(format!("ChangeResourceRecordSets: {e}")))?;
        Ok(())
    }
}
