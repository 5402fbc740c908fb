use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::plan::{ChangeAction, ConsolidatedRecord, RecordChange};
use super::DnsProvider;
use crate::frontend::CLOUD_API_TIMEOUT;
use crate::{Error, Result};

const METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";
const DNS_BASE: &str = "https://dns.googleapis.com/dns/v1";

/// Cloud DNS enforces at most 100 operations per change.
const MAX_BATCH: usize = 100;

/// Cloud DNS provider: plain single-datum A records at the configured TTL.
/// Replacements are expressed as explicit addition/deletion pairs, which the
/// planner keeps within one change for atomicity.
pub struct CloudDnsProvider {
    client: reqwest::Client,
    project: String,
    managed_zone: String,
    ttl: i64,
}

impl CloudDnsProvider {
    pub async fn new(managed_zone: String, ttl: i64) -> Result<Self> {
        let client = reqwest::Client::new();
        let project = metadata(&client, "project/project-id").await?;
        Ok(Self {
            client,
            project,
            managed_zone,
            ttl,
        })
    }

    fn zone_url(&self) -> String {
        format!(
            "{DNS_BASE}/projects/{}/managedZones/{}",
            self.project, self.managed_zone
        )
    }

    async fn token(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct Token {
            access_token: String,
        }
        let token: Token = self
            .client
            .get(format!(
                "{METADATA_BASE}/instance/service-accounts/default/token"
            ))
            .header("Metadata-Flavor", "Google")
            .timeout(CLOUD_API_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(token.access_token)
    }
}

async fn metadata(client: &reqwest::Client, path: &str) -> Result<String> {
    let value = client
        .get(format!("{METADATA_BASE}/{path}"))
        .header("Metadata-Flavor", "Google")
        .timeout(CLOUD_API_TIMEOUT)
        .send()
        .await
        .map_err(|e| Error::Discovery(format!("metadata {path}: {e}")))?
        .error_for_status()
        .map_err(|e| Error::Discovery(format!("metadata {path}: {e}")))?
        .text()
        .await
        .map_err(|e| Error::Discovery(format!("metadata {path}: {e}")))?;
    Ok(value.trim().to_string())
}

#[derive(Deserialize)]
struct ManagedZone {
    #[serde(rename = "dnsName")]
    dns_name: String,
}

#[derive(Deserialize)]
struct RrsetPage {
    #[serde(default)]
    rrsets: Vec<Rrset>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize, Serialize)]
struct Rrset {
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    ttl: i64,
    #[serde(default)]
    rrdatas: Vec<String>,
}

impl Rrset {
    fn from_record(record: &ConsolidatedRecord, default_ttl: i64) -> Self {
        Self {
            name: format!("{}.", record.name.trim_end_matches('.')),
            record_type: "A".to_string(),
            ttl: record.ttl.unwrap_or(default_ttl),
            rrdatas: vec![record.points_to.clone()],
        }
    }
}

#[async_trait]
impl DnsProvider for CloudDnsProvider {
    async fn zone_domain(&self) -> Result<String> {
        let token = self.token().await?;
        let zone: ManagedZone = self
            .client
            .get(self.zone_url())
            .bearer_auth(token)
            .timeout(CLOUD_API_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Discovery(format!("managed zone {}: {e}", self.managed_zone)))?
            .json()
            .await?;
        Ok(zone.dns_name)
    }

    async fn list(&self) -> Result<Vec<ConsolidatedRecord>> {
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let url = match &page_token {
                Some(token) => format!("{}/rrsets?pageToken={token}", self.zone_url()),
                None => format!("{}/rrsets", self.zone_url()),
            };
            let token = self.token().await?;
            let page: RrsetPage = self
                .client
                .get(&url)
                .bearer_auth(token)
                .timeout(CLOUD_API_TIMEOUT)
                .send()
                .await?
                .error_for_status()
                .map_err(|e| Error::Dns(format!("listing rrsets: {e}")))?
                .json()
                .await?;

            for rrset in page.rrsets {
                if rrset.record_type != "A" || rrset.rrdatas.len() != 1 {
                    debug!("ignoring record {} of foreign shape", rrset.name);
                    continue;
                }
                records.push(ConsolidatedRecord {
                    name: rrset.name.trim_end_matches('.').to_lowercase(),
                    points_to: rrset.rrdatas[0].clone(),
                    alias_hosted_zone: None,
                    ttl: Some(rrset.ttl),
                });
            }

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(records)
    }

    async fn apply(&self, changes: &[RecordChange]) -> Result<()> {
        let mut additions = Vec::new();
        let mut deletions = Vec::new();
        for change in changes {
            let rrset = Rrset::from_record(&change.record, self.ttl);
            match change.action {
                ChangeAction::Create | ChangeAction::Upsert => additions.push(rrset),
                ChangeAction::Delete => deletions.push(rrset),
            }
        }

        let token = self.token().await?;
        let url = format!("{}/changes", self.zone_url());
        self.client
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "additions": additions, "deletions": deletions }))
            .timeout(CLOUD_API_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Dns(format!("applying change: {e}")))?;
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        MAX_BATCH
    }
}
