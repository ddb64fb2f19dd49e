//! OSV advisory feed: wire model, archive fetch and store ingestion
//!
//! Each ecosystem publishes an `all.zip` archive of advisory documents.
//! Advisories identify packages by ecosystem naming conventions and
//! reference CVEs through their id or alias list; they link identities to
//! vulnerability rows already ingested from the CVE feed and never create
//! CVE rows themselves.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use super::IngestStats;
use crate::identity::{CpeWfn, Ecosystem, normalize_identity};
use crate::store::{self, VulnStore};

/// One advisory document
#[derive(Debug, Deserialize)]
pub struct OsvAdvisory {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub affected: Vec<OsvAffected>,
}

#[derive(Debug, Deserialize)]
pub struct OsvAffected {
    #[serde(default)]
    pub package: Option<OsvPackage>,
    #[serde(default)]
    pub versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct OsvPackage {
    #[serde(default)]
    pub ecosystem: String,
    #[serde(default)]
    pub name: String,
}

impl OsvAdvisory {
    /// The CVE this advisory resolves to: the primary id when CVE-shaped,
    /// otherwise the first CVE alias.
    pub fn cve_id(&self) -> Option<&str> {
        if self.id.starts_with("CVE-") {
            return Some(&self.id);
        }
        self.aliases
            .iter()
            .map(String::as_str)
            .find(|a| a.starts_with("CVE-"))
    }
}

/// One advisory ingestion run. Owns the CVE row cache, which is scoped to
/// the run so repeated runs never see stale entries.
pub struct OsvIngest<'a> {
    store: &'a VulnStore,
    cve_rows: HashMap<String, i64>,
}

impl<'a> OsvIngest<'a> {
    pub fn new(store: &'a VulnStore) -> Self {
        Self {
            store,
            cve_rows: HashMap::new(),
        }
    }

    fn resolve_vulnerability(&mut self, cve_id: &str) -> anyhow::Result<Option<i64>> {
        if let Some(&id) = self.cve_rows.get(cve_id) {
            return Ok(Some(id));
        }
        let found = self.store.lookup_by_cve(cve_id)?;
        if let Some(id) = found {
            self.cve_rows.insert(cve_id.to_string(), id);
        }
        Ok(found)
    }

    /// Ingest one advisory in its own transaction.
    ///
    /// Returns the number of identity links written; zero means the
    /// advisory was skipped (no CVE id, CVE unknown to the store, outside
    /// the modification window, or no affected package in the ecosystem).
    pub fn ingest_advisory(
        &mut self,
        ecosystem: Ecosystem,
        advisory: &OsvAdvisory,
        modified_since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<usize> {
        if let (Some(cutoff), Some(modified)) = (modified_since, advisory.modified)
            && modified < cutoff
        {
            return Ok(0);
        }
        let Some(cve_id) = advisory.cve_id() else {
            return Ok(0);
        };
        let Some(vuln_id) = self.resolve_vulnerability(cve_id)? else {
            return Ok(0);
        };

        self.store.with_transaction(|tx| {
            let mut linked = 0;
            for affected in &advisory.affected {
                let Some(package) = &affected.package else {
                    continue;
                };
                if package.ecosystem != ecosystem.osv_name() {
                    continue;
                }
                let (vendor, product) = normalize_identity(ecosystem, &package.name);
                for version in &affected.versions {
                    let identity = CpeWfn {
                        part: Some("a".to_string()),
                        vendor: Some(vendor.clone()),
                        product: Some(product.clone()),
                        version: Some(version.clone()),
                        target_hw: Some(ecosystem.tag().to_string()),
                        ..CpeWfn::default()
                    };
                    let product_id = store::upsert_product(tx, &identity)?;
                    store::link(tx, vuln_id, product_id)?;
                    linked += 1;
                }
            }
            Ok(linked)
        })
    }

    /// Ingest every advisory file in an extracted archive directory.
    pub fn ingest_dir(
        &mut self,
        ecosystem: Ecosystem,
        dir: &Path,
        modified_since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<IngestStats> {
        let mut stats = IngestStats::default();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let ingested = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|content| Ok(serde_json::from_str::<OsvAdvisory>(&content)?))
                .and_then(|advisory| self.ingest_advisory(ecosystem, &advisory, modified_since));
            match ingested {
                Ok(linked) => {
                    stats.documents += 1;
                    stats.identities += linked;
                }
                Err(err) => {
                    stats.documents_failed += 1;
                    tracing::warn!(file = %path.display(), "skipping advisory: {err}");
                }
            }
        }
        Ok(stats)
    }
}

/// Archive client for the per-ecosystem advisory dumps
pub struct OsvClient {
    client: Arc<Client>,
    base_url: String,
}

impl OsvClient {
    pub fn new(client: Arc<Client>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Download and extract one ecosystem's `all.zip`, returning the
    /// directory of advisory files. The directory is wiped first so stale
    /// advisories from an earlier dump cannot linger.
    pub async fn fetch_ecosystem(
        &self,
        ecosystem: Ecosystem,
        cache_root: &Path,
    ) -> anyhow::Result<PathBuf> {
        let url = format!("{}/{}/all.zip", self.base_url, ecosystem.osv_name());
        tracing::info!(ecosystem = ecosystem.tag(), %url, "fetching advisory archive");

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let body = response.bytes().await?;

        let dir = cache_root.join(format!("osv_{}", ecosystem.tag()));
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;

        let mut archive = zip::ZipArchive::new(Cursor::new(body.as_ref()))?;
        archive.extract(&dir)?;
        Ok(dir)
    }
}

/// Run one advisory ingestion over the given ecosystems, strictly
/// sequentially. A failed ecosystem archive is logged and skipped; the
/// run continues with the rest.
pub async fn run(
    store: &VulnStore,
    client: &OsvClient,
    cache_root: &Path,
    ecosystems: &[Ecosystem],
    modified_since: Option<DateTime<Utc>>,
) -> anyhow::Result<IngestStats> {
    let mut ingest = OsvIngest::new(store);
    let mut stats = IngestStats::default();
    for &ecosystem in ecosystems {
        let dir = match client.fetch_ecosystem(ecosystem, cache_root).await {
            Ok(dir) => dir,
            Err(err) => {
                tracing::warn!(ecosystem = ecosystem.tag(), "archive fetch failed: {err}");
                continue;
            }
        };
        let eco_stats = ingest.ingest_dir(ecosystem, &dir, modified_since)?;
        tracing::info!(
            ecosystem = ecosystem.tag(),
            documents = eco_stats.documents,
            identities = eco_stats.identities,
            "advisories ingested"
        );
        stats.absorb(eco_stats);
    }
    Ok(stats)
}
