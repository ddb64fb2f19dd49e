//! NVD CVE feed: wire model, paging downloader and store ingestion
//!
//! The CVE API serves paged JSON documents; each page is cached on disk as
//! `nvd_chunk_<start>.json` and ingested in its own transaction. Identities
//! come from the CPE match criteria of each record's configurations.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use rusqlite::Connection;
use serde::Deserialize;

use super::{IngestMode, IngestStats};
use crate::identity::parse_cpe;
use crate::store::{self, VulnScores, VulnStore};

const PAGE_SIZE: u64 = 2000;
const DOWNLOAD_RETRIES: u32 = 3;
const RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Cached chunk files smaller than this are considered truncated downloads
/// and fetched again.
const MIN_CHUNK_BYTES: u64 = 1000;

/// One page of the CVE API
#[derive(Debug, Deserialize)]
pub struct NvdResponse {
    #[serde(default)]
    pub vulnerabilities: Vec<NvdItem>,
    #[serde(rename = "totalResults", default)]
    pub total_results: u64,
}

#[derive(Debug, Deserialize)]
pub struct NvdItem {
    pub cve: CveRecord,
}

#[derive(Debug, Deserialize)]
pub struct CveRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub descriptions: Vec<LangString>,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub configurations: Vec<Configuration>,
}

#[derive(Debug, Deserialize)]
pub struct LangString {
    pub lang: String,
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Metrics {
    #[serde(rename = "cvssMetricV31", default)]
    pub cvss_v31: Vec<CvssMetric>,
    #[serde(rename = "cvssMetricV40", default)]
    pub cvss_v40: Vec<CvssMetric>,
}

#[derive(Debug, Deserialize)]
pub struct CvssMetric {
    #[serde(rename = "cvssData")]
    pub cvss_data: CvssData,
}

#[derive(Debug, Deserialize)]
pub struct CvssData {
    #[serde(rename = "baseScore")]
    pub base_score: Option<f64>,
    #[serde(rename = "baseSeverity")]
    pub base_severity: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub nodes: Vec<Node>,
}

#[derive(Debug, Deserialize)]
pub struct Node {
    #[serde(rename = "cpeMatch", default)]
    pub cpe_match: Vec<CpeMatch>,
}

#[derive(Debug, Deserialize)]
pub struct CpeMatch {
    #[serde(default)]
    pub vulnerable: bool,
    pub criteria: String,
}

impl CveRecord {
    /// English description when present, otherwise the first one.
    fn description(&self) -> &str {
        self.descriptions
            .iter()
            .find(|d| d.lang == "en")
            .or_else(|| self.descriptions.first())
            .map(|d| d.value.as_str())
            .unwrap_or("")
    }

    fn scores(&self) -> VulnScores {
        let v31 = self.metrics.cvss_v31.first().map(|m| &m.cvss_data);
        let v40 = self.metrics.cvss_v40.first().map(|m| &m.cvss_data);
        VulnScores {
            cvss_v31_score: v31.and_then(|d| d.base_score),
            cvss_v31_severity: v31.and_then(|d| d.base_severity.clone()),
            cvss_v40_score: v40.and_then(|d| d.base_score),
            cvss_v40_severity: v40.and_then(|d| d.base_severity.clone()),
        }
    }

    /// Deduplicated CPE criteria marked vulnerable.
    fn vulnerable_cpes(&self) -> BTreeSet<&str> {
        self.configurations
            .iter()
            .flat_map(|c| &c.nodes)
            .flat_map(|n| &n.cpe_match)
            .filter(|m| m.vulnerable)
            .map(|m| m.criteria.as_str())
            .collect()
    }
}

/// Ingest one feed document. Runs inside the caller's transaction; counts
/// written vulnerabilities and identity links.
pub fn ingest_response(conn: &Connection, doc: &NvdResponse) -> anyhow::Result<(usize, usize)> {
    let mut vulns = 0;
    let mut identities = 0;
    for item in &doc.vulnerabilities {
        let cve = &item.cve;
        // a record without a CVE id is never persisted
        if cve.id.is_empty() {
            continue;
        }
        let vuln_id = store::upsert_vulnerability(conn, &cve.id, cve.description(), &cve.scores())?;
        vulns += 1;

        for criteria in cve.vulnerable_cpes() {
            let wfn = parse_cpe(criteria);
            // wildcard product or version cannot be matched, skip the identity
            if !wfn.is_matchable() {
                continue;
            }
            let product_id = store::upsert_product(conn, &wfn)?;
            store::link(conn, vuln_id, product_id)?;
            identities += 1;
        }
    }
    Ok((vulns, identities))
}

/// Ingest every cached chunk file in start-index order, one transaction per
/// file. A file that fails to parse or ingest is rolled back and skipped.
pub fn load_dir(store: &VulnStore, dir: &Path) -> anyhow::Result<IngestStats> {
    let mut stats = IngestStats::default();
    for path in chunk_files(dir)? {
        let ingested = std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|content| Ok(serde_json::from_str::<NvdResponse>(&content)?))
            .and_then(|doc| store.with_transaction(|tx| ingest_response(tx, &doc)));
        match ingested {
            Ok((vulns, identities)) => {
                stats.documents += 1;
                stats.vulnerabilities += vulns;
                stats.identities += identities;
            }
            Err(err) => {
                stats.documents_failed += 1;
                tracing::warn!(file = %path.display(), "skipping CVE chunk: {err}");
            }
        }
    }
    Ok(stats)
}

/// Chunk files sorted by the start index embedded in their name.
fn chunk_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort_by_key(|p| {
        p.file_stem()
            .and_then(|s| s.to_str())
            .map(|s| {
                s.chars()
                    .filter(char::is_ascii_digit)
                    .collect::<String>()
                    .parse::<u64>()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    });
    Ok(files)
}

/// Paging client for the CVE API
pub struct NvdClient {
    client: Arc<Client>,
    base_url: String,
    api_key: Option<String>,
}

impl NvdClient {
    pub fn new(client: Arc<Client>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    /// Politeness interval between pages; the API allows a faster cadence
    /// with a key.
    fn page_delay(&self) -> Duration {
        if self.api_key.is_some() {
            Duration::from_millis(600)
        } else {
            Duration::from_secs(6)
        }
    }

    fn request(&self, params: &[(&str, String)]) -> reqwest::RequestBuilder {
        let mut req = self.client.get(&self.base_url).query(params);
        if let Some(key) = &self.api_key {
            req = req.header("apiKey", key);
        }
        req
    }

    /// Download all pages for the mode into `dir`.
    ///
    /// Full mode keeps chunk files already on disk (resumable over multiple
    /// runs); incremental mode starts from a clean directory and restricts
    /// the query to the modification window. Returns false when the feed
    /// reports nothing to fetch or the initial probe fails.
    pub async fn download(&self, dir: &Path, mode: IngestMode) -> anyhow::Result<bool> {
        if mode != IngestMode::Full && dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(dir)?;

        let mut params: Vec<(&str, String)> = vec![
            ("resultsPerPage", PAGE_SIZE.to_string()),
            ("startIndex", "0".to_string()),
        ];
        if let Some(start) = mode.window_start(Utc::now()) {
            let fmt = "%Y-%m-%dT%H:%M:%S.000";
            params.push(("lastModStartDate", start.format(fmt).to_string()));
            params.push(("lastModEndDate", Utc::now().format(fmt).to_string()));
            tracing::info!(days = ?mode, "incremental CVE window");
        }

        // probe for the total before paging
        let mut probe = params.clone();
        probe[0].1 = "1".to_string();
        let total = match self.fetch_total(&probe).await {
            Ok(total) => total,
            Err(err) => {
                tracing::warn!("CVE feed probe failed: {err}");
                return Ok(false);
            }
        };
        tracing::info!(total, "CVE records reported by the feed");
        if total == 0 {
            return Ok(false);
        }

        let mut first = true;
        for start_index in (0..total).step_by(PAGE_SIZE as usize) {
            let path = dir.join(format!("nvd_chunk_{start_index}.json"));
            if mode == IngestMode::Full
                && path
                    .metadata()
                    .is_ok_and(|meta| meta.len() > MIN_CHUNK_BYTES)
            {
                continue;
            }
            if !first {
                tokio::time::sleep(self.page_delay()).await;
            }
            first = false;

            params[1].1 = start_index.to_string();
            if let Err(err) = self.fetch_page(&params, &path).await {
                tracing::warn!(start_index, "CVE page failed after retries: {err}");
            }
        }
        Ok(true)
    }

    async fn fetch_total(&self, params: &[(&str, String)]) -> anyhow::Result<u64> {
        let response = self.request(params).send().await?.error_for_status()?;
        let page: NvdResponse = response.json().await?;
        Ok(page.total_results)
    }

    async fn fetch_page(&self, params: &[(&str, String)], path: &Path) -> anyhow::Result<()> {
        let mut last_err = None;
        for attempt in 0..DOWNLOAD_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            match self.try_fetch_page(params, path).await {
                Ok(()) => return Ok(()),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.expect("at least one attempt"))
    }

    async fn try_fetch_page(&self, params: &[(&str, String)], path: &Path) -> anyhow::Result<()> {
        let response = self.request(params).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        std::fs::write(path, &body)?;
        Ok(())
    }
}

/// Run one CVE feed ingestion: download, reset on full reload, load.
pub async fn run(
    store: &VulnStore,
    client: &NvdClient,
    cache_root: &Path,
    mode: IngestMode,
) -> anyhow::Result<IngestStats> {
    let dir = cache_root.join(match mode {
        IngestMode::Full => "nvd_cache",
        IngestMode::Incremental { .. } => "nvd_cache_inc",
    });
    let has_data = client.download(&dir, mode).await?;
    if !has_data && matches!(mode, IngestMode::Incremental { .. }) {
        tracing::info!("no CVE updates in the window");
        return Ok(IngestStats::default());
    }
    if mode == IngestMode::Full {
        store.reset()?;
    }
    load_dir(store, &dir)
}
