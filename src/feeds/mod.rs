//! Vulnerability feed ingestion
//!
//! Two pipelines populate the store: the NVD CVE feed (identities parsed
//! from CPE strings) and the OSV per-ecosystem advisory archives
//! (identities derived from package names). Documents are processed
//! strictly sequentially, one transaction per document; a document that
//! fails to parse or ingest rolls back alone and the run continues.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;

pub mod nvd;
pub mod osv;

const USER_AGENT: &str = concat!("harborwatch/", env!("CARGO_PKG_VERSION"));

/// Ingestion strategy for a feed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Truncate the store and rebuild from scratch
    Full,
    /// Merge records modified within the trailing window of days
    Incremental { days_back: u32 },
}

impl IngestMode {
    /// Start of the modification window, if the mode has one.
    pub fn window_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            IngestMode::Full => None,
            IngestMode::Incremental { days_back } => {
                Some(now - chrono::Duration::days(i64::from(*days_back)))
            }
        }
    }
}

/// Counters accumulated over one ingestion run
#[derive(Debug, Default, Clone, Copy)]
pub struct IngestStats {
    /// Documents ingested and committed
    pub documents: usize,
    /// Documents rolled back and skipped
    pub documents_failed: usize,
    /// Vulnerability rows written (inserts and updates)
    pub vulnerabilities: usize,
    /// Identity links written
    pub identities: usize,
}

impl IngestStats {
    pub fn absorb(&mut self, other: IngestStats) {
        self.documents += other.documents;
        self.documents_failed += other.documents_failed;
        self.vulnerabilities += other.vulnerabilities;
        self.identities += other.identities;
    }
}

/// Build the shared HTTP client used by the feed downloaders.
///
/// Feed archives run to gigabytes, so the request timeout is generous and
/// caller-configurable; connection setup stays short.
pub fn create_shared_client(timeout: Duration) -> anyhow::Result<Arc<Client>> {
    let client = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?;
    Ok(Arc::new(client))
}
