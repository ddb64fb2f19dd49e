//! Analysis reports
//!
//! Domain types shared by the scanner, the correlation engine and the
//! output adapters: the asset (SBOM) report, the grouped vulnerability
//! report and the severity summary, plus the pretty-printed JSON writers.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub mod cyclonedx;

/// A package discovered in the image, post identity normalization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannedPackage {
    pub name: String,
    pub version: String,
    pub vendor: String,
    pub product: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purl: Option<String>,
    pub layer_id: String,
    /// Position of the owning layer in the image, -1 when unknown
    pub layer_index: i64,
}

/// An executable not owned by any package manager. Carried through the
/// asset report only; there is no identity to correlate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannedBinary {
    pub path: String,
    pub layer_id: String,
    pub layer_index: i64,
}

/// One correlated finding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedVulnerability {
    pub cve_id: String,
    pub package_name: String,
    pub package_version: String,
    pub severity: Option<String>,
}

/// The asset inventory (SBOM) document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetReport {
    pub image_name: String,
    pub os_name: String,
    pub os_version: String,
    pub packages: Vec<ScannedPackage>,
    pub non_package_binaries: Vec<ScannedBinary>,
}

/// package name -> package version -> findings
pub type GroupedVulnerabilities = BTreeMap<String, BTreeMap<String, Vec<MatchedVulnerability>>>;

/// The vulnerability findings document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnerabilityReport {
    pub image_name: String,
    pub os_vulnerabilities: Vec<MatchedVulnerability>,
    pub package_vulnerabilities: GroupedVulnerabilities,
}

impl VulnerabilityReport {
    /// Build the report, grouping package findings by name then version.
    /// OS findings stay flat; one OS per scan makes grouping pointless.
    pub fn new(
        image_name: impl Into<String>,
        os_vulnerabilities: Vec<MatchedVulnerability>,
        package_vulnerabilities: Vec<MatchedVulnerability>,
    ) -> Self {
        let mut grouped: GroupedVulnerabilities = BTreeMap::new();
        for vuln in package_vulnerabilities {
            grouped
                .entry(vuln.package_name.clone())
                .or_default()
                .entry(vuln.package_version.clone())
                .or_default()
                .push(vuln);
        }
        Self {
            image_name: image_name.into(),
            os_vulnerabilities,
            package_vulnerabilities: grouped,
        }
    }

    /// All findings, OS first, then grouped package findings.
    pub fn all_vulnerabilities(&self) -> impl Iterator<Item = &MatchedVulnerability> {
        self.os_vulnerabilities.iter().chain(
            self.package_vulnerabilities
                .values()
                .flat_map(|versions| versions.values())
                .flatten(),
        )
    }

    /// Bucketed severity counts over every finding.
    pub fn summary(&self) -> SeveritySummary {
        let mut counts = SeverityCounts::default();
        let mut total = 0;
        for vuln in self.all_vulnerabilities() {
            total += 1;
            match SeverityBucket::classify(vuln.severity.as_deref()) {
                SeverityBucket::Critical => counts.critical += 1,
                SeverityBucket::High => counts.high += 1,
                SeverityBucket::Medium => counts.medium += 1,
                SeverityBucket::Low => counts.low += 1,
                SeverityBucket::None => counts.none += 1,
                SeverityBucket::Unknown => counts.unknown += 1,
            }
        }
        SeveritySummary {
            total_vulnerabilities: total,
            severity_counts: counts,
        }
    }
}

/// Severity buckets used by the summary and the CycloneDX ratings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeverityBucket {
    Critical,
    High,
    Medium,
    Low,
    None,
    Unknown,
}

impl SeverityBucket {
    /// Classify a feed severity label, case-insensitively. The synonym
    /// `NEGLIGIBLE` collapses to `None`; anything unrecognized, including
    /// an absent label, buckets to `Unknown`.
    pub fn classify(label: Option<&str>) -> Self {
        let Some(label) = label else {
            return SeverityBucket::Unknown;
        };
        match label.to_uppercase().as_str() {
            "CRITICAL" => SeverityBucket::Critical,
            "HIGH" => SeverityBucket::High,
            "MEDIUM" => SeverityBucket::Medium,
            "LOW" => SeverityBucket::Low,
            "NONE" | "NEGLIGIBLE" => SeverityBucket::None,
            _ => SeverityBucket::Unknown,
        }
    }

    /// Lowercase string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityBucket::Critical => "critical",
            SeverityBucket::High => "high",
            SeverityBucket::Medium => "medium",
            SeverityBucket::Low => "low",
            SeverityBucket::None => "none",
            SeverityBucket::Unknown => "unknown",
        }
    }
}

/// Per-bucket finding counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub none: u64,
    pub unknown: u64,
}

/// The severity summary document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeveritySummary {
    pub total_vulnerabilities: u64,
    pub severity_counts: SeverityCounts,
}

impl SeverityCounts {
    pub fn total(&self) -> u64 {
        self.critical + self.high + self.medium + self.low + self.none + self.unknown
    }
}

/// Write any report as pretty-printed JSON.
pub fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<(), crate::error::AppError> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}
