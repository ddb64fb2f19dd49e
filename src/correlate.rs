//! Vulnerability correlation
//!
//! Joins the scanned inventory against the store. Package matching keys on
//! (product, cleaned version) only; vendor stays out of the key since the
//! ecosystem feeds disagree on vendor naming. OS matching is exact on
//! vendor, product and version; an OS identity is unambiguous.
//!
//! A store that cannot be reached degrades either lookup to an empty result
//! with a warning. A missing vulnerability database must not prevent SBOM
//! generation.

use std::collections::BTreeSet;

use crate::identity::clean_version;
use crate::report::{MatchedVulnerability, ScannedPackage};
use crate::store::{MatchRow, VulnStore};

pub struct CorrelationEngine<'a> {
    store: &'a VulnStore,
}

impl<'a> CorrelationEngine<'a> {
    pub fn new(store: &'a VulnStore) -> Self {
        Self { store }
    }

    /// Findings for the scanned packages: a semi-join of the deduplicated
    /// (product, cleaned version) pairs against the store. A package with
    /// no matching identity contributes nothing; a package matching N
    /// linked CVEs contributes N findings.
    pub fn find_package_vulnerabilities(
        &self,
        packages: &[ScannedPackage],
    ) -> Vec<MatchedVulnerability> {
        if packages.is_empty() {
            return Vec::new();
        }
        let unique: BTreeSet<(String, String)> = packages
            .iter()
            .map(|p| (p.product.clone(), clean_version(&p.version).to_string()))
            .collect();
        let pairs: Vec<(String, String)> = unique.into_iter().collect();
        tracing::debug!(
            scanned = packages.len(),
            unique = pairs.len(),
            "querying store for package findings"
        );

        match self.store.find_packages(&pairs) {
            Ok(rows) => rows.into_iter().map(to_finding).collect(),
            Err(err) => {
                tracing::warn!("package lookup degraded to empty: {err}");
                Vec::new()
            }
        }
    }

    /// Findings for the scanned OS. The identity is vendor = product =
    /// first whitespace token of the OS name lower-cased, version = first
    /// token of the OS version; an absent or unknown OS short-circuits.
    pub fn find_os_vulnerabilities(
        &self,
        os_name: &str,
        os_version: &str,
    ) -> Vec<MatchedVulnerability> {
        if os_name.is_empty() || os_name == "unknown" {
            return Vec::new();
        }
        let lowered = os_name.to_lowercase();
        let Some(vendor) = lowered.split_whitespace().next() else {
            return Vec::new();
        };
        let version = os_version.split_whitespace().next().unwrap_or("");
        tracing::debug!(vendor, version, "querying store for OS findings");

        match self.store.find_os(vendor, vendor, version) {
            Ok(rows) => rows.into_iter().map(to_finding).collect(),
            Err(err) => {
                tracing::warn!("OS lookup degraded to empty: {err}");
                Vec::new()
            }
        }
    }
}

fn to_finding(row: MatchRow) -> MatchedVulnerability {
    MatchedVulnerability {
        cve_id: row.cve_id,
        package_name: row.product,
        package_version: row.version,
        severity: row.severity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CpeWfn;
    use crate::store::{self, VulnScores};

    fn seed(store: &VulnStore, cve: &str, vendor: &str, product: &str, version: &str) {
        store
            .with_transaction(|tx| {
                let scores = VulnScores {
                    cvss_v31_severity: Some("HIGH".to_string()),
                    ..VulnScores::default()
                };
                let vuln_id = store::upsert_vulnerability(tx, cve, "", &scores)?;
                let identity = CpeWfn {
                    part: Some("a".to_string()),
                    vendor: Some(vendor.to_string()),
                    product: Some(product.to_string()),
                    version: Some(version.to_string()),
                    ..CpeWfn::default()
                };
                let product_id = store::upsert_product(tx, &identity)?;
                store::link(tx, vuln_id, product_id)
            })
            .unwrap();
    }

    fn package(product: &str, version: &str, vendor: &str) -> ScannedPackage {
        ScannedPackage {
            name: product.to_string(),
            version: version.to_string(),
            vendor: vendor.to_string(),
            product: product.to_string(),
            purl: None,
            layer_id: "sha256:aaa".to_string(),
            layer_index: 0,
        }
    }

    #[test]
    fn test_version_cleaning_before_join() {
        let store = VulnStore::in_memory().unwrap();
        seed(&store, "CVE-2021-0001", "debian", "openssl", "1.1.1");

        let engine = CorrelationEngine::new(&store);
        let findings =
            engine.find_package_vulnerabilities(&[package("openssl", "1.1.1-1+deb", "debian")]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].cve_id, "CVE-2021-0001");
        // the finding carries the stored (clean) version
        assert_eq!(findings[0].package_version, "1.1.1");
    }

    #[test]
    fn test_no_match_contributes_nothing() {
        let store = VulnStore::in_memory().unwrap();
        seed(&store, "CVE-2021-0001", "debian", "openssl", "1.1.1");

        let engine = CorrelationEngine::new(&store);
        let findings = engine.find_package_vulnerabilities(&[
            package("openssl", "3.0.0", "debian"),
            package("nothere", "1.0", "acme"),
        ]);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_duplicate_pairs_query_once_and_match_alike() {
        let store = VulnStore::in_memory().unwrap();
        seed(&store, "CVE-2021-0001", "debian", "openssl", "1.1.1");
        seed(&store, "CVE-2021-0002", "debian", "openssl", "1.1.1");

        let engine = CorrelationEngine::new(&store);
        // two scanned packages collapse to one (product, version) pair
        let findings = engine.find_package_vulnerabilities(&[
            package("openssl", "1.1.1-1", "debian"),
            package("openssl", "1.1.1+b2", "other-vendor"),
        ]);
        assert_eq!(findings.len(), 2);
    }

    // The join deliberately drops vendor for packages: feeds disagree on
    // vendor naming, so a vendor mismatch must still match.
    #[test]
    fn test_package_match_ignores_vendor() {
        let store = VulnStore::in_memory().unwrap();
        seed(&store, "CVE-2021-0001", "openssl_project", "openssl", "1.1.1");

        let engine = CorrelationEngine::new(&store);
        let findings =
            engine.find_package_vulnerabilities(&[package("openssl", "1.1.1", "debian")]);
        assert_eq!(findings.len(), 1);
    }

    // The OS path is the asymmetric counterpart: vendor is required.
    #[test]
    fn test_os_match_requires_vendor() {
        let store = VulnStore::in_memory().unwrap();
        seed(&store, "CVE-2020-0010", "debian", "debian", "8");
        seed(&store, "CVE-2020-0011", "ubuntu", "debian", "8");

        let engine = CorrelationEngine::new(&store);
        let findings = engine.find_os_vulnerabilities("Debian GNU/Linux", "8 (jessie)");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].cve_id, "CVE-2020-0010");
    }

    #[test]
    fn test_unknown_os_short_circuits() {
        let store = VulnStore::in_memory().unwrap();
        seed(&store, "CVE-2020-0010", "unknown", "unknown", "unknown");

        let engine = CorrelationEngine::new(&store);
        assert!(engine.find_os_vulnerabilities("unknown", "unknown").is_empty());
        assert!(engine.find_os_vulnerabilities("", "8").is_empty());
    }

    #[test]
    fn test_empty_inventory_is_empty_result() {
        let store = VulnStore::in_memory().unwrap();
        let engine = CorrelationEngine::new(&store);
        assert!(engine.find_package_vulnerabilities(&[]).is_empty());
    }
}
