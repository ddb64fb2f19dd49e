//! CycloneDX 1.5 JSON output
//!
//! Renders the asset and vulnerability reports into one BOM document. The
//! field layout is fixed by the CycloneDX specification; only the subset
//! this tool emits is modelled.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{AssetReport, SeverityBucket, VulnerabilityReport};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bom {
    bom_format: &'static str,
    spec_version: &'static str,
    version: u32,
    metadata: Metadata,
    components: Vec<Component>,
    vulnerabilities: Vec<BomVulnerability>,
}

#[derive(Debug, Serialize)]
struct Metadata {
    component: Component,
}

#[derive(Debug, Serialize)]
struct Component {
    #[serde(rename = "type")]
    component_type: &'static str,
    #[serde(rename = "bom-ref")]
    bom_ref: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    purl: Option<String>,
}

#[derive(Debug, Serialize)]
struct BomVulnerability {
    id: String,
    source: Source,
    ratings: Vec<Rating>,
    description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    affects: Vec<Affect>,
}

#[derive(Debug, Serialize)]
struct Source {
    name: &'static str,
}

#[derive(Debug, Serialize)]
struct Rating {
    severity: &'static str,
}

#[derive(Debug, Serialize)]
struct Affect {
    #[serde(rename = "ref")]
    bom_ref: String,
}

/// Build the BOM from the two reports.
///
/// Components come from packages with a purl (the purl is the bom-ref);
/// packages without one are skipped with a warning. Each finding becomes a
/// vulnerability entry pointing at the affected component when its package
/// maps to one.
pub fn build(assets: &AssetReport, findings: &VulnerabilityReport) -> Bom {
    let mut components = Vec::new();
    let mut refs_by_product: BTreeMap<&str, String> = BTreeMap::new();

    for package in &assets.packages {
        let Some(purl) = &package.purl else {
            tracing::warn!(package = %package.name, "package has no purl, skipping component");
            continue;
        };
        components.push(Component {
            component_type: "library",
            bom_ref: purl.clone(),
            name: package.name.clone(),
            version: Some(package.version.clone()),
            purl: Some(purl.clone()),
        });
        refs_by_product.insert(package.product.as_str(), purl.clone());
    }

    let vulnerabilities = findings
        .all_vulnerabilities()
        .map(|vuln| BomVulnerability {
            id: vuln.cve_id.clone(),
            source: Source {
                name: "harborwatch-db",
            },
            ratings: vec![Rating {
                severity: SeverityBucket::classify(vuln.severity.as_deref()).as_str(),
            }],
            description: format!("Vulnerability {}", vuln.cve_id),
            affects: refs_by_product
                .get(vuln.package_name.as_str())
                .map(|bom_ref| Affect {
                    bom_ref: bom_ref.clone(),
                })
                .into_iter()
                .collect(),
        })
        .collect();

    Bom {
        bom_format: "CycloneDX",
        spec_version: "1.5",
        version: 1,
        metadata: Metadata {
            component: Component {
                component_type: "application",
                bom_ref: assets.image_name.clone(),
                name: assets.image_name.clone(),
                version: None,
                purl: None,
            },
        },
        components,
        vulnerabilities,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{MatchedVulnerability, ScannedPackage};

    fn assets() -> AssetReport {
        AssetReport {
            image_name: "nginx:1.10.3".to_string(),
            os_name: "Debian GNU/Linux".to_string(),
            os_version: "8".to_string(),
            packages: vec![
                ScannedPackage {
                    name: "openssl".to_string(),
                    version: "1.0.1t".to_string(),
                    vendor: "openssl".to_string(),
                    product: "openssl".to_string(),
                    purl: Some("pkg:deb/debian/openssl@1.0.1t".to_string()),
                    layer_id: "sha256:aaa".to_string(),
                    layer_index: 0,
                },
                ScannedPackage {
                    name: "mystery".to_string(),
                    version: "1.0".to_string(),
                    vendor: "mystery".to_string(),
                    product: "mystery".to_string(),
                    purl: None,
                    layer_id: "sha256:aaa".to_string(),
                    layer_index: 0,
                },
            ],
            non_package_binaries: vec![],
        }
    }

    fn findings() -> VulnerabilityReport {
        VulnerabilityReport::new(
            "nginx:1.10.3",
            vec![],
            vec![
                MatchedVulnerability {
                    cve_id: "CVE-2021-0001".to_string(),
                    package_name: "openssl".to_string(),
                    package_version: "1.0.1t".to_string(),
                    severity: Some("HIGH".to_string()),
                },
                MatchedVulnerability {
                    cve_id: "CVE-2021-0002".to_string(),
                    package_name: "ghost".to_string(),
                    package_version: "0.1".to_string(),
                    severity: Some("negligible".to_string()),
                },
            ],
        )
    }

    #[test]
    fn test_bom_shape() {
        let bom = build(&assets(), &findings());
        let value = serde_json::to_value(&bom).unwrap();

        assert_eq!(value["bomFormat"], "CycloneDX");
        assert_eq!(value["specVersion"], "1.5");
        assert_eq!(value["metadata"]["component"]["type"], "application");
        assert_eq!(value["metadata"]["component"]["name"], "nginx:1.10.3");

        // only the package with a purl becomes a component
        let components = value["components"].as_array().unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0]["purl"], "pkg:deb/debian/openssl@1.0.1t");
        assert_eq!(components[0]["bom-ref"], "pkg:deb/debian/openssl@1.0.1t");
    }

    #[test]
    fn test_vulnerability_refs_and_ratings() {
        let bom = build(&assets(), &findings());
        let value = serde_json::to_value(&bom).unwrap();
        let vulns = value["vulnerabilities"].as_array().unwrap();
        assert_eq!(vulns.len(), 2);

        let matched = vulns
            .iter()
            .find(|v| v["id"] == "CVE-2021-0001")
            .unwrap();
        assert_eq!(matched["ratings"][0]["severity"], "high");
        assert_eq!(
            matched["affects"][0]["ref"],
            "pkg:deb/debian/openssl@1.0.1t"
        );

        // a finding with no mapped component carries no affects array
        let unmatched = vulns
            .iter()
            .find(|v| v["id"] == "CVE-2021-0002")
            .unwrap();
        assert_eq!(unmatched["ratings"][0]["severity"], "none");
        assert!(unmatched.get("affects").is_none());
    }
}
