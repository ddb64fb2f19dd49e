//! Syft scanner adapter
//!
//! Shells out to the external `syft` SBOM tool and turns its JSON document
//! into the scanned inventory: OS identity, packages owned by an OS package
//! manager, and loose executables with no owning package.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use crate::error::ScanError;
use crate::identity::parse_cpe;
use crate::report::{ScannedBinary, ScannedPackage};

/// Artifact types that come from an OS package manager
const OS_PACKAGE_TYPES: [&str; 4] = ["apk", "deb", "dpkg", "rpm"];

/// Paths that mark an artifact as a standalone executable
const BINARY_PATH_PREFIXES: [&str; 5] = [
    "/bin/",
    "/sbin/",
    "/usr/bin/",
    "/usr/sbin/",
    "/usr/local/bin/",
];

/// Scanner output document (the subset this tool consumes)
#[derive(Debug, Deserialize)]
pub struct SyftDocument {
    #[serde(default)]
    pub distro: Option<SyftDistro>,
    #[serde(default)]
    pub source: Option<SyftSource>,
    #[serde(default)]
    pub artifacts: Vec<SyftArtifact>,
}

#[derive(Debug, Deserialize)]
pub struct SyftDistro {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SyftSource {
    #[serde(default)]
    pub layers: Vec<SyftLayer>,
}

#[derive(Debug, Deserialize)]
pub struct SyftLayer {
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SyftArtifact {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "type", default)]
    pub artifact_type: Option<String>,
    #[serde(default)]
    pub purl: Option<String>,
    #[serde(default)]
    pub locations: Vec<SyftLocation>,
    #[serde(default)]
    pub cpes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SyftLocation {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(rename = "layerID", default)]
    pub layer_id: Option<String>,
}

/// The scanned inventory handed to correlation and reporting
#[derive(Debug, Clone)]
pub struct Inventory {
    pub os_name: String,
    pub os_version: String,
    pub packages: Vec<ScannedPackage>,
    pub binaries: Vec<ScannedBinary>,
}

/// Adapter around the external `syft` binary
pub struct SyftScanner {
    command: String,
    timeout: Duration,
}

impl SyftScanner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            command: "syft".to_string(),
            timeout,
        }
    }

    /// Scan an image and build its inventory. Every failure here is fatal
    /// to the run; there is nothing to report without an inventory.
    pub async fn scan(&self, image: &str) -> Result<Inventory, ScanError> {
        tracing::info!(image, "running syft scan, this can take a while");
        let run = Command::new(&self.command)
            .arg("scan")
            .arg(format!("docker:{image}"))
            .args(["-o", "json", "-s", "all-layers"])
            .output();
        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ScanError::ScannerNotFound(self.command.clone()));
            }
            Ok(Err(err)) => return Err(ScanError::Io(err)),
            Err(_) => return Err(ScanError::Timeout(self.timeout.as_secs())),
        };
        if !output.status.success() {
            return Err(ScanError::ScannerFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        let doc: SyftDocument = serde_json::from_slice(&output.stdout)?;
        Ok(build_inventory(&doc))
    }
}

/// Derive the inventory from a scanner document. Pure; the subprocess
/// plumbing above stays out of the way of testing.
pub fn build_inventory(doc: &SyftDocument) -> Inventory {
    let os_name = doc
        .distro
        .as_ref()
        .and_then(|d| d.name.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let os_version = doc
        .distro
        .as_ref()
        .and_then(|d| d.version.clone())
        .unwrap_or_else(|| "unknown".to_string());

    // layer index is the digest's position in the source layer ordering
    let layer_indexes: HashMap<&str, i64> = doc
        .source
        .iter()
        .flat_map(|s| &s.layers)
        .enumerate()
        .filter_map(|(index, layer)| {
            layer.digest.as_deref().map(|digest| (digest, index as i64))
        })
        .collect();

    let os_vendor = os_name
        .to_lowercase()
        .split_whitespace()
        .next()
        .unwrap_or("unknown")
        .to_string();

    let mut packages = Vec::new();
    let mut binaries = Vec::new();

    for artifact in &doc.artifacts {
        let (Some(name), Some(version)) = (&artifact.name, &artifact.version) else {
            continue;
        };
        let Some(location) = artifact.locations.first() else {
            continue;
        };
        let layer_id = location
            .layer_id
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let layer_index = layer_indexes.get(layer_id.as_str()).copied().unwrap_or(-1);

        let is_os_package = artifact
            .artifact_type
            .as_deref()
            .is_some_and(|t| OS_PACKAGE_TYPES.contains(&t));

        if is_os_package {
            // CPE identity first, distro vendor and package name otherwise
            let wfn = artifact
                .cpes
                .first()
                .map(|cpe| parse_cpe(cpe))
                .unwrap_or_default();
            packages.push(ScannedPackage {
                name: name.clone(),
                version: version.clone(),
                vendor: wfn.vendor.unwrap_or_else(|| os_vendor.clone()),
                product: wfn.product.unwrap_or_else(|| name.clone()),
                purl: artifact.purl.clone(),
                layer_id,
                layer_index,
            });
        } else if let Some(path) = &location.path
            && BINARY_PATH_PREFIXES.iter().any(|p| path.starts_with(p))
        {
            binaries.push(ScannedBinary {
                path: path.clone(),
                layer_id,
                layer_index,
            });
        }
    }

    Inventory {
        os_name,
        os_version,
        packages,
        binaries,
    }
}
