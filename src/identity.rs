//! Package identity normalization
//!
//! Vulnerability feeds and the image scanner each describe software in their
//! own vocabulary: ecosystem-specific package names, CPE 2.3 strings, distro
//! package versions with build suffixes. This module maps all of them onto
//! the canonical (vendor, product, version, ecosystem-tag) identity the
//! store is keyed by.

/// Package ecosystems with feed-specific naming conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ecosystem {
    /// Java packages (Maven coordinates)
    Maven,
    /// JavaScript/Node packages (npm)
    Npm,
    /// Python packages (PyPI)
    PyPi,
    /// Go modules
    Go,
    /// .NET packages (NuGet)
    NuGet,
    /// PHP packages (Packagist)
    Packagist,
    /// Rust crates (crates.io)
    CratesIo,
    /// Any ecosystem without a dedicated naming rule
    Other,
}

impl Ecosystem {
    /// Ecosystems with a published advisory archive
    pub const ADVISORY_FEEDS: [Ecosystem; 7] = [
        Ecosystem::Maven,
        Ecosystem::PyPi,
        Ecosystem::Go,
        Ecosystem::Npm,
        Ecosystem::NuGet,
        Ecosystem::Packagist,
        Ecosystem::CratesIo,
    ];

    /// Ecosystem name as spelled by the OSV advisory feed
    pub fn osv_name(&self) -> &'static str {
        match self {
            Ecosystem::Maven => "Maven",
            Ecosystem::Npm => "npm",
            Ecosystem::PyPi => "PyPI",
            Ecosystem::Go => "Go",
            Ecosystem::NuGet => "NuGet",
            Ecosystem::Packagist => "Packagist",
            Ecosystem::CratesIo => "crates.io",
            Ecosystem::Other => "",
        }
    }

    /// Short tag stored in the identity's `target_hw` field
    pub fn tag(&self) -> &'static str {
        match self {
            Ecosystem::Maven => "maven",
            Ecosystem::Npm => "npm",
            Ecosystem::PyPi => "pypi",
            Ecosystem::Go => "go",
            Ecosystem::NuGet => "nuget",
            Ecosystem::Packagist => "packagist",
            Ecosystem::CratesIo => "crates",
            Ecosystem::Other => "other",
        }
    }

    /// Resolve a tag as used on the command line (`maven`, `npm`, ...)
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ADVISORY_FEEDS
            .into_iter()
            .find(|e| e.tag() == tag.to_lowercase())
    }
}

/// Derive (vendor, product) from an ecosystem-specific package name.
///
/// Total over any input: names without the ecosystem's separator fall back
/// to vendor = product = raw name, and Go module paths, NuGet ids and crate
/// names are kept verbatim to avoid collisions.
pub fn normalize_identity(ecosystem: Ecosystem, raw_name: &str) -> (String, String) {
    let split = match ecosystem {
        // Maven: "org.apache:commons-lang3" -> ("org.apache", "commons-lang3")
        Ecosystem::Maven => raw_name.split_once(':'),
        // npm: scoped "@angular/core" -> ("@angular", "core"), bare names double up
        Ecosystem::Npm if raw_name.starts_with('@') => raw_name.split_once('/'),
        // Packagist: "laravel/framework" -> ("laravel", "framework")
        Ecosystem::Packagist => raw_name.split_once('/'),
        _ => None,
    };
    match split {
        Some((vendor, product)) => (vendor.to_string(), product.to_string()),
        None => (raw_name.to_string(), raw_name.to_string()),
    }
}

/// CPE 2.3 Well-Formed Name, the ten-field identity key.
///
/// `None` means the field is unspecified (the `*` wildcard in CPE syntax).
/// An empty string is a real value and stays distinct from absence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpeWfn {
    pub part: Option<String>,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub update_info: Option<String>,
    pub edition: Option<String>,
    pub language: Option<String>,
    pub sw_edition: Option<String>,
    pub target_hw: Option<String>,
    pub other: Option<String>,
}

impl CpeWfn {
    /// An identity can be stored and matched only with a concrete product
    /// and version.
    pub fn is_matchable(&self) -> bool {
        self.product.is_some() && self.version.is_some()
    }
}

/// Parse a CPE 2.3 string (`cpe:2.3:part:vendor:product:version:...`).
///
/// Fields beyond position 12 are ignored and missing trailing fields are
/// absent. Malformed input (fewer than three segments) yields an all-absent
/// tuple; callers skip such records instead of failing.
pub fn parse_cpe(cpe: &str) -> CpeWfn {
    let parts: Vec<&str> = cpe.split(':').collect();
    if parts.len() < 3 {
        return CpeWfn::default();
    }
    let field = |idx: usize| match parts.get(idx) {
        None | Some(&"*") => None,
        Some(s) => Some((*s).to_string()),
    };
    CpeWfn {
        part: field(2),
        vendor: field(3),
        product: field(4),
        version: field(5),
        update_info: field(6),
        edition: field(7),
        language: field(8),
        sw_edition: field(9),
        target_hw: field(10),
        other: field(11),
    }
}

/// Strip distro build suffixes from an OS package version: keeps the run of
/// characters before the first `-` or `+` separator.
pub fn clean_version(raw: &str) -> &str {
    raw.split(['-', '+']).next().unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maven_coordinates() {
        assert_eq!(
            normalize_identity(Ecosystem::Maven, "org.apache:commons-lang3"),
            ("org.apache".to_string(), "commons-lang3".to_string())
        );
        // no separator doubles up
        assert_eq!(
            normalize_identity(Ecosystem::Maven, "commons-lang3"),
            ("commons-lang3".to_string(), "commons-lang3".to_string())
        );
    }

    #[test]
    fn test_npm_scoped_and_bare() {
        assert_eq!(
            normalize_identity(Ecosystem::Npm, "@angular/core"),
            ("@angular".to_string(), "core".to_string())
        );
        assert_eq!(
            normalize_identity(Ecosystem::Npm, "react"),
            ("react".to_string(), "react".to_string())
        );
        // an @ without a slash is not a scope
        assert_eq!(
            normalize_identity(Ecosystem::Npm, "@weird"),
            ("@weird".to_string(), "@weird".to_string())
        );
    }

    #[test]
    fn test_packagist_vendor_package() {
        assert_eq!(
            normalize_identity(Ecosystem::Packagist, "laravel/framework"),
            ("laravel".to_string(), "framework".to_string())
        );
        assert_eq!(
            normalize_identity(Ecosystem::Packagist, "monolog"),
            ("monolog".to_string(), "monolog".to_string())
        );
    }

    #[test]
    fn test_path_like_names_kept_verbatim() {
        let (vendor, product) = normalize_identity(Ecosystem::Go, "github.com/gin-gonic/gin");
        assert_eq!(vendor, "github.com/gin-gonic/gin");
        assert_eq!(product, "github.com/gin-gonic/gin");

        let (vendor, product) = normalize_identity(Ecosystem::NuGet, "Microsoft.AspNetCore.Mvc");
        assert_eq!(vendor, "Microsoft.AspNetCore.Mvc");
        assert_eq!(product, "Microsoft.AspNetCore.Mvc");

        let (vendor, product) = normalize_identity(Ecosystem::CratesIo, "tokio");
        assert_eq!(vendor, "tokio");
        assert_eq!(product, "tokio");

        let (vendor, product) = normalize_identity(Ecosystem::Other, "whatever:odd/name");
        assert_eq!(vendor, "whatever:odd/name");
        assert_eq!(product, "whatever:odd/name");
    }

    #[test]
    fn test_parse_cpe_full() {
        let wfn = parse_cpe("cpe:2.3:a:openssl:openssl:1.1.1:*:*:*:*:*:*:*");
        assert_eq!(wfn.part.as_deref(), Some("a"));
        assert_eq!(wfn.vendor.as_deref(), Some("openssl"));
        assert_eq!(wfn.product.as_deref(), Some("openssl"));
        assert_eq!(wfn.version.as_deref(), Some("1.1.1"));
        assert_eq!(wfn.update_info, None);
        assert_eq!(wfn.edition, None);
        assert_eq!(wfn.language, None);
        assert_eq!(wfn.sw_edition, None);
        assert_eq!(wfn.target_hw, None);
        assert_eq!(wfn.other, None);
        assert!(wfn.is_matchable());
    }

    #[test]
    fn test_parse_cpe_short_and_malformed() {
        // trailing fields absent
        let wfn = parse_cpe("cpe:2.3:a:debian:apt");
        assert_eq!(wfn.vendor.as_deref(), Some("debian"));
        assert_eq!(wfn.product.as_deref(), Some("apt"));
        assert_eq!(wfn.version, None);
        assert!(!wfn.is_matchable());

        // fewer than three segments is all-absent
        assert_eq!(parse_cpe("not a cpe"), CpeWfn::default());
        assert_eq!(parse_cpe(""), CpeWfn::default());
    }

    #[test]
    fn test_parse_cpe_keeps_empty_distinct_from_wildcard() {
        let wfn = parse_cpe("cpe:2.3:a::openssl:1.1.1");
        assert_eq!(wfn.vendor.as_deref(), Some(""));
        let wfn = parse_cpe("cpe:2.3:a:*:openssl:1.1.1");
        assert_eq!(wfn.vendor, None);
    }

    #[test]
    fn test_parse_cpe_ignores_extra_segments() {
        let wfn = parse_cpe("cpe:2.3:a:v:p:1:u:e:l:se:th:o:extra:more");
        assert_eq!(wfn.other.as_deref(), Some("o"));
    }

    #[test]
    fn test_clean_version() {
        assert_eq!(clean_version("1.0.1t-1+deb8u6"), "1.0.1t");
        assert_eq!(clean_version("2.3"), "2.3");
        assert_eq!(clean_version("5.10+dfsg"), "5.10");
        assert_eq!(clean_version(""), "");
    }

    #[test]
    fn test_ecosystem_tags() {
        assert_eq!(Ecosystem::Maven.osv_name(), "Maven");
        assert_eq!(Ecosystem::CratesIo.osv_name(), "crates.io");
        assert_eq!(Ecosystem::CratesIo.tag(), "crates");
        assert_eq!(Ecosystem::from_tag("npm"), Some(Ecosystem::Npm));
        assert_eq!(Ecosystem::from_tag("NPM"), Some(Ecosystem::Npm));
        assert_eq!(Ecosystem::from_tag("swift"), None);
    }
}
