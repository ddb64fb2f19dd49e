use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use harborwatch::config::Config;
use harborwatch::correlate::CorrelationEngine;
use harborwatch::error::AppError;
use harborwatch::feeds::{self, IngestMode, nvd, osv};
use harborwatch::identity::Ecosystem;
use harborwatch::report::{self, AssetReport, VulnerabilityReport};
use harborwatch::scanner::SyftScanner;
use harborwatch::store::{StoreConfig, VulnStore};

#[derive(Parser)]
#[command(name = "harborwatch")]
#[command(about = "Container image vulnerability scanner", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan an image and write the asset and vulnerability reports
    Analyze {
        /// Image reference, e.g. nginx:1.10.3
        image: String,

        /// Output path for the asset (SBOM) report
        #[arg(long)]
        assets: PathBuf,

        /// Output path for the vulnerability report
        #[arg(long)]
        vulns: PathBuf,

        /// Optional output path for the severity summary
        #[arg(long)]
        summary: Option<PathBuf>,

        /// Optional output path for a CycloneDX BOM
        #[arg(long)]
        cyclonedx: Option<PathBuf>,
    },
    /// Manage the local vulnerability database
    #[command(subcommand)]
    Db(DbCommands),
}

#[derive(Subcommand)]
enum DbCommands {
    /// Ingest the NVD CVE feed
    Load {
        /// Truncate the store and rebuild from the full history
        #[arg(long)]
        full: bool,

        /// Merge records modified within the trailing window
        #[arg(long)]
        incremental: bool,

        /// Window size in days for incremental mode
        #[arg(long, default_value = "1")]
        days: u32,
    },
    /// Ingest the OSV per-ecosystem advisory feeds
    LoadAdvisories {
        /// Only advisories modified within the trailing window of days
        #[arg(long)]
        days: Option<u32>,

        /// Restrict to named ecosystems (maven, npm, pypi, go, nuget,
        /// packagist, crates); all of them by default
        #[arg(long = "ecosystem")]
        ecosystems: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = Config::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Analyze {
            image,
            assets,
            vulns,
            summary,
            cyclonedx,
        } => run_analyze(&config, &image, &assets, &vulns, summary, cyclonedx).await,
        Commands::Db(DbCommands::Load {
            full,
            incremental,
            days,
        }) => run_db_load(&config, full, incremental, days).await,
        Commands::Db(DbCommands::LoadAdvisories { days, ecosystems }) => {
            run_load_advisories(&config, days, &ecosystems).await
        }
    }
}

async fn run_analyze(
    config: &Config,
    image: &str,
    assets_path: &std::path::Path,
    vulns_path: &std::path::Path,
    summary_path: Option<PathBuf>,
    cyclonedx_path: Option<PathBuf>,
) -> Result<(), AppError> {
    let scanner = SyftScanner::new(config.scanner.timeout());
    let inventory = scanner.scan(image).await?;
    tracing::info!(
        packages = inventory.packages.len(),
        binaries = inventory.binaries.len(),
        os = %format!("{}:{}", inventory.os_name, inventory.os_version),
        "inventory collected"
    );

    let assets = AssetReport {
        image_name: image.to_string(),
        os_name: inventory.os_name.clone(),
        os_version: inventory.os_version.clone(),
        packages: inventory.packages.clone(),
        non_package_binaries: inventory.binaries.clone(),
    };
    report::write_json(&assets, assets_path)?;
    tracing::info!(path = %assets_path.display(), "asset report written");

    // a missing store must not prevent SBOM generation, degrade to empty
    let (package_vulns, os_vulns) =
        match VulnStore::open(&config.database.path, StoreConfig::default()) {
            Ok(store) => {
                let engine = CorrelationEngine::new(&store);
                (
                    engine.find_package_vulnerabilities(&inventory.packages),
                    engine.find_os_vulnerabilities(&inventory.os_name, &inventory.os_version),
                )
            }
            Err(err) => {
                tracing::warn!(
                    path = %config.database.path.display(),
                    "vulnerability store unavailable, reporting without findings: {err}"
                );
                (Vec::new(), Vec::new())
            }
        };
    tracing::info!(
        package_findings = package_vulns.len(),
        os_findings = os_vulns.len(),
        "correlation finished"
    );

    let findings = VulnerabilityReport::new(image, os_vulns, package_vulns);
    report::write_json(&findings, vulns_path)?;
    tracing::info!(path = %vulns_path.display(), "vulnerability report written");

    if let Some(path) = summary_path {
        report::write_json(&findings.summary(), &path)?;
        tracing::info!(path = %path.display(), "severity summary written");
    }
    if let Some(path) = cyclonedx_path {
        let bom = report::cyclonedx::build(&assets, &findings);
        report::write_json(&bom, &path)?;
        tracing::info!(path = %path.display(), "CycloneDX BOM written");
    }
    Ok(())
}

async fn run_db_load(
    config: &Config,
    full: bool,
    incremental: bool,
    days: u32,
) -> Result<(), AppError> {
    let mode = match (full, incremental) {
        (true, false) => IngestMode::Full,
        (false, true) => IngestMode::Incremental { days_back: days },
        _ => {
            return Err(AppError::Config(
                "pass exactly one of --full or --incremental".to_string(),
            ));
        }
    };

    let store = VulnStore::open(&config.database.path, StoreConfig::default())
        .map_err(|e| AppError::Store(e.to_string()))?;
    let http = feeds::create_shared_client(config.feeds.download_timeout())
        .map_err(|e| AppError::Feed(e.to_string()))?;
    let client = nvd::NvdClient::new(
        http,
        config.feeds.nvd_base_url.clone(),
        config.feeds.nvd_api_key.clone(),
    );

    let stats = nvd::run(&store, &client, &config.feeds.cache_dir, mode)
        .await
        .map_err(|e| AppError::Feed(e.to_string()))?;
    let (vulns, products, links) = store
        .counts()
        .map_err(|e| AppError::Store(e.to_string()))?;
    tracing::info!(
        documents = stats.documents,
        failed = stats.documents_failed,
        vulnerabilities = vulns,
        products,
        links,
        "CVE feed ingestion finished"
    );
    Ok(())
}

async fn run_load_advisories(
    config: &Config,
    days: Option<u32>,
    ecosystem_tags: &[String],
) -> Result<(), AppError> {
    let ecosystems: Vec<Ecosystem> = if ecosystem_tags.is_empty() {
        Ecosystem::ADVISORY_FEEDS.to_vec()
    } else {
        ecosystem_tags
            .iter()
            .map(|tag| {
                Ecosystem::from_tag(tag)
                    .ok_or_else(|| AppError::Config(format!("unknown ecosystem: {tag}")))
            })
            .collect::<Result<_, _>>()?
    };
    let modified_since = days.and_then(|days_back| {
        IngestMode::Incremental { days_back }.window_start(chrono::Utc::now())
    });

    let store = VulnStore::open(&config.database.path, StoreConfig::default())
        .map_err(|e| AppError::Store(e.to_string()))?;
    let http = feeds::create_shared_client(config.feeds.download_timeout())
        .map_err(|e| AppError::Feed(e.to_string()))?;
    let client = osv::OsvClient::new(http, config.feeds.osv_base_url.clone());

    let stats = osv::run(
        &store,
        &client,
        &config.feeds.cache_dir,
        &ecosystems,
        modified_since,
    )
    .await
    .map_err(|e| AppError::Feed(e.to_string()))?;
    tracing::info!(
        documents = stats.documents,
        failed = stats.documents_failed,
        identities = stats.identities,
        "advisory ingestion finished"
    );
    Ok(())
}
