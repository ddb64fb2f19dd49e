//! SQLite vulnerability store with connection pooling
//!
//! Three relations: `vulnerabilities` (one row per CVE), `products` (one row
//! per ten-field identity tuple) and `vulnerability_product_map` linking the
//! two. Both feed ingesters write through the upsert operations here, one
//! transaction per feed document; the correlation engine only reads.

use std::path::Path;
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::identity::CpeWfn;

/// Candidate pairs per correlation query, keeping bound parameters well
/// under SQLite's default 999 limit (two parameters per pair).
const QUERY_CHUNK: usize = 400;

#[cfg(test)]
static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Configuration for the store's connection pool
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_pool_size: u32,
    pub connection_timeout_secs: u64,
    pub busy_timeout_ms: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 10,
            connection_timeout_secs: 5,
            busy_timeout_ms: 5000,
        }
    }
}

/// CVSS scores attached to a vulnerability row. Either scoring standard may
/// be absent independently of the other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VulnScores {
    pub cvss_v31_score: Option<f64>,
    pub cvss_v31_severity: Option<String>,
    pub cvss_v40_score: Option<f64>,
    pub cvss_v40_severity: Option<String>,
}

/// One joined row returned by the correlation queries
#[derive(Debug, Clone)]
pub struct MatchRow {
    pub product: String,
    pub version: String,
    pub cve_id: String,
    pub severity: Option<String>,
}

/// Pooled SQLite store holding the vulnerability knowledge base
pub struct VulnStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl VulnStore {
    /// Open (creating if needed) the store at the given path.
    pub fn open(path: &Path, config: StoreConfig) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(config.max_pool_size)
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(600)))
            .build(manager)?;

        let store = Self {
            pool: Arc::new(pool),
        };
        store.init_schema(&config)?;

        let state = store.pool.state();
        tracing::debug!(
            connections = state.connections,
            idle = state.idle_connections,
            "vulnerability store pool initialized"
        );
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    ///
    /// Uses a shared in-memory database URI so all pooled connections see
    /// the same database; each call gets a unique name so tests do not
    /// interfere.
    #[cfg(test)]
    pub fn in_memory() -> anyhow::Result<Self> {
        let db_id = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
        let uri = format!("file:vulnstore{}?mode=memory&cache=shared", db_id);
        let manager = SqliteConnectionManager::file(&uri).with_init(|conn| {
            conn.execute_batch("PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;")?;
            Ok(())
        });
        let pool = Pool::builder().max_size(5).build(manager)?;
        let store = Self {
            pool: Arc::new(pool),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn conn(&self) -> anyhow::Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn init_schema(&self, config: &StoreConfig) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let pragmas = format!(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout={};
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
            config.busy_timeout_ms
        );
        conn.execute_batch(&pragmas)?;
        drop(conn);
        self.create_tables()
    }

    fn create_tables(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vulnerabilities (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 cve_id TEXT NOT NULL UNIQUE,
                 description TEXT NOT NULL DEFAULT '',
                 cvss_v31_score REAL,
                 cvss_v31_severity TEXT,
                 cvss_v40_score REAL,
                 cvss_v40_severity TEXT
             );
             CREATE TABLE IF NOT EXISTS products (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 part TEXT,
                 vendor TEXT,
                 product TEXT,
                 version TEXT,
                 update_info TEXT,
                 edition TEXT,
                 language TEXT,
                 sw_edition TEXT,
                 target_hw TEXT,
                 other TEXT
             );
             CREATE UNIQUE INDEX IF NOT EXISTS idx_products_identity
                 ON products(part, vendor, product, version, update_info,
                             edition, language, sw_edition, target_hw, other);
             CREATE INDEX IF NOT EXISTS idx_products_product_version
                 ON products(product, version);
             CREATE TABLE IF NOT EXISTS vulnerability_product_map (
                 vulnerability_id INTEGER NOT NULL
                     REFERENCES vulnerabilities(id) ON DELETE CASCADE,
                 product_id INTEGER NOT NULL
                     REFERENCES products(id) ON DELETE CASCADE,
                 UNIQUE (vulnerability_id, product_id)
             );",
        )?;
        Ok(())
    }

    /// Run `f` inside a transaction; commit on success, roll back on error.
    ///
    /// One feed document maps to one call, so a corrupt document rolls back
    /// alone and previously committed documents survive.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Truncate all three tables and restart row ids. Used only by a
    /// from-scratch full reload.
    pub fn reset(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "DELETE FROM vulnerability_product_map;
             DELETE FROM vulnerabilities;
             DELETE FROM products;",
        )?;
        // sqlite_sequence only exists once an autoincrement table has rows
        let has_sequence: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE name = 'sqlite_sequence')",
            [],
            |row| row.get(0),
        )?;
        if has_sequence {
            conn.execute(
                "DELETE FROM sqlite_sequence WHERE name IN ('vulnerabilities', 'products')",
                [],
            )?;
        }
        tracing::info!("vulnerability store truncated");
        Ok(())
    }

    /// Row id for a CVE id, if present.
    pub fn lookup_by_cve(&self, cve_id: &str) -> anyhow::Result<Option<i64>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT id FROM vulnerabilities WHERE cve_id = ?1",
                [cve_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Semi-join the candidate `(product, version)` pairs against the
    /// store, chunked to respect statement size limits. Chunk boundaries
    /// cannot affect the result; the join is an exact set filter.
    pub fn find_packages(&self, pairs: &[(String, String)]) -> anyhow::Result<Vec<MatchRow>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut rows = Vec::new();
        for chunk in pairs.chunks(QUERY_CHUNK) {
            let values = vec!["(?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT p.product, p.version, v.cve_id, v.cvss_v31_severity
                 FROM vulnerabilities AS v
                 JOIN vulnerability_product_map AS vpm ON v.id = vpm.vulnerability_id
                 JOIN products AS p ON vpm.product_id = p.id
                 WHERE (p.product, p.version) IN (VALUES {values})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let bound = chunk
                .iter()
                .flat_map(|(product, version)| [product.as_str(), version.as_str()]);
            let mapped = stmt.query_map(rusqlite::params_from_iter(bound), |row| {
                Ok(MatchRow {
                    product: row.get(0)?,
                    version: row.get(1)?,
                    cve_id: row.get(2)?,
                    severity: row.get(3)?,
                })
            })?;
            for row in mapped {
                rows.push(row?);
            }
        }
        Ok(rows)
    }

    /// Exact vendor AND product AND version lookup for the scanned OS.
    pub fn find_os(
        &self,
        vendor: &str,
        product: &str,
        version: &str,
    ) -> anyhow::Result<Vec<MatchRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT p.product, p.version, v.cve_id, v.cvss_v31_severity
             FROM vulnerabilities AS v
             JOIN vulnerability_product_map AS vpm ON v.id = vpm.vulnerability_id
             JOIN products AS p ON vpm.product_id = p.id
             WHERE p.vendor = ?1 AND p.product = ?2 AND p.version = ?3",
        )?;
        let mapped = stmt.query_map(params![vendor, product, version], |row| {
            Ok(MatchRow {
                product: row.get(0)?,
                version: row.get(1)?,
                cve_id: row.get(2)?,
                severity: row.get(3)?,
            })
        })?;
        let mut rows = Vec::new();
        for row in mapped {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Row counts (vulnerabilities, products, links) for run summaries.
    pub fn counts(&self) -> anyhow::Result<(u64, u64, u64)> {
        let conn = self.conn()?;
        let vulns = conn.query_row("SELECT COUNT(*) FROM vulnerabilities", [], |r| r.get(0))?;
        let products = conn.query_row("SELECT COUNT(*) FROM products", [], |r| r.get(0))?;
        let links = conn.query_row("SELECT COUNT(*) FROM vulnerability_product_map", [], |r| {
            r.get(0)
        })?;
        Ok((vulns, products, links))
    }
}

/// Insert or update a vulnerability by CVE id; re-ingestion overwrites the
/// description and scores without duplicating the row. Returns the row id.
pub fn upsert_vulnerability(
    conn: &Connection,
    cve_id: &str,
    description: &str,
    scores: &VulnScores,
) -> anyhow::Result<i64> {
    let id = conn.query_row(
        "INSERT INTO vulnerabilities
             (cve_id, description, cvss_v31_score, cvss_v31_severity,
              cvss_v40_score, cvss_v40_severity)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(cve_id) DO UPDATE SET
             description = excluded.description,
             cvss_v31_score = excluded.cvss_v31_score,
             cvss_v31_severity = excluded.cvss_v31_severity,
             cvss_v40_score = excluded.cvss_v40_score,
             cvss_v40_severity = excluded.cvss_v40_severity
         RETURNING id",
        params![
            cve_id,
            description,
            scores.cvss_v31_score,
            scores.cvss_v31_severity,
            scores.cvss_v40_score,
            scores.cvss_v40_severity,
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Insert an identity tuple if absent and return its row id either way.
///
/// Absent fields are stored as SQL NULL. SQLite unique indexes treat NULLs
/// as distinct, so the tuple is resolved with a NULL-aware `IS` match
/// instead of `ON CONFLICT`; ingestion is single-writer and transactional,
/// which keeps the select-then-insert race-free.
pub fn upsert_product(conn: &Connection, identity: &CpeWfn) -> anyhow::Result<i64> {
    let fields = params![
        identity.part,
        identity.vendor,
        identity.product,
        identity.version,
        identity.update_info,
        identity.edition,
        identity.language,
        identity.sw_edition,
        identity.target_hw,
        identity.other,
    ];
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM products
             WHERE part IS ?1 AND vendor IS ?2 AND product IS ?3
               AND version IS ?4 AND update_info IS ?5 AND edition IS ?6
               AND language IS ?7 AND sw_edition IS ?8 AND target_hw IS ?9
               AND other IS ?10",
            fields,
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO products
             (part, vendor, product, version, update_info, edition,
              language, sw_edition, target_hw, other)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        fields,
    )?;
    Ok(conn.last_insert_rowid())
}

/// Link a vulnerability to an identity; duplicate links are ignored.
pub fn link(conn: &Connection, vulnerability_id: i64, product_id: i64) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO vulnerability_product_map (vulnerability_id, product_id)
         VALUES (?1, ?2)",
        params![vulnerability_id, product_id],
    )?;
    Ok(())
}
