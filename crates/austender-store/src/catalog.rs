//! SQLite catalog: checkpoint store plus the parquet file index.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use austender_core::CollectError;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};

/// RFC3339 UTC at second precision. Fixed-width, so lexicographic order
/// matches chronological order inside SQLite.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One row of the parquet file index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub path: String,
    pub source: String,
    pub fy: String,
    pub agency_key: String,
    pub company_key: String,
    pub row_count: i64,
    pub created_at: String,
}

/// Checkpoint key: hash of the request dimensions that shape a run.
pub fn cache_key(source: &str, keyword: &str, company: &str, agency: &str, date_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "s={source}|k={keyword}|c={company}|a={agency}|d={date_type}"
    ));
    hex::encode(hasher.finalize())
}

/// Process-wide catalog handle. The connection is serialized behind a
/// mutex; every statement is short-lived.
pub struct Catalog {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Catalog {
    /// Open (creating if needed) `catalog.sqlite` under `base_dir`.
    pub fn open(base_dir: &Path) -> Result<Self, CollectError> {
        std::fs::create_dir_all(base_dir)?;
        let path = base_dir.join("catalog.sqlite");
        let conn = Connection::open(&path)
            .map_err(|err| CollectError::CacheIo(format!("opening {}: {err}", path.display())))?;
        let catalog = Self {
            conn: Mutex::new(conn),
            path,
        };
        catalog.ensure_schema()?;
        Ok(catalog)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_schema(&self) -> Result<(), CollectError> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                key TEXT PRIMARY KEY,
                last_run TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS parquet_files (
                path TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                fy TEXT NOT NULL,
                agency_key TEXT NOT NULL,
                company_key TEXT NOT NULL,
                row_count INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_parquet_files_keys
                ON parquet_files(source, fy, agency_key, company_key);",
        )
        .map_err(sql_err)?;
        // Legacy catalogs predate the source column; add it additively.
        let _ = conn.execute(
            "ALTER TABLE parquet_files ADD COLUMN source TEXT NOT NULL DEFAULT 'federal'",
            [],
        );
        let _ = conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_parquet_files_source ON parquet_files(source)",
            [],
        );
        Ok(())
    }

    pub fn load_checkpoint(&self, key: &str) -> Result<Option<DateTime<Utc>>, CollectError> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT last_run FROM checkpoints WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        match raw {
            None => Ok(None),
            Some(ts) => DateTime::parse_from_rfc3339(&ts)
                .map(|parsed| Some(parsed.with_timezone(&Utc)))
                .map_err(|err| CollectError::Decode(format!("checkpoint {ts:?}: {err}"))),
        }
    }

    /// Upsert a checkpoint, never moving it backwards.
    pub fn save_checkpoint(&self, key: &str, ts: DateTime<Utc>) -> Result<(), CollectError> {
        let rendered = ts.format(TS_FORMAT).to_string();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO checkpoints(key, last_run) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET last_run = MAX(last_run, excluded.last_run)",
            rusqlite::params![key, rendered],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn upsert_parquet_file(&self, entry: &CatalogEntry) -> Result<(), CollectError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO parquet_files
                (path, source, fy, agency_key, company_key, row_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.path,
                entry.source,
                entry.fy,
                entry.agency_key,
                entry.company_key,
                entry.row_count,
                entry.created_at,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Candidate lake files for a query, prefiltered on the index.
    pub fn select_paths(
        &self,
        source_key: &str,
        agency_key: Option<&str>,
        company_key: Option<&str>,
        min_fy: Option<&str>,
    ) -> Result<Vec<String>, CollectError> {
        let mut clauses = vec!["source = ?".to_string()];
        let mut args: Vec<String> = vec![source_key.to_string()];
        if let Some(agency) = agency_key {
            clauses.push("agency_key LIKE ?".to_string());
            args.push(format!("%{agency}%"));
        }
        if let Some(company) = company_key {
            clauses.push("company_key LIKE ?".to_string());
            args.push(format!("%{company}%"));
        }
        if let Some(fy) = min_fy {
            clauses.push("fy >= ?".to_string());
            args.push(fy.to_string());
        }
        let sql = format!(
            "SELECT path FROM parquet_files WHERE {}",
            clauses.join(" AND ")
        );

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), |row| row.get(0))
            .map_err(sql_err)?;
        let mut paths = Vec::new();
        for row in rows {
            paths.push(row.map_err(sql_err)?);
        }
        Ok(paths)
    }

    pub fn truncate_parquet_files(&self) -> Result<(), CollectError> {
        self.lock()
            .execute("DELETE FROM parquet_files", [])
            .map_err(sql_err)?;
        Ok(())
    }

    /// Full index contents, ordered by path. Used by reindex tests.
    pub fn parquet_files(&self) -> Result<Vec<CatalogEntry>, CollectError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT path, source, fy, agency_key, company_key, row_count, created_at
                 FROM parquet_files ORDER BY path",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CatalogEntry {
                    path: row.get(0)?,
                    source: row.get(1)?,
                    fy: row.get(2)?,
                    agency_key: row.get(3)?,
                    company_key: row.get(4)?,
                    row_count: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .map_err(sql_err)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(sql_err)?);
        }
        Ok(entries)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn sql_err(err: rusqlite::Error) -> CollectError {
    CollectError::CacheIo(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn checkpoint_round_trips_at_second_precision() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        let ts = utc(2024, 7, 15, 12);
        catalog.save_checkpoint("key", ts).unwrap();
        assert_eq!(catalog.load_checkpoint("key").unwrap(), Some(ts));
        assert_eq!(catalog.load_checkpoint("missing").unwrap(), None);
    }

    #[test]
    fn checkpoints_never_move_backwards() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        catalog.save_checkpoint("key", utc(2024, 7, 15, 12)).unwrap();
        catalog.save_checkpoint("key", utc(2023, 1, 1, 0)).unwrap();
        assert_eq!(
            catalog.load_checkpoint("key").unwrap(),
            Some(utc(2024, 7, 15, 12))
        );
        catalog.save_checkpoint("key", utc(2025, 1, 1, 0)).unwrap();
        assert_eq!(
            catalog.load_checkpoint("key").unwrap(),
            Some(utc(2025, 1, 1, 0))
        );
    }

    #[test]
    fn cache_key_distinguishes_every_dimension() {
        let base = cache_key("federal", "k", "c", "a", "contractPublished");
        assert_ne!(base, cache_key("vic", "k", "c", "a", "contractPublished"));
        assert_ne!(base, cache_key("federal", "k2", "c", "a", "contractPublished"));
        assert_ne!(base, cache_key("federal", "k", "c2", "a", "contractPublished"));
        assert_ne!(base, cache_key("federal", "k", "c", "a2", "contractPublished"));
        assert_ne!(base, cache_key("federal", "k", "c", "a", "contractStart"));
        assert_eq!(base, cache_key("federal", "k", "c", "a", "contractPublished"));
    }

    #[test]
    fn index_prefilter_honors_keys() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let entry = CatalogEntry {
            path: "/lake/a.parquet".into(),
            source: "federal".into(),
            fy: "2024-25".into(),
            agency_key: "ato".into(),
            company_key: "kpmg".into(),
            row_count: 3,
            created_at: "2024-07-15T00:00:00Z".into(),
        };
        catalog.upsert_parquet_file(&entry).unwrap();

        let hit = catalog
            .select_paths("federal", Some("ato"), Some("kpm"), Some("2023-24"))
            .unwrap();
        assert_eq!(hit, vec!["/lake/a.parquet".to_string()]);

        assert!(catalog
            .select_paths("vic", None, None, None)
            .unwrap()
            .is_empty());
        assert!(catalog
            .select_paths("federal", Some("dva"), None, None)
            .unwrap()
            .is_empty());
        assert!(catalog
            .select_paths("federal", None, None, Some("2025-26"))
            .unwrap()
            .is_empty());
    }
}
