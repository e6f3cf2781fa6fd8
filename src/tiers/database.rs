//! Database tier: an embedded SQLite store usable as the L2 back-end or as
//! L3 (spec.md §4.3.3).
//!
//! Grounded on `proxywhirl/cache/tiers.py`'s `SQLiteCacheTier` (schema,
//! indexes, and the `ALTER TABLE ADD COLUMN` migration whitelist) and
//! `DiskCacheTier` (the WAL/`synchronous=NORMAL` pragmas). The Python
//! implementation opens a fresh connection per call; this crate instead
//! holds one long-lived connection behind a mutex per spec.md §4.3.3's
//! "connection discipline", matching how `examples/vanyastaff-nebula`'s
//! `storage` crate guards its single `rusqlite::Connection`.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{Tier, TierKind};
use crate::crypto::CredentialCipher;
use crate::error::{CacheError, CacheResult};
use crate::model::{CacheEntry, HealthStatus};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Columns expected on `cache_entries`, beyond the ones created by the
/// initial `CREATE TABLE`. Migration inspects `PRAGMA table_info` and adds
/// any missing from this fixed whitelist — column names are never derived
/// from user input.
const MIGRATION_COLUMNS: &[(&str, &str)] = &[
    ("evicted_from_l1", "INTEGER NOT NULL DEFAULT 0"),
    ("created_at", "REAL"),
    ("updated_at", "REAL"),
];

fn health_status_to_str(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Unhealthy => "unhealthy",
        HealthStatus::Unknown => "unknown",
    }
}

fn health_status_from_str(s: &str) -> HealthStatus {
    match s {
        "healthy" => HealthStatus::Healthy,
        "unhealthy" => HealthStatus::Unhealthy,
        _ => HealthStatus::Unknown,
    }
}

fn to_unix(dt: DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9
}

fn from_unix(secs: f64) -> CacheResult<DateTime<Utc>> {
    let whole = secs.trunc() as i64;
    let nanos = ((secs.fract()) * 1e9).round() as u32;
    Utc.timestamp_opt(whole, nanos)
        .single()
        .ok_or_else(|| CacheError::Io(format!("invalid stored timestamp: {secs}")))
}

fn map_sqlite_err(e: rusqlite::Error) -> CacheError {
    match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy =>
        {
            CacheError::Timeout(format!("database busy: {e}"))
        }
        other => CacheError::Io(format!("sqlite error: {other}")),
    }
}

/// Embedded SQL database tier. Serves either as the L2 back-end (plain
/// `cache_entries` table) or as L3, in which case an auxiliary
/// `health_history` table is also created.
pub struct DatabaseTier {
    kind: TierKind,
    conn: Mutex<Connection>,
    max_entries: Option<usize>,
    cipher: std::sync::Arc<CredentialCipher>,
}

impl DatabaseTier {
    pub fn open(
        path: &Path,
        kind: TierKind,
        max_entries: Option<usize>,
        cipher: std::sync::Arc<CredentialCipher>,
    ) -> CacheResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(map_sqlite_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_sqlite_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(map_sqlite_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(map_sqlite_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(map_sqlite_err)?;
        let tier = Self {
            kind,
            conn: Mutex::new(conn),
            max_entries,
            cipher,
        };
        tier.init_schema()?;
        Ok(tier)
    }

    /// In-memory instance, useful for tests that want database semantics
    /// without touching disk.
    pub fn open_in_memory(
        kind: TierKind,
        max_entries: Option<usize>,
        cipher: std::sync::Arc<CredentialCipher>,
    ) -> CacheResult<Self> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(map_sqlite_err)?;
        let tier = Self {
            kind,
            conn: Mutex::new(conn),
            max_entries,
            cipher,
        };
        tier.init_schema()?;
        Ok(tier)
    }

    fn init_schema(&self) -> CacheResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                proxy_url TEXT NOT NULL,
                username_encrypted BLOB,
                password_encrypted BLOB,
                source TEXT NOT NULL,
                fetch_time REAL NOT NULL,
                last_accessed REAL NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                ttl_seconds INTEGER NOT NULL,
                expires_at REAL NOT NULL,
                health_status TEXT NOT NULL DEFAULT 'unknown',
                failure_count INTEGER NOT NULL DEFAULT 0,
                evicted_from_l1 INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_expires_at ON cache_entries(expires_at);
            CREATE INDEX IF NOT EXISTS idx_source ON cache_entries(source);
            CREATE INDEX IF NOT EXISTS idx_health_status ON cache_entries(health_status);
            CREATE INDEX IF NOT EXISTS idx_last_accessed ON cache_entries(last_accessed);",
        )
        .map_err(map_sqlite_err)?;

        self.migrate_columns(&conn)?;

        if self.kind == TierKind::L3Database {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS health_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    proxy_key TEXT NOT NULL,
                    check_time REAL NOT NULL,
                    status TEXT NOT NULL,
                    response_time_ms REAL,
                    error_message TEXT,
                    check_url TEXT NOT NULL,
                    FOREIGN KEY (proxy_key) REFERENCES cache_entries(key) ON DELETE CASCADE
                );
                CREATE INDEX IF NOT EXISTS idx_health_history_proxy ON health_history(proxy_key);
                CREATE INDEX IF NOT EXISTS idx_health_history_time ON health_history(check_time);",
            )
            .map_err(map_sqlite_err)?;
        }
        Ok(())
    }

    /// Adds any column in `MIGRATION_COLUMNS` missing from `cache_entries`.
    /// Column names come only from the fixed whitelist above, never from
    /// caller input, so the generated DDL is safe despite being built with
    /// `format!`.
    fn migrate_columns(&self, conn: &Connection) -> CacheResult<()> {
        let mut stmt = conn
            .prepare("PRAGMA table_info(cache_entries)")
            .map_err(map_sqlite_err)?;
        let existing: std::collections::HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(map_sqlite_err)?
            .filter_map(Result::ok)
            .collect();
        drop(stmt);

        for (name, ddl_type) in MIGRATION_COLUMNS {
            if !existing.contains(*name) {
                let sql = format!("ALTER TABLE cache_entries ADD COLUMN {name} {ddl_type}");
                conn.execute(&sql, []).map_err(map_sqlite_err)?;
                tracing::info!(column = name, "migrated cache_entries: added column");
            }
        }
        Ok(())
    }

    /// Record a health-check outcome in `health_history`. Only meaningful
    /// on an L3 instance; a no-op (`Ok(())`) on L2.
    pub fn record_health_check(
        &self,
        proxy_key: &str,
        check_time: DateTime<Utc>,
        status: HealthStatus,
        response_time_ms: Option<f64>,
        error_message: Option<&str>,
        check_url: &str,
    ) -> CacheResult<()> {
        if self.kind != TierKind::L3Database {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT INTO health_history
                (proxy_key, check_time, status, response_time_ms, error_message, check_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                proxy_key,
                to_unix(check_time),
                health_status_to_str(status),
                response_time_ms,
                error_message,
                check_url,
            ],
        )
        .map_err(map_sqlite_err)?;
        Ok(())
    }

    fn row_to_entry(&self, row: &rusqlite::Row<'_>) -> CacheResult<CacheEntry> {
        let username_encrypted: Option<Vec<u8>> = row.get("username_encrypted").map_err(map_sqlite_err)?;
        let password_encrypted: Option<Vec<u8>> = row.get("password_encrypted").map_err(map_sqlite_err)?;
        let username = match username_encrypted {
            Some(bytes) if !bytes.is_empty() => Some(self.cipher.decrypt(&bytes)?),
            _ => None,
        };
        let password = match password_encrypted {
            Some(bytes) if !bytes.is_empty() => Some(self.cipher.decrypt(&bytes)?),
            _ => None,
        };
        let health_status: String = row.get("health_status").map_err(map_sqlite_err)?;
        Ok(CacheEntry {
            key: row.get("key").map_err(map_sqlite_err)?,
            proxy_url: row.get("proxy_url").map_err(map_sqlite_err)?,
            username,
            password,
            source: row.get("source").map_err(map_sqlite_err)?,
            fetch_time: from_unix(row.get("fetch_time").map_err(map_sqlite_err)?)?,
            last_accessed: from_unix(row.get("last_accessed").map_err(map_sqlite_err)?)?,
            access_count: row.get::<_, i64>("access_count").map_err(map_sqlite_err)? as u64,
            ttl_seconds: row.get::<_, i64>("ttl_seconds").map_err(map_sqlite_err)? as u64,
            expires_at: from_unix(row.get("expires_at").map_err(map_sqlite_err)?)?,
            health_status: health_status_from_str(&health_status),
            failure_count: row.get::<_, i64>("failure_count").map_err(map_sqlite_err)? as u32,
            evicted_from_l1: row.get::<_, i64>("evicted_from_l1").map_err(map_sqlite_err)? != 0,
        })
    }
}

impl Tier for DatabaseTier {
    fn kind(&self) -> TierKind {
        self.kind
    }

    fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = conn
            .prepare_cached("SELECT * FROM cache_entries WHERE key = ?1")
            .map_err(map_sqlite_err)?;
        let row = stmt
            .query_row(params![key], |row| Ok(self.row_to_entry(row)))
            .optional()
            .map_err(map_sqlite_err)?;
        row.transpose()
    }

    fn put(&self, key: &str, entry: CacheEntry) -> CacheResult<Option<(String, CacheEntry)>> {
        let username_encrypted = match &entry.username {
            Some(s) => Some(self.cipher.encrypt(s)?),
            None => None,
        };
        let password_encrypted = match &entry.password {
            Some(s) => Some(self.cipher.encrypt(s)?),
            None => None,
        };
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let is_new_key = !conn
            .query_row(
                "SELECT 1 FROM cache_entries WHERE key = ?1",
                params![key],
                |_| Ok(()),
            )
            .optional()
            .map_err(map_sqlite_err)?
            .is_some();

        conn.execute(
            "INSERT INTO cache_entries (
                key, proxy_url, username_encrypted, password_encrypted,
                source, fetch_time, last_accessed, access_count,
                ttl_seconds, expires_at, health_status, failure_count, evicted_from_l1
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(key) DO UPDATE SET
                proxy_url = excluded.proxy_url,
                username_encrypted = excluded.username_encrypted,
                password_encrypted = excluded.password_encrypted,
                source = excluded.source,
                fetch_time = excluded.fetch_time,
                last_accessed = excluded.last_accessed,
                access_count = excluded.access_count,
                ttl_seconds = excluded.ttl_seconds,
                expires_at = excluded.expires_at,
                health_status = excluded.health_status,
                failure_count = excluded.failure_count,
                evicted_from_l1 = excluded.evicted_from_l1",
            params![
                key,
                entry.proxy_url,
                username_encrypted,
                password_encrypted,
                entry.source,
                to_unix(entry.fetch_time),
                to_unix(entry.last_accessed),
                entry.access_count as i64,
                entry.ttl_seconds as i64,
                to_unix(entry.expires_at),
                health_status_to_str(entry.health_status),
                entry.failure_count,
                i64::from(entry.evicted_from_l1),
            ],
        )
        .map_err(map_sqlite_err)?;

        if !is_new_key {
            return Ok(None);
        }
        let Some(max) = self.max_entries else {
            return Ok(None);
        };
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            .map_err(map_sqlite_err)?;
        if (count as usize) <= max {
            return Ok(None);
        }
        let evicted: Option<(String, f64)> = conn
            .query_row(
                "SELECT key, last_accessed FROM cache_entries
                 WHERE key != ?1 ORDER BY last_accessed ASC LIMIT 1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(map_sqlite_err)?;
        let Some((evicted_key, _)) = evicted else {
            return Ok(None);
        };
        let mut stmt = conn
            .prepare("SELECT * FROM cache_entries WHERE key = ?1")
            .map_err(map_sqlite_err)?;
        let evicted_entry = stmt
            .query_row(params![evicted_key], |row| Ok(self.row_to_entry(row)))
            .optional()
            .map_err(map_sqlite_err)?
            .transpose()?;
        drop(stmt);
        conn.execute(
            "DELETE FROM cache_entries WHERE key = ?1",
            params![evicted_key],
        )
        .map_err(map_sqlite_err)?;
        Ok(evicted_entry.map(|e| (evicted_key, e)))
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let affected = conn
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
            .map_err(map_sqlite_err)?;
        Ok(affected > 0)
    }

    fn clear(&self) -> CacheResult<usize> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            .map_err(map_sqlite_err)?;
        conn.execute("DELETE FROM cache_entries", [])
            .map_err(map_sqlite_err)?;
        Ok(count as usize)
    }

    fn size(&self) -> usize {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .unwrap_or(0)
    }

    fn keys(&self) -> Vec<String> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut stmt = match conn.prepare("SELECT key FROM cache_entries") {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        stmt.query_map([], |row| row.get::<_, String>(0))
            .map(|rows| rows.filter_map(Result::ok).collect())
            .unwrap_or_default()
    }

    fn cleanup_expired(&self, now: DateTime<Utc>) -> CacheResult<usize> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let affected = conn
            .execute(
                "DELETE FROM cache_entries WHERE expires_at < ?1",
                params![to_unix(now)],
            )
            .map_err(map_sqlite_err)?;
        Ok(affected)
    }
}
