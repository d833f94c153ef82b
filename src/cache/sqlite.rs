//! Persistent cache backend on SQLite.
//!
//! The database runs in WAL mode. Writes go through one shared connection,
//! each in its own `IMMEDIATE` transaction. Every query opens a separate
//! connection and reads inside a single deferred transaction, which is a
//! stable snapshot that does not block writers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::cache::candidates::{CandidateSelector, CandidateSource, DEFAULT_MAX_CANDIDATES};
use crate::cache::types::{
    BlobCompression, Candidate, CandidateOptions, KnownLocation, LocationReference, LocationScope,
    Timestamp,
};
use crate::cache::{BlobInfoCache, CacheError, CacheStats};
use crate::config::CacheConfig;
use crate::digest::Digest;

/// Bumped whenever the table layout changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

const META_KEY_SCHEMA_VERSION: &str = "schema_version";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// SQLite-backed blob info cache.
#[derive(Debug)]
pub struct SqliteCache {
    path: PathBuf,
    writer: Mutex<Connection>,
    selector: CandidateSelector,
    busy_timeout: Duration,
}

impl SqliteCache {
    /// Open (creating if needed) the cache database at `path` with default
    /// settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        Self::open_with(path.as_ref(), DEFAULT_MAX_CANDIDATES, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_config(config: &CacheConfig) -> Result<Self, CacheError> {
        Self::open_with(
            &config.path,
            config.max_candidates,
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    fn open_with(path: &Path, max_candidates: usize, busy_timeout: Duration) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = connection(path, busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        check_integrity(&conn)?;
        init_schema(&mut conn)?;

        info!(path = %path.display(), "Opened blob info cache database");

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(conn),
            selector: CandidateSelector::new(max_candidates),
            busy_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_write_tx<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, CacheError>,
    {
        let mut conn = self.writer.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    fn with_read_tx<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, CacheError>,
    {
        let mut conn = read_connection(&self.path, self.busy_timeout)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

fn connection(path: &Path, busy_timeout: Duration) -> Result<Connection, CacheError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

/// Reads never create the database; a missing file is an error.
fn read_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, CacheError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

fn check_integrity(conn: &Connection) -> Result<(), CacheError> {
    let result: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if result != "ok" {
        return Err(CacheError::Corrupt {
            table: "database",
            reason: result,
        });
    }
    Ok(())
}

fn init_schema(conn: &mut Connection) -> Result<(), CacheError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS digest_uncompressed_pairs (
            compressed_digest TEXT PRIMARY KEY NOT NULL,
            uncompressed_digest TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS digest_uncompressed_pairs_uncompressed
            ON digest_uncompressed_pairs(uncompressed_digest);
        CREATE TABLE IF NOT EXISTS toc_uncompressed_pairs (
            toc_digest TEXT PRIMARY KEY NOT NULL,
            uncompressed_digest TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS digest_compressions (
            digest TEXT PRIMARY KEY NOT NULL,
            compression TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS known_locations (
            transport TEXT NOT NULL,
            scope TEXT NOT NULL,
            digest TEXT NOT NULL,
            location TEXT NOT NULL,
            last_used INTEGER NOT NULL,
            PRIMARY KEY (transport, scope, digest, location)
        );
        CREATE INDEX IF NOT EXISTS known_locations_last_used
            ON known_locations(last_used);
        "#,
    )?;

    tx.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params![META_KEY_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
    )?;
    let found: String = tx.query_row(
        "SELECT value FROM meta WHERE key = ?1",
        params![META_KEY_SCHEMA_VERSION],
        |row| row.get(0),
    )?;
    if found != SCHEMA_VERSION.to_string() {
        return Err(CacheError::SchemaVersion {
            found,
            expected: SCHEMA_VERSION,
        });
    }

    tx.commit()?;
    Ok(())
}

fn parse_digest(table: &'static str, value: &str) -> Result<Digest, CacheError> {
    Digest::parse(value).map_err(|e| CacheError::Corrupt {
        table,
        reason: e.to_string(),
    })
}

fn timestamp_to_sql(t: Timestamp) -> i64 {
    i64::try_from(t.as_nanos()).unwrap_or(i64::MAX)
}

fn timestamp_from_sql(value: i64) -> Result<Timestamp, CacheError> {
    u64::try_from(value)
        .map(Timestamp::from_nanos)
        .map_err(|_| CacheError::Corrupt {
            table: "known_locations",
            reason: format!("negative last_used {value}"),
        })
}

fn lookup_uncompressed(conn: &Connection, compressed: &Digest) -> Result<Option<Digest>, CacheError> {
    conn.query_row(
        "SELECT uncompressed_digest FROM digest_uncompressed_pairs WHERE compressed_digest = ?1",
        params![compressed.as_str()],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(|s| parse_digest("digest_uncompressed_pairs", &s))
    .transpose()
}

fn lookup_toc(conn: &Connection, toc: &Digest) -> Result<Option<Digest>, CacheError> {
    conn.query_row(
        "SELECT uncompressed_digest FROM toc_uncompressed_pairs WHERE toc_digest = ?1",
        params![toc.as_str()],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(|s| parse_digest("toc_uncompressed_pairs", &s))
    .transpose()
}

fn resolve_uncompressed(conn: &Connection, digest: &Digest) -> Result<Option<Digest>, CacheError> {
    if let Some(u) = lookup_uncompressed(conn, digest)? {
        return Ok(Some(u));
    }
    if let Some(u) = lookup_toc(conn, digest)? {
        return Ok(Some(u));
    }
    let is_uncompressed = conn
        .query_row(
            "SELECT 1 FROM digest_uncompressed_pairs WHERE uncompressed_digest = ?1 LIMIT 1",
            params![digest.as_str()],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    Ok(is_uncompressed.then(|| digest.clone()))
}

fn lookup_compression(conn: &Connection, digest: &Digest) -> Result<Option<BlobCompression>, CacheError> {
    conn.query_row(
        "SELECT compression FROM digest_compressions WHERE digest = ?1",
        params![digest.as_str()],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(|name| {
        name.parse::<BlobCompression>()
            .map_err(|e| CacheError::Corrupt {
                table: "digest_compressions",
                reason: e.to_string(),
            })
    })
    .transpose()
}

/// One read transaction seen as a candidate source.
struct Snapshot<'a> {
    tx: &'a Transaction<'a>,
}

impl CandidateSource for Snapshot<'_> {
    fn uncompressed_digest(&self, digest: &Digest) -> Result<Option<Digest>, CacheError> {
        resolve_uncompressed(self.tx, digest)
    }

    fn digests_with_uncompressed(&self, uncompressed: &Digest) -> Result<Vec<Digest>, CacheError> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT compressed_digest FROM digest_uncompressed_pairs \
             WHERE uncompressed_digest = ?1 ORDER BY compressed_digest",
        )?;
        let rows = stmt
            .query_map(params![uncompressed.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter()
            .map(|s| parse_digest("digest_uncompressed_pairs", s))
            .collect()
    }

    fn compression(&self, digest: &Digest) -> Result<BlobCompression, CacheError> {
        Ok(lookup_compression(self.tx, digest)?.unwrap_or(BlobCompression::Unknown))
    }

    fn locations(&self, scope: &LocationScope, digest: &Digest) -> Result<Vec<KnownLocation>, CacheError> {
        let mut stmt = self.tx.prepare_cached(
            "SELECT location, last_used FROM known_locations \
             WHERE transport = ?1 AND scope = ?2 AND digest = ?3 \
             ORDER BY last_used DESC, location ASC",
        )?;
        let rows = stmt
            .query_map(
                params![scope.transport, scope.scope, digest.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(location, last_used)| {
                Ok(KnownLocation {
                    location: LocationReference::new(location),
                    last_used: timestamp_from_sql(last_used)?,
                })
            })
            .collect()
    }
}

impl BlobInfoCache for SqliteCache {
    fn uncompressed_digest(&self, digest: &Digest) -> Result<Option<Digest>, CacheError> {
        self.with_read_tx(|tx| resolve_uncompressed(tx, digest))
    }

    fn uncompressed_digest_for_toc(&self, toc: &Digest) -> Result<Option<Digest>, CacheError> {
        self.with_read_tx(|tx| lookup_toc(tx, toc))
    }

    fn record_digest_uncompressed_pair(
        &self,
        compressed: &Digest,
        uncompressed: &Digest,
    ) -> Result<(), CacheError> {
        self.with_write_tx(|tx| {
            match lookup_uncompressed(tx, compressed)? {
                Some(previous) if previous == *uncompressed => return Ok(()),
                Some(previous) => warn!(
                    compressed = %compressed,
                    previous = %previous,
                    uncompressed = %uncompressed,
                    "Uncompressed digest changed, replacing"
                ),
                None => {}
            }
            tx.execute(
                "INSERT INTO digest_uncompressed_pairs(compressed_digest, uncompressed_digest) \
                 VALUES (?1, ?2) \
                 ON CONFLICT(compressed_digest) DO UPDATE SET uncompressed_digest = excluded.uncompressed_digest",
                params![compressed.as_str(), uncompressed.as_str()],
            )?;
            debug!(compressed = %compressed, uncompressed = %uncompressed, "Recorded uncompressed digest");
            Ok(())
        })
    }

    fn record_toc_uncompressed_pair(&self, toc: &Digest, uncompressed: &Digest) -> Result<(), CacheError> {
        self.with_write_tx(|tx| {
            match lookup_toc(tx, toc)? {
                Some(previous) if previous == *uncompressed => return Ok(()),
                Some(previous) => warn!(
                    toc = %toc,
                    previous = %previous,
                    uncompressed = %uncompressed,
                    "Uncompressed digest for TOC changed, replacing"
                ),
                None => {}
            }
            tx.execute(
                "INSERT INTO toc_uncompressed_pairs(toc_digest, uncompressed_digest) \
                 VALUES (?1, ?2) \
                 ON CONFLICT(toc_digest) DO UPDATE SET uncompressed_digest = excluded.uncompressed_digest",
                params![toc.as_str(), uncompressed.as_str()],
            )?;
            debug!(toc = %toc, uncompressed = %uncompressed, "Recorded TOC uncompressed digest");
            Ok(())
        })
    }

    fn record_digest_compression(
        &self,
        digest: &Digest,
        compression: BlobCompression,
    ) -> Result<(), CacheError> {
        if !compression.is_known() {
            return Ok(());
        }
        self.with_write_tx(|tx| {
            match lookup_compression(tx, digest)? {
                Some(previous) if previous == compression => return Ok(()),
                Some(previous) => warn!(
                    digest = %digest,
                    previous = %previous,
                    compression = %compression,
                    "Compression for blob changed, replacing"
                ),
                None => {}
            }
            tx.execute(
                "INSERT INTO digest_compressions(digest, compression) VALUES (?1, ?2) \
                 ON CONFLICT(digest) DO UPDATE SET compression = excluded.compression",
                params![digest.as_str(), compression.name()],
            )?;
            Ok(())
        })
    }

    fn record_known_location(
        &self,
        scope: &LocationScope,
        digest: &Digest,
        location: &LocationReference,
    ) -> Result<(), CacheError> {
        let last_used = self.with_write_tx(|tx| {
            let latest: Option<i64> =
                tx.query_row("SELECT MAX(last_used) FROM known_locations", [], |row| row.get(0))?;
            let latest = latest.map(timestamp_from_sql).transpose()?;
            let now = Timestamp::next_after(latest);

            tx.execute(
                "INSERT INTO known_locations(transport, scope, digest, location, last_used) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(transport, scope, digest, location) DO UPDATE SET last_used = excluded.last_used",
                params![
                    scope.transport,
                    scope.scope,
                    digest.as_str(),
                    location.as_str(),
                    timestamp_to_sql(now)
                ],
            )?;
            Ok(now)
        })?;

        debug!(
            scope = %scope,
            digest = %digest,
            location = %location,
            last_used = last_used.as_nanos(),
            "Recorded known location"
        );
        Ok(())
    }

    fn candidate_locations(
        &self,
        scope: &LocationScope,
        primary: &Digest,
        options: &CandidateOptions,
    ) -> Result<Vec<Candidate>, CacheError> {
        self.with_read_tx(|tx| {
            self.selector
                .select(&Snapshot { tx }, scope, primary, options)
        })
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        self.with_read_tx(|tx| {
            let count = |table: &str| -> Result<usize, CacheError> {
                let n: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
                Ok(usize::try_from(n).unwrap_or(0))
            };
            Ok(CacheStats {
                compression_relations: count("digest_uncompressed_pairs")?,
                toc_relations: count("toc_uncompressed_pairs")?,
                digest_compressions: count("digest_compressions")?,
                known_locations: count("known_locations")?,
            })
        })
    }

    fn close(self: Box<Self>) -> Result<(), CacheError> {
        let SqliteCache { path, writer, .. } = *self;
        writer.into_inner().close().map_err(|(_, e)| e)?;
        info!(path = %path.display(), "Closed blob info cache database");
        Ok(())
    }
}
