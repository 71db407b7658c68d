//! Yoke persistence: append-only revision history per release on SQLite.
//!
//! Every write runs in a `BEGIN IMMEDIATE` transaction and checks the active
//! sequence the caller expects, so two writers on one release cannot both win.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use metrics::{counter, histogram};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;
use yoke_core::prelude::*;
use yoke_core::Settings;

pub trait RevisionStore: Send + Sync {
    /// Record `resources` as the next revision and make it active.
    /// `expected_active` is the active sequence the caller based its work on.
    fn append(&self, release: &ReleaseRef, resources: &ResourceSet, source: &SourceDescriptor, expected_active: Option<u64>) -> Result<Revision>;
    fn get_active(&self, release: &ReleaseRef) -> Result<Revision>;
    fn get_by_sequence(&self, release: &ReleaseRef, sequence: u64) -> Result<Revision>;
    fn history(&self, release: &ReleaseRef) -> Result<ReleaseHistory>;
    /// Make an existing revision active again. Newer revisions are kept.
    fn reactivate(&self, release: &ReleaseRef, sequence: u64, expected_active: Option<u64>) -> Result<Revision>;
    /// Drop all history of `release`.
    fn remove(&self, release: &ReleaseRef) -> Result<()>;
    fn releases(&self, namespace: Option<&str>) -> Result<Vec<ReleaseRef>>;
}

fn store_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS revisions (
    namespace TEXT    NOT NULL,
    release   TEXT    NOT NULL,
    seq       INTEGER NOT NULL,
    ts        INTEGER NOT NULL,
    source    TEXT    NOT NULL,
    resources BLOB    NOT NULL,
    count     INTEGER NOT NULL,
    active    INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (namespace, release, seq)
);
CREATE TABLE IF NOT EXISTS activations (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace TEXT    NOT NULL,
    release   TEXT    NOT NULL,
    seq       INTEGER NOT NULL,
    ts        INTEGER NOT NULL,
    kind      TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_activations_release ON activations(namespace, release, id);
";

/// SQLite-backed store. Synchronous; every call is short.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        Self::open(&Settings::from_env().db_path)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let started = std::time::Instant::now();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let db = Connection::open(path).map_err(|e| Error::Store(format!("opening sqlite db at {}: {e}", path.display())))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.busy_timeout(std::time::Duration::from_secs(5)).map_err(store_err)?;
        let me = Self::init(db)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(store_err)?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute_batch(SCHEMA).map_err(|e| Error::Store(format!("creating schema: {e}")))?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| Error::Store("sqlite connection lock poisoned".into()))
    }

    fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate).map_err(store_err)?;
        let out = f(&tx)?;
        tx.commit().map_err(store_err)?;
        Ok(out)
    }
}

fn active_seq(db: &Connection, release: &ReleaseRef) -> Result<Option<u64>> {
    db.query_row(
        "SELECT seq FROM revisions WHERE namespace = ?1 AND release = ?2 AND active = 1",
        params![release.namespace, release.name],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|s| s.map(|s| s as u64))
    .map_err(store_err)
}

fn exists(db: &Connection, release: &ReleaseRef) -> Result<bool> {
    db.query_row(
        "SELECT EXISTS(SELECT 1 FROM revisions WHERE namespace = ?1 AND release = ?2)",
        params![release.namespace, release.name],
        |r| r.get::<_, bool>(0),
    )
    .map_err(store_err)
}

fn check_expected(db: &Connection, release: &ReleaseRef, expected: Option<u64>) -> Result<()> {
    let found = active_seq(db, release)?;
    if found != expected {
        return Err(Error::ConcurrentModification {
            release: release.clone(),
            reason: format!("expected active revision {}, found {}", fmt_seq(expected), fmt_seq(found)),
        });
    }
    Ok(())
}

fn fmt_seq(s: Option<u64>) -> String {
    s.map_or_else(|| "none".to_string(), |s| s.to_string())
}

fn record_activation(db: &Connection, release: &ReleaseRef, seq: u64, kind: ActivationKind) -> Result<()> {
    let kind = match kind {
        ActivationKind::Append => "append",
        ActivationKind::Reactivate => "reactivate",
    };
    db.execute(
        "INSERT INTO activations(namespace, release, seq, ts, kind) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![release.namespace, release.name, seq as i64, now_ts(), kind],
    )
    .map_err(store_err)?;
    Ok(())
}

fn load(db: &Connection, release: &ReleaseRef, seq: u64) -> Result<Option<Revision>> {
    let row = db
        .query_row(
            "SELECT ts, source, resources, active FROM revisions WHERE namespace = ?1 AND release = ?2 AND seq = ?3",
            params![release.namespace, release.name, seq as i64],
            |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, Vec<u8>>(2)?, r.get::<_, bool>(3)?)),
        )
        .optional()
        .map_err(store_err)?;
    let Some((ts, source, blob, active)) = row else { return Ok(None) };
    Ok(Some(Revision {
        release: release.clone(),
        sequence: seq,
        resources: serde_json::from_slice(&maybe_decompress(&blob))?,
        created_at: ts,
        source: serde_json::from_str(&source)?,
        active,
    }))
}

impl RevisionStore for SqliteStore {
    fn append(&self, release: &ReleaseRef, resources: &ResourceSet, source: &SourceDescriptor, expected_active: Option<u64>) -> Result<Revision> {
        let started = std::time::Instant::now();
        let body = maybe_compress(&serde_json::to_vec(resources)?);
        let source_json = serde_json::to_string(source)?;
        let ts = now_ts();
        let seq = self.write(|tx| {
            check_expected(tx, release, expected_active)?;
            let next: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM revisions WHERE namespace = ?1 AND release = ?2",
                    params![release.namespace, release.name],
                    |r| r.get(0),
                )
                .map_err(store_err)?;
            tx.execute("UPDATE revisions SET active = 0 WHERE namespace = ?1 AND release = ?2", params![release.namespace, release.name])
                .map_err(store_err)?;
            tx.execute(
                "INSERT INTO revisions(namespace, release, seq, ts, source, resources, count, active) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
                params![release.namespace, release.name, next, ts, source_json, body, resources.len() as i64],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                    Error::ConcurrentModification { release: release.clone(), reason: format!("revision {next} already exists") }
                }
                other => store_err(other),
            })?;
            record_activation(tx, release, next as u64, ActivationKind::Append)?;
            Ok(next as u64)
        })?;
        histogram!("persist_append_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_append_total", 1u64);
        debug!(release = %release, revision = seq, resources = resources.len(), "revision appended");
        Ok(Revision { release: release.clone(), sequence: seq, resources: resources.clone(), created_at: ts, source: source.clone(), active: true })
    }

    fn get_active(&self, release: &ReleaseRef) -> Result<Revision> {
        let db = self.conn()?;
        let Some(seq) = active_seq(&db, release)? else {
            return Err(Error::NotFoundRelease(release.clone()));
        };
        load(&db, release, seq)?.ok_or_else(|| Error::NotFoundRelease(release.clone()))
    }

    fn get_by_sequence(&self, release: &ReleaseRef, sequence: u64) -> Result<Revision> {
        let db = self.conn()?;
        match load(&db, release, sequence)? {
            Some(r) => Ok(r),
            None if exists(&db, release)? => Err(Error::NotFoundRevision { release: release.clone(), sequence }),
            None => Err(Error::NotFoundRelease(release.clone())),
        }
    }

    fn history(&self, release: &ReleaseRef) -> Result<ReleaseHistory> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db
            .prepare("SELECT seq, ts, source, active, count FROM revisions WHERE namespace = ?1 AND release = ?2 ORDER BY seq")
            .map_err(store_err)?;
        let mut rows = stmt.query(params![release.namespace, release.name]).map_err(store_err)?;
        let mut revisions = Vec::new();
        while let Some(row) = rows.next().map_err(store_err)? {
            let source: String = row.get(2).map_err(store_err)?;
            revisions.push(RevisionMeta {
                sequence: row.get::<_, i64>(0).map_err(store_err)? as u64,
                created_at: row.get(1).map_err(store_err)?,
                source: serde_json::from_str(&source)?,
                active: row.get(3).map_err(store_err)?,
                resource_count: row.get::<_, i64>(4).map_err(store_err)? as usize,
            });
        }
        if revisions.is_empty() {
            return Err(Error::NotFoundRelease(release.clone()));
        }

        let mut stmt = db
            .prepare("SELECT seq, ts, kind FROM activations WHERE namespace = ?1 AND release = ?2 ORDER BY id")
            .map_err(store_err)?;
        let mut rows = stmt.query(params![release.namespace, release.name]).map_err(store_err)?;
        let mut activations = Vec::new();
        while let Some(row) = rows.next().map_err(store_err)? {
            let kind: String = row.get(2).map_err(store_err)?;
            activations.push(Activation {
                sequence: row.get::<_, i64>(0).map_err(store_err)? as u64,
                at: row.get(1).map_err(store_err)?,
                kind: if kind == "reactivate" { ActivationKind::Reactivate } else { ActivationKind::Append },
            });
        }
        histogram!("persist_history_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(ReleaseHistory { release: release.clone(), revisions, activations })
    }

    fn reactivate(&self, release: &ReleaseRef, sequence: u64, expected_active: Option<u64>) -> Result<Revision> {
        self.write(|tx| {
            if !exists(tx, release)? {
                return Err(Error::NotFoundRelease(release.clone()));
            }
            check_expected(tx, release, expected_active)?;
            let Some(mut rev) = load(tx, release, sequence)? else {
                return Err(Error::NotFoundRevision { release: release.clone(), sequence });
            };
            tx.execute(
                "UPDATE revisions SET active = (seq = ?3) WHERE namespace = ?1 AND release = ?2",
                params![release.namespace, release.name, sequence as i64],
            )
            .map_err(store_err)?;
            record_activation(tx, release, sequence, ActivationKind::Reactivate)?;
            rev.active = true;
            Ok(rev)
        })
        .inspect(|_| {
            counter!("persist_reactivate_total", 1u64);
            debug!(release = %release, revision = sequence, "revision reactivated");
        })
    }

    fn remove(&self, release: &ReleaseRef) -> Result<()> {
        self.write(|tx| {
            let n = tx
                .execute("DELETE FROM revisions WHERE namespace = ?1 AND release = ?2", params![release.namespace, release.name])
                .map_err(store_err)?;
            if n == 0 {
                return Err(Error::NotFoundRelease(release.clone()));
            }
            tx.execute("DELETE FROM activations WHERE namespace = ?1 AND release = ?2", params![release.namespace, release.name])
                .map_err(store_err)?;
            Ok(())
        })?;
        debug!(release = %release, "release history removed");
        Ok(())
    }

    fn releases(&self, namespace: Option<&str>) -> Result<Vec<ReleaseRef>> {
        let db = self.conn()?;
        let mut stmt = db
            .prepare(
                "SELECT DISTINCT namespace, release FROM revisions
                 WHERE ?1 IS NULL OR namespace = ?1 ORDER BY namespace, release",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![namespace], |r| Ok(ReleaseRef::new(r.get::<_, String>(1)?, r.get::<_, String>(0)?)))
            .map_err(store_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)
    }
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

pub fn maybe_compress(raw: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("YOKE_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(raw, lvl).unwrap_or_else(|_| raw.to_vec());
    }
    raw.to_vec()
}

/// Inverse of [`maybe_compress`]; uncompressed blobs pass through.
pub fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}
