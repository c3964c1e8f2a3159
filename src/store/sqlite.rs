//! SQLite template store shared between processes
//!
//! Every pool-server process opens the same database file. The `height`
//! primary key is the uniqueness constraint that makes lock creation a
//! distributed compare-and-swap. Calls run on the blocking thread pool.

use super::TemplateStore;
use crate::{Error, Height, LockOutcome, ProcessIdentity, Result, TemplateRecord};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS template_records (
    height      INTEGER PRIMARY KEY,
    payload     TEXT,
    owner       TEXT,
    acquired_at INTEGER
);
";

/// How long a connection waits on another process's write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Template store backed by an SQLite file
#[derive(Clone)]
pub struct SqliteTemplateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTemplateStore {
    /// Open (and create if missing) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;

        debug!(
            "Opened template store at {} (journal_mode={})",
            path.as_ref().display(),
            mode
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::store("SQLite connection mutex poisoned"))?;
            f(&guard)
        })
        .await
        .map_err(|e| Error::store(format!("Store task failed: {}", e)))?
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl TemplateStore for SqliteTemplateStore {
    async fn get_record(&self, height: Height) -> Result<Option<TemplateRecord>> {
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT payload, owner, acquired_at FROM template_records WHERE height = ?1",
                    params![height as i64],
                    |row| {
                        let acquired_at: Option<i64> = row.get(2)?;
                        Ok(TemplateRecord {
                            height,
                            payload: row.get(0)?,
                            owner: row.get(1)?,
                            acquired_at: acquired_at.and_then(from_millis),
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn create_lock(
        &self,
        height: Height,
        owner: &ProcessIdentity,
        now: DateTime<Utc>,
    ) -> Result<LockOutcome> {
        let owner = owner.as_str().to_string();
        self.with_conn(move |conn| {
            match conn.execute(
                "INSERT INTO template_records (height, payload, owner, acquired_at)
                 VALUES (?1, NULL, ?2, ?3)",
                params![height as i64, owner, to_millis(now)],
            ) {
                Ok(_) => Ok(LockOutcome::Acquired),
                Err(e) if is_unique_violation(&e) => Ok(LockOutcome::AlreadyExists),
                Err(e) => Err(Error::from(e)),
            }
        })
        .await
    }

    async fn save_record(&self, height: Height, payload: &str) -> Result<bool> {
        let payload = payload.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "INSERT INTO template_records (height, payload) VALUES (?1, ?2)
                 ON CONFLICT(height) DO UPDATE SET payload = excluded.payload
                 WHERE template_records.payload IS NULL",
                params![height as i64, payload],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn renew_lease(
        &self,
        height: Height,
        owner: &ProcessIdentity,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let owner = owner.as_str().to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE template_records SET acquired_at = ?3
                 WHERE height = ?1 AND owner = ?2 AND payload IS NULL",
                params![height as i64, owner, to_millis(now)],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn take_over_expired(
        &self,
        height: Height,
        owner: &ProcessIdentity,
        now: DateTime<Utc>,
        expired_before: DateTime<Utc>,
    ) -> Result<LockOutcome> {
        let owner = owner.as_str().to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE template_records SET owner = ?2, acquired_at = ?3
                 WHERE height = ?1 AND payload IS NULL AND acquired_at < ?4",
                params![height as i64, owner, to_millis(now), to_millis(expired_before)],
            )?;
            Ok(if changed == 1 {
                LockOutcome::Acquired
            } else {
                LockOutcome::AlreadyExists
            })
        })
        .await
    }

    async fn release_lock(&self, height: Height, owner: &ProcessIdentity) -> Result<()> {
        let owner = owner.as_str().to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM template_records
                 WHERE height = ?1 AND owner = ?2 AND payload IS NULL",
                params![height as i64, owner],
            )?;
            Ok(())
        })
        .await
    }

    async fn prune_below(&self, height: Height) -> Result<usize> {
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM template_records WHERE height < ?1",
                params![height as i64],
            )?;
            Ok(removed)
        })
        .await
    }
}
