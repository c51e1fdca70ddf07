use core::{fmt, time::Duration};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, ffi, params};

use super::{
    ClassifyStoreError, CounterKey, ReceptionRecord, SequenceTransaction, StoreErrorKind,
    TransactionSource,
};

/// How long a connection waits on SQLite's write lock by default.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS reception_code_seq (
    prefix      TEXT    NOT NULL,
    date_bucket TEXT    NOT NULL,
    last_issued INTEGER NOT NULL CHECK (last_issued >= 0),
    updated_at  TEXT    NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (prefix, date_bucket)
);

CREATE TABLE IF NOT EXISTS sample_receptions (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    reception_code TEXT    NOT NULL,
    sequence       INTEGER NOT NULL,
    category       TEXT    NOT NULL,
    received_at    TEXT    NOT NULL,
    deleted_at     TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS sample_receptions_live_code
    ON sample_receptions (reception_code)
    WHERE deleted_at IS NULL;
";

/// Errors raised by [`SqliteStore`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SqliteStoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    /// A stored integer is negative and cannot be a sequence.
    #[error("column {column} holds {value}, which is not a valid sequence")]
    OutOfRange { column: &'static str, value: i64 },
    /// A sequence does not fit SQLite's signed 64-bit integers.
    #[error("sequence {0} exceeds the SQLite integer range")]
    SequenceTooLarge(u64),
    /// `update_counter` found no row to update.
    #[error("counter row {key} does not exist")]
    MissingCounter { key: CounterKey },
    /// The transaction was already committed or rolled back.
    #[error("transaction already finished")]
    Finished,
    /// A read transaction was asked to write.
    #[error("read transaction cannot write")]
    ReadOnly,
}

impl ClassifyStoreError for SqliteStoreError {
    fn kind(&self) -> StoreErrorKind {
        let Self::Sqlite(e) = self else {
            return StoreErrorKind::Other;
        };
        let Some(e) = e.sqlite_error() else {
            return StoreErrorKind::Other;
        };
        match e.code {
            ErrorCode::ConstraintViolation
                if matches!(
                    e.extended_code,
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                ) =>
            {
                StoreErrorKind::UniqueViolation
            }
            // A WAL snapshot went stale under a concurrent writer.
            ErrorCode::DatabaseBusy if e.extended_code == ffi::SQLITE_BUSY_SNAPSHOT => {
                StoreErrorKind::SerializationFailure
            }
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreErrorKind::LockTimeout,
            _ => StoreErrorKind::Other,
        }
    }
}

struct Inner {
    path: PathBuf,
    busy_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl Inner {
    fn connect(&self) -> Result<Connection, SqliteStoreError> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    fn release(&self, conn: Connection) {
        self.idle.lock().push(conn);
    }
}

/// A store backed by an SQLite database file.
///
/// Each [`SqliteTransaction`] runs on its own pooled connection and opens
/// with `BEGIN IMMEDIATE`, taking SQLite's write lock up front. That lock
/// covers the whole database rather than one counter row, so allocations for
/// different keys serialize here too; uniqueness and ordering are unaffected.
/// Waiting writers give up after the busy timeout with an error classified
/// as [`StoreErrorKind::LockTimeout`]. Previews go through
/// [`SqliteStore::begin_read`] instead and never queue behind a writer.
///
/// Cloning is cheap and every clone shares the connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.inner.path)
            .field("busy_timeout", &self.inner.busy_timeout)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` with the default
    /// busy timeout and makes sure the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] if the database cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SqliteStoreError> {
        Self::with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Like [`open`](Self::open) with an explicit busy timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] if the database cannot be opened or the
    /// schema cannot be created.
    pub fn with_busy_timeout(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
    ) -> Result<Self, SqliteStoreError> {
        let inner = Inner {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
            idle: Mutex::default(),
        };
        let conn = inner.connect()?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        #[cfg(feature = "tracing")]
        tracing::debug!(path = %inner.path.display(), journal_mode = %mode, "opened sqlite store");
        #[cfg(not(feature = "tracing"))]
        let _ = mode;
        conn.execute_batch(SCHEMA)?;
        inner.release(conn);
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn busy_timeout(&self) -> Duration {
        self.inner.busy_timeout
    }

    /// The committed `last_issued` of a counter row.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] if the query fails.
    pub fn counter(&self, key: &CounterKey) -> Result<Option<u64>, SqliteStoreError> {
        self.with_conn(|conn| select_counter(conn, key))
    }

    /// Looks up a live reception by its code.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] if the query fails or the row is corrupt.
    pub fn find_by_code(&self, code: &str) -> Result<Option<ReceptionRecord>, SqliteStoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT reception_code, sequence, category, received_at
                 FROM sample_receptions
                 WHERE reception_code = ?1 AND deleted_at IS NULL",
                params![code],
                RawRecord::from_row,
            )
            .optional()?
            .map(RawRecord::into_record)
            .transpose()
        })
    }

    /// Live receptions received between `from` and `to`, both inclusive.
    /// The latest reception comes first; ties go to the lower sequence.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] if the query fails or a row is corrupt.
    pub fn list_receptions(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<ReceptionRecord>, SqliteStoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT reception_code, sequence, category, received_at
                 FROM sample_receptions
                 WHERE deleted_at IS NULL AND received_at BETWEEN ?1 AND ?2
                 ORDER BY received_at DESC, sequence ASC",
            )?;
            let rows = stmt
                .query_map(params![from, to], RawRecord::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(RawRecord::into_record).collect()
        })
    }

    /// Soft-deletes a live reception, freeing its code for the unique index.
    /// Returns `false` if no live row carries `code`.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] if the update fails.
    pub fn soft_delete(
        &self,
        code: &str,
        deleted_at: NaiveDateTime,
    ) -> Result<bool, SqliteStoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sample_receptions SET deleted_at = ?2
                 WHERE reception_code = ?1 AND deleted_at IS NULL",
                params![code, deleted_at],
            )?;
            Ok(changed > 0)
        })
    }

    /// Live codes starting with `stem`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] if the query fails.
    pub fn live_codes(&self, stem: &str) -> Result<Vec<String>, SqliteStoreError> {
        self.with_conn(|conn| {
            let mut codes = select_codes(conn, stem)?;
            codes.sort_unstable();
            Ok(codes)
        })
    }

    /// Opens a read transaction with `BEGIN DEFERRED`.
    ///
    /// It takes no write lock, so it neither waits for nor blocks an open
    /// [`begin`](TransactionSource::begin) writer, and reads the last
    /// committed snapshot. Counter writes fail with
    /// [`SqliteStoreError::ReadOnly`]. Meant for previews.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] if no connection can be opened.
    pub fn begin_read(&self) -> Result<SqliteTransaction, SqliteStoreError> {
        self.begin_with("BEGIN DEFERRED", true)
    }

    fn begin_with(
        &self,
        sql: &str,
        read_only: bool,
    ) -> Result<SqliteTransaction, SqliteStoreError> {
        let conn = self.inner.connect()?;
        if let Err(e) = conn.execute_batch(sql) {
            self.inner.release(conn);
            return Err(e.into());
        }
        Ok(SqliteTransaction {
            conn: Some(conn),
            store: Arc::clone(&self.inner),
            read_only,
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, SqliteStoreError>,
    ) -> Result<T, SqliteStoreError> {
        let conn = self.inner.connect()?;
        let result = f(&conn);
        self.inner.release(conn);
        result
    }
}

impl TransactionSource for SqliteStore {
    type Tx = SqliteTransaction;

    fn begin(&self) -> Result<SqliteTransaction, SqliteStoreError> {
        self.begin_with("BEGIN IMMEDIATE", false)
    }
}

/// A transaction on a [`SqliteStore`], either a writer from
/// [`begin`](TransactionSource::begin) or a reader from
/// [`begin_read`](SqliteStore::begin_read).
///
/// Dropping it without calling [`commit`] rolls it back.
///
/// [`commit`]: SequenceTransaction::commit
pub struct SqliteTransaction {
    conn: Option<Connection>,
    store: Arc<Inner>,
    read_only: bool,
}

impl fmt::Debug for SqliteTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteTransaction")
            .field("open", &self.conn.is_some())
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl SqliteTransaction {
    fn conn(&self) -> Result<&Connection, SqliteStoreError> {
        self.conn.as_ref().ok_or(SqliteStoreError::Finished)
    }

    fn writer(&self) -> Result<&Connection, SqliteStoreError> {
        if self.read_only {
            return Err(SqliteStoreError::ReadOnly);
        }
        self.conn()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Inserts the reception that owns an allocated code.
    ///
    /// # Errors
    ///
    /// Returns an error classified as [`StoreErrorKind::UniqueViolation`] if
    /// a live row already carries the code.
    pub fn insert_reception(&mut self, record: &ReceptionRecord) -> Result<(), SqliteStoreError> {
        let sequence = to_integer(record.sequence)?;
        self.writer()?.execute(
            "INSERT INTO sample_receptions (reception_code, sequence, category, received_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![record.code, sequence, record.category, record.received_at],
        )?;
        Ok(())
    }

    fn finish(&mut self, commit: bool) -> Result<(), SqliteStoreError> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        let result = conn.execute_batch(if commit { "COMMIT" } else { "ROLLBACK" });
        // A failed COMMIT leaves the transaction open.
        if conn.is_autocommit() || conn.execute_batch("ROLLBACK").is_ok() {
            self.store.release(conn);
        }
        result.map_err(Into::into)
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if let Err(_e) = self.finish(false) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_e, "rollback on drop failed");
        }
    }
}

impl SequenceTransaction for SqliteTransaction {
    type Error = SqliteStoreError;

    fn lock_counter(&mut self, key: &CounterKey) -> Result<Option<u64>, Self::Error> {
        // BEGIN IMMEDIATE already holds the database write lock.
        select_counter(self.writer()?, key)
    }

    fn read_counter(&mut self, key: &CounterKey) -> Result<Option<u64>, Self::Error> {
        select_counter(self.conn()?, key)
    }

    fn insert_counter(&mut self, key: &CounterKey, last_issued: u64) -> Result<bool, Self::Error> {
        let changed = self.writer()?.execute(
            "INSERT INTO reception_code_seq (prefix, date_bucket, last_issued)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (prefix, date_bucket) DO NOTHING",
            params![key.prefix(), key.bucket(), to_integer(last_issued)?],
        )?;
        Ok(changed == 1)
    }

    fn update_counter(&mut self, key: &CounterKey, last_issued: u64) -> Result<(), Self::Error> {
        let changed = self.writer()?.execute(
            "UPDATE reception_code_seq
             SET last_issued = ?3, updated_at = CURRENT_TIMESTAMP
             WHERE prefix = ?1 AND date_bucket = ?2",
            params![key.prefix(), key.bucket(), to_integer(last_issued)?],
        )?;
        if changed == 0 {
            return Err(SqliteStoreError::MissingCounter { key: key.clone() });
        }
        Ok(())
    }

    fn scan_codes(&mut self, stem: &str) -> Result<Vec<String>, Self::Error> {
        select_codes(self.conn()?, stem)
    }

    fn code_exists(&mut self, code: &str) -> Result<bool, Self::Error> {
        Ok(self.conn()?.query_row(
            "SELECT EXISTS (
                 SELECT 1 FROM sample_receptions
                 WHERE reception_code = ?1 AND deleted_at IS NULL
             )",
            params![code],
            |row| row.get(0),
        )?)
    }

    fn commit(mut self) -> Result<(), Self::Error> {
        self.finish(true)
    }

    fn rollback(mut self) -> Result<(), Self::Error> {
        self.finish(false)
    }
}

/// A `sample_receptions` row before its sequence is range-checked.
struct RawRecord {
    code: String,
    sequence: i64,
    category: String,
    received_at: NaiveDateTime,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            code: row.get(0)?,
            sequence: row.get(1)?,
            category: row.get(2)?,
            received_at: row.get(3)?,
        })
    }

    fn into_record(self) -> Result<ReceptionRecord, SqliteStoreError> {
        Ok(ReceptionRecord {
            code: self.code,
            sequence: to_sequence("sequence", self.sequence)?,
            category: self.category,
            received_at: self.received_at,
        })
    }
}

fn select_counter(conn: &Connection, key: &CounterKey) -> Result<Option<u64>, SqliteStoreError> {
    conn.query_row(
        "SELECT last_issued FROM reception_code_seq WHERE prefix = ?1 AND date_bucket = ?2",
        params![key.prefix(), key.bucket()],
        |row| row.get::<_, i64>(0),
    )
    .optional()?
    .map(|value| to_sequence("last_issued", value))
    .transpose()
}

fn select_codes(conn: &Connection, stem: &str) -> Result<Vec<String>, SqliteStoreError> {
    // substr() rather than LIKE: prefixes may contain '_', a LIKE wildcard.
    let mut stmt = conn.prepare_cached(
        "SELECT reception_code FROM sample_receptions
         WHERE deleted_at IS NULL AND substr(reception_code, 1, length(?1)) = ?1",
    )?;
    let codes = stmt
        .query_map(params![stem], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(codes)
}

fn to_integer(sequence: u64) -> Result<i64, SqliteStoreError> {
    i64::try_from(sequence).map_err(|_| SqliteStoreError::SequenceTooLarge(sequence))
}

fn to_sequence(column: &'static str, value: i64) -> Result<u64, SqliteStoreError> {
    u64::try_from(value).map_err(|_| SqliteStoreError::OutOfRange { column, value })
}
