use core::{convert::Infallible, fmt};

use chrono::NaiveDateTime;

/// Identifies one counter row: a prefix within one date bucket.
///
/// Categories that share a prefix share the counter, so codes stay unique
/// across them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    prefix: String,
    bucket: String,
}

impl CounterKey {
    pub fn new(prefix: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            bucket: bucket.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?}, {:?})", self.prefix, self.bucket)
    }
}

/// Driver-independent classification of a store failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// A unique constraint or primary key rejected a write.
    UniqueViolation,
    /// The database aborted the transaction to preserve serializability.
    SerializationFailure,
    /// A lock or busy wait exceeded its timeout.
    LockTimeout,
    /// Anything else. Never retried.
    Other,
}

impl StoreErrorKind {
    /// Whether a fresh transaction may succeed where this one failed.
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::Other)
    }
}

/// Classifies driver errors without matching on messages or raw codes.
///
/// Each driver implements this once for its error type; the allocator only
/// ever asks for the [`StoreErrorKind`].
pub trait ClassifyStoreError {
    fn kind(&self) -> StoreErrorKind;

    fn is_unique_violation(&self) -> bool {
        self.kind() == StoreErrorKind::UniqueViolation
    }
}

impl ClassifyStoreError for Infallible {
    fn kind(&self) -> StoreErrorKind {
        match *self {}
    }
}

/// The operations the allocator needs inside an open transaction.
///
/// The transaction is owned by the caller: the allocator reads and bumps the
/// counter through it, and the caller inserts the owning record through the
/// same handle before committing. Dropping a transaction without committing
/// must roll it back.
///
/// Implementations map these onto their database:
///
/// | operation          | SQL shape                                                      |
/// |--------------------|----------------------------------------------------------------|
/// | `lock_counter`     | `SELECT last_issued ... FOR UPDATE` (blocking, no `SKIP LOCKED`) |
/// | `read_counter`     | `SELECT last_issued ...`                                        |
/// | `insert_counter`   | `INSERT ... ON CONFLICT DO NOTHING`                             |
/// | `update_counter`   | `UPDATE ... SET last_issued = ?`                                |
/// | `scan_codes`       | `SELECT code ... WHERE code LIKE 'stem%' AND deleted_at IS NULL` |
/// | `code_exists`      | `SELECT 1 ... WHERE code = ? AND deleted_at IS NULL`            |
pub trait SequenceTransaction {
    /// The driver's error type.
    type Error: core::error::Error + ClassifyStoreError + Send + Sync + 'static;

    /// Reads the counter row for `key`, taking a row-level write lock that is
    /// held until the transaction ends. Blocks while another transaction
    /// holds the lock. Returns `None` if the row does not exist.
    fn lock_counter(&mut self, key: &CounterKey) -> Result<Option<u64>, Self::Error>;

    /// Reads the counter row for `key` without locking it.
    fn read_counter(&mut self, key: &CounterKey) -> Result<Option<u64>, Self::Error>;

    /// Inserts a counter row seeded with `last_issued` and locks it.
    ///
    /// Returns `Ok(false)` if the row already exists, including when a
    /// concurrent transaction inserted it first. Drivers that cannot express
    /// "do nothing on conflict" may instead return an error classified as
    /// [`StoreErrorKind::UniqueViolation`].
    fn insert_counter(&mut self, key: &CounterKey, last_issued: u64) -> Result<bool, Self::Error>;

    /// Overwrites `last_issued` of a row this transaction holds locked.
    fn update_counter(&mut self, key: &CounterKey, last_issued: u64) -> Result<(), Self::Error>;

    /// Returns the codes of all live (non-deleted) records starting with
    /// `stem`.
    fn scan_codes(&mut self, stem: &str) -> Result<Vec<String>, Self::Error>;

    /// Whether a live record already carries `code`.
    fn code_exists(&mut self, code: &str) -> Result<bool, Self::Error>;

    /// Makes every write of this transaction durable and releases its locks.
    fn commit(self) -> Result<(), Self::Error>
    where
        Self: Sized;

    /// Discards every write of this transaction and releases its locks.
    fn rollback(self) -> Result<(), Self::Error>
    where
        Self: Sized;
}

/// Opens transactions against a store.
pub trait TransactionSource {
    type Tx: SequenceTransaction;

    /// Begins a new read-write transaction.
    fn begin(&self) -> Result<Self::Tx, <Self::Tx as SequenceTransaction>::Error>;
}

impl<S: TransactionSource + ?Sized> TransactionSource for &S {
    type Tx = S::Tx;

    fn begin(&self) -> Result<Self::Tx, <Self::Tx as SequenceTransaction>::Error> {
        (**self).begin()
    }
}

/// A sample reception row: the record that owns an allocated code.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ReceptionRecord {
    pub code: String,
    pub sequence: u64,
    /// Key of the category the code was allocated under.
    pub category: String,
    pub received_at: NaiveDateTime,
}

/// The driver error type of a [`TransactionSource`].
pub type TxError<S> = <<S as TransactionSource>::Tx as SequenceTransaction>::Error;
