use core::{fmt, time::Duration};
use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
};

use chrono::NaiveDateTime;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use portable_atomic::{AtomicU64, Ordering};

use super::{
    ClassifyStoreError, CounterKey, ReceptionRecord, SequenceTransaction, StoreErrorKind,
    TransactionSource,
};

/// How long a [`MemoryTransaction`] waits for a counter row lock by default.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

type RowLock = Arc<Mutex<Option<u64>>>;
type RowGuard = ArcMutexGuard<RawMutex, Option<u64>>;

/// Errors raised by [`MemoryStore`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum MemoryStoreError {
    /// A live reception already uses this code.
    #[error("duplicate reception code {code:?}")]
    UniqueViolation { code: String },
    /// Waiting for a counter row lock took longer than the store's timeout.
    #[error("timed out after {timeout:?} waiting for the counter row {key}")]
    LockTimeout { key: CounterKey, timeout: Duration },
    /// `update_counter` was called on a row this transaction does not hold.
    #[error("counter row {key} is not locked by this transaction")]
    NotLocked { key: CounterKey },
}

impl ClassifyStoreError for MemoryStoreError {
    fn kind(&self) -> StoreErrorKind {
        match self {
            Self::UniqueViolation { .. } => StoreErrorKind::UniqueViolation,
            Self::LockTimeout { .. } => StoreErrorKind::LockTimeout,
            Self::NotLocked { .. } => StoreErrorKind::Other,
        }
    }
}

#[derive(Debug)]
struct LiveRow {
    record: ReceptionRecord,
    /// The uncommitted transaction that inserted this row, if any.
    owner: Option<u64>,
}

impl LiveRow {
    fn visible_to(&self, tx: u64) -> bool {
        self.owner.is_none_or(|owner| owner == tx)
    }
}

#[derive(Debug, Default)]
struct Receptions {
    live: HashMap<String, LiveRow>,
    deleted: Vec<(ReceptionRecord, NaiveDateTime)>,
}

#[derive(Debug)]
struct Shared {
    rows: Mutex<HashMap<CounterKey, RowLock>>,
    committed: Mutex<HashMap<CounterKey, u64>>,
    receptions: Mutex<Receptions>,
    next_tx: AtomicU64,
    lock_timeout: Duration,
}

/// An in-process transactional store.
///
/// Counter rows carry real blocking locks: a [`MemoryTransaction`] that locks
/// a row keeps it locked until it commits, rolls back or is dropped, and any
/// other transaction touching the same row waits (up to the lock timeout).
/// Rows for different keys lock independently.
///
/// Reception rows follow read-committed visibility: a transaction sees its own
/// uncommitted inserts and everyone's committed ones. The code column carries
/// a unique index over live (not soft-deleted) rows.
///
/// Cloning is cheap and every clone shares the same data.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                rows: Mutex::default(),
                committed: Mutex::default(),
                receptions: Mutex::default(),
                next_tx: AtomicU64::new(1),
                lock_timeout,
            }),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.shared.lock_timeout
    }

    /// The committed `last_issued` of a counter row.
    pub fn counter(&self, key: &CounterKey) -> Option<u64> {
        self.shared.committed.lock().get(key).copied()
    }

    /// Overwrites a counter row outside any transaction, waiting for its lock.
    pub fn set_counter(&self, key: &CounterKey, last_issued: u64) {
        let row = self.shared.row(key);
        let mut guard = row.lock();
        *guard = Some(last_issued);
        self.shared.committed.lock().insert(key.clone(), last_issued);
    }

    /// Looks up a committed, live reception by its code.
    pub fn find_by_code(&self, code: &str) -> Option<ReceptionRecord> {
        let receptions = self.shared.receptions.lock();
        receptions
            .live
            .get(code)
            .filter(|row| row.owner.is_none())
            .map(|row| row.record.clone())
    }

    /// Soft-deletes a committed reception, freeing its code for the unique
    /// index. Returns `false` if no committed live row carries `code`.
    pub fn soft_delete(&self, code: &str, deleted_at: NaiveDateTime) -> bool {
        let mut guard = self.shared.receptions.lock();
        let receptions = &mut *guard;
        match receptions.live.entry(code.to_owned()) {
            Entry::Occupied(row) if row.get().owner.is_none() => {
                receptions.deleted.push((row.remove().record, deleted_at));
                true
            }
            _ => false,
        }
    }

    /// Committed live codes, sorted.
    pub fn live_codes(&self) -> Vec<String> {
        let receptions = self.shared.receptions.lock();
        let mut codes: Vec<_> = receptions
            .live
            .iter()
            .filter(|(_, row)| row.owner.is_none())
            .map(|(code, _)| code.clone())
            .collect();
        codes.sort_unstable();
        codes
    }

    /// Number of soft-deleted receptions.
    pub fn deleted_len(&self) -> usize {
        self.shared.receptions.lock().deleted.len()
    }
}

impl Shared {
    fn row(&self, key: &CounterKey) -> RowLock {
        Arc::clone(self.rows.lock().entry(key.clone()).or_default())
    }

    fn lock_row(&self, key: &CounterKey) -> Result<RowGuard, MemoryStoreError> {
        self.row(key)
            .try_lock_arc_for(self.lock_timeout)
            .ok_or_else(|| MemoryStoreError::LockTimeout {
                key: key.clone(),
                timeout: self.lock_timeout,
            })
    }
}

impl TransactionSource for MemoryStore {
    type Tx = MemoryTransaction;

    fn begin(&self) -> Result<MemoryTransaction, MemoryStoreError> {
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            id: self.shared.next_tx.fetch_add(1, Ordering::Relaxed),
            locked: HashMap::new(),
            inserted: Vec::new(),
            finished: false,
        })
    }
}

struct LockedRow {
    guard: RowGuard,
    original: Option<u64>,
}

/// A transaction against a [`MemoryStore`].
///
/// Dropping it without calling [`commit`] rolls it back.
///
/// [`commit`]: SequenceTransaction::commit
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    id: u64,
    locked: HashMap<CounterKey, LockedRow>,
    inserted: Vec<String>,
    finished: bool,
}

impl fmt::Debug for MemoryTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransaction")
            .field("id", &self.id)
            .field("locked", &self.locked.keys().collect::<Vec<_>>())
            .field("inserted", &self.inserted)
            .finish_non_exhaustive()
    }
}

impl MemoryTransaction {
    /// Inserts the reception that owns an allocated code.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryStoreError::UniqueViolation`] if a live row, committed
    /// or not, already carries the code.
    pub fn insert_reception(&mut self, record: ReceptionRecord) -> Result<(), MemoryStoreError> {
        let mut receptions = self.shared.receptions.lock();
        match receptions.live.entry(record.code.clone()) {
            Entry::Occupied(_) => Err(MemoryStoreError::UniqueViolation { code: record.code }),
            Entry::Vacant(slot) => {
                self.inserted.push(slot.key().clone());
                slot.insert(LiveRow {
                    record,
                    owner: Some(self.id),
                });
                Ok(())
            }
        }
    }

    fn finish(&mut self, commit: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        // Publish receptions before releasing the row locks so the next
        // holder's scan sees them.
        {
            let mut receptions = self.shared.receptions.lock();
            for code in self.inserted.drain(..) {
                if commit {
                    if let Some(row) = receptions.live.get_mut(&code) {
                        row.owner = None;
                    }
                } else {
                    receptions.live.remove(&code);
                }
            }
        }

        let mut committed = self.shared.committed.lock();
        for (key, mut row) in self.locked.drain() {
            if commit {
                if let Some(last_issued) = *row.guard {
                    committed.insert(key, last_issued);
                }
            } else {
                *row.guard = row.original;
            }
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.finish(false);
    }
}

impl SequenceTransaction for MemoryTransaction {
    type Error = MemoryStoreError;

    fn lock_counter(&mut self, key: &CounterKey) -> Result<Option<u64>, Self::Error> {
        if let Some(row) = self.locked.get(key) {
            return Ok(*row.guard);
        }
        let guard = self.shared.lock_row(key)?;
        let Some(last_issued) = *guard else {
            // No row to lock; the guard drops here.
            return Ok(None);
        };
        self.locked.insert(
            key.clone(),
            LockedRow {
                guard,
                original: Some(last_issued),
            },
        );
        Ok(Some(last_issued))
    }

    fn read_counter(&mut self, key: &CounterKey) -> Result<Option<u64>, Self::Error> {
        if let Some(row) = self.locked.get(key) {
            return Ok(*row.guard);
        }
        Ok(self.shared.committed.lock().get(key).copied())
    }

    fn insert_counter(&mut self, key: &CounterKey, last_issued: u64) -> Result<bool, Self::Error> {
        if self.locked.contains_key(key) {
            return Ok(false);
        }
        let mut guard = self.shared.lock_row(key)?;
        if guard.is_some() {
            return Ok(false);
        }
        *guard = Some(last_issued);
        self.locked
            .insert(key.clone(), LockedRow { guard, original: None });
        Ok(true)
    }

    fn update_counter(&mut self, key: &CounterKey, last_issued: u64) -> Result<(), Self::Error> {
        let row = self
            .locked
            .get_mut(key)
            .ok_or_else(|| MemoryStoreError::NotLocked { key: key.clone() })?;
        *row.guard = Some(last_issued);
        Ok(())
    }

    fn scan_codes(&mut self, stem: &str) -> Result<Vec<String>, Self::Error> {
        let receptions = self.shared.receptions.lock();
        Ok(receptions
            .live
            .iter()
            .filter(|(code, row)| row.visible_to(self.id) && code.starts_with(stem))
            .map(|(code, _)| code.clone())
            .collect())
    }

    fn code_exists(&mut self, code: &str) -> Result<bool, Self::Error> {
        let receptions = self.shared.receptions.lock();
        Ok(receptions
            .live
            .get(code)
            .is_some_and(|row| row.visible_to(self.id)))
    }

    fn commit(mut self) -> Result<(), Self::Error> {
        self.finish(true);
        Ok(())
    }

    fn rollback(mut self) -> Result<(), Self::Error> {
        self.finish(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use chrono::NaiveDate;

    use super::*;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 12, day)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn record(code: &str) -> ReceptionRecord {
        ReceptionRecord {
            code: code.to_owned(),
            sequence: 1,
            category: "BLOOD".to_owned(),
            received_at: at(11),
        }
    }

    #[test]
    fn classifies_errors() {
        let key = CounterKey::new("A", "25");
        assert!(MemoryStoreError::UniqueViolation { code: "x".into() }.is_unique_violation());
        assert_eq!(
            MemoryStoreError::LockTimeout { key: key.clone(), timeout: Duration::ZERO }.kind(),
            StoreErrorKind::LockTimeout
        );
        assert!(!MemoryStoreError::NotLocked { key }.kind().is_retryable());
    }

    #[test]
    fn uncommitted_receptions_are_private() {
        let store = MemoryStore::new();
        let mut writer = store.begin().unwrap();
        let mut reader = store.begin().unwrap();

        writer.insert_reception(record("BLOOD2512.0001")).unwrap();
        assert!(writer.code_exists("BLOOD2512.0001").unwrap());
        assert_eq!(writer.scan_codes("BLOOD2512.").unwrap().len(), 1);
        assert!(!reader.code_exists("BLOOD2512.0001").unwrap());
        assert!(reader.scan_codes("BLOOD2512.").unwrap().is_empty());
        assert!(store.find_by_code("BLOOD2512.0001").is_none());

        writer.commit().unwrap();
        assert!(reader.code_exists("BLOOD2512.0001").unwrap());
        assert_eq!(store.find_by_code("BLOOD2512.0001"), Some(record("BLOOD2512.0001")));
    }

    #[test]
    fn unique_index_covers_live_rows_only() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.insert_reception(record("BLOOD2512.0001")).unwrap();
        assert!(matches!(
            tx.insert_reception(record("BLOOD2512.0001")),
            Err(MemoryStoreError::UniqueViolation { .. })
        ));
        tx.commit().unwrap();

        assert!(store.soft_delete("BLOOD2512.0001", at(12)));
        assert!(!store.soft_delete("BLOOD2512.0001", at(12)));
        assert_eq!(store.deleted_len(), 1);

        let mut tx = store.begin().unwrap();
        assert!(!tx.code_exists("BLOOD2512.0001").unwrap());
        tx.insert_reception(record("BLOOD2512.0001")).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.live_codes(), vec!["BLOOD2512.0001".to_owned()]);
    }

    #[test]
    fn drop_rolls_back() {
        let store = MemoryStore::new();
        let key = CounterKey::new("BLOOD", "2512");
        {
            let mut tx = store.begin().unwrap();
            assert!(tx.insert_counter(&key, 3).unwrap());
            tx.update_counter(&key, 4).unwrap();
            tx.insert_reception(record("BLOOD2512.0004")).unwrap();
        }
        assert_eq!(store.counter(&key), None);
        assert!(store.live_codes().is_empty());

        store.set_counter(&key, 7);
        {
            let mut tx = store.begin().unwrap();
            assert_eq!(tx.lock_counter(&key).unwrap(), Some(7));
            tx.update_counter(&key, 8).unwrap();
        }
        let mut tx = store.begin().unwrap();
        assert_eq!(tx.lock_counter(&key).unwrap(), Some(7));
    }

    #[test]
    fn update_requires_the_row_lock() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let key = CounterKey::new("A", "");
        assert!(matches!(
            tx.update_counter(&key, 1),
            Err(MemoryStoreError::NotLocked { .. })
        ));
    }

    #[test]
    fn row_lock_times_out() {
        let store = MemoryStore::with_lock_timeout(Duration::from_millis(20));
        let key = CounterKey::new("A", "25");

        let mut holder = store.begin().unwrap();
        assert!(holder.insert_counter(&key, 0).unwrap());

        let mut waiter = store.begin().unwrap();
        let err = waiter.lock_counter(&key).unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::LockTimeout);
        assert_eq!(waiter.read_counter(&key).unwrap(), None);

        // Other keys are unaffected.
        let other = CounterKey::new("A", "26");
        assert!(waiter.insert_counter(&other, 0).unwrap());
    }

    #[test]
    fn row_lock_blocks_until_commit() {
        let store = MemoryStore::new();
        let key = CounterKey::new("A", "25");

        let mut holder = store.begin().unwrap();
        assert!(holder.insert_counter(&key, 0).unwrap());
        holder.update_counter(&key, 1).unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| {
                let started = Instant::now();
                let mut tx = store.begin().unwrap();
                let seen = tx.lock_counter(&key).unwrap();
                (seen, started.elapsed())
            });

            thread::sleep(Duration::from_millis(50));
            holder.commit().unwrap();

            let (seen, waited) = waiter.join().unwrap();
            assert_eq!(seen, Some(1));
            assert!(waited >= Duration::from_millis(40));
        });
    }

    #[test]
    fn losing_counter_insert_reports_existing_row() {
        let store = MemoryStore::new();
        let key = CounterKey::new("A", "25");

        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();
        assert_eq!(first.lock_counter(&key).unwrap(), None);
        assert_eq!(second.lock_counter(&key).unwrap(), None);

        assert!(first.insert_counter(&key, 0).unwrap());
        first.commit().unwrap();

        assert!(!second.insert_counter(&key, 0).unwrap());
        assert_eq!(second.lock_counter(&key).unwrap(), Some(0));
    }
}
