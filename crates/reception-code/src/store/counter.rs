#[cfg(feature = "tracing")]
use tracing::instrument;

use super::{ClassifyStoreError, CounterKey, SequenceTransaction};
use crate::{CodeFormatter, Error, Result, code_stem};

/// How many times the counter row may vanish between an insert that found it
/// present and the following locked re-read before giving up.
pub const DEFAULT_MAX_INSERT_RACES: u32 = 8;

/// A strategy that hands out the next sequence number for a counter key.
///
/// Implementations run entirely inside the caller's transaction. Whatever
/// they lock stays locked until that transaction commits or rolls back.
pub trait SequenceSource {
    /// Reserves and returns the next sequence for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the driver fails, or a strategy-specific
    /// error if no sequence can be produced.
    fn next_sequence<T: SequenceTransaction>(
        &self,
        tx: &mut T,
        key: &CounterKey,
    ) -> Result<u64, T::Error>;

    /// Returns the sequence the next call to [`next_sequence`] would most
    /// likely produce, without locking or writing anything.
    ///
    /// [`next_sequence`]: SequenceSource::next_sequence
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the driver fails.
    fn peek_sequence<T: SequenceTransaction>(
        &self,
        tx: &mut T,
        key: &CounterKey,
    ) -> Result<u64, T::Error>;

    /// Whether every sequence handed out lies above the highest live code the
    /// transaction could see for the key's stem.
    ///
    /// When it does, a live code that already carries the allocated value
    /// must have been committed concurrently, and the allocator retries it
    /// like a unique violation. Otherwise the allocator treats it as a
    /// duplicate-policy violation.
    fn skips_live_codes(&self) -> bool {
        false
    }
}

impl<S: SequenceSource + ?Sized> SequenceSource for &S {
    fn next_sequence<T: SequenceTransaction>(
        &self,
        tx: &mut T,
        key: &CounterKey,
    ) -> Result<u64, T::Error> {
        (**self).next_sequence(tx, key)
    }

    fn peek_sequence<T: SequenceTransaction>(
        &self,
        tx: &mut T,
        key: &CounterKey,
    ) -> Result<u64, T::Error> {
        (**self).peek_sequence(tx, key)
    }

    fn skips_live_codes(&self) -> bool {
        (**self).skips_live_codes()
    }
}

/// The primary strategy: one persisted counter row per `(prefix, bucket)`,
/// read and bumped under a blocking row-level lock.
///
/// Rows are created lazily. The first allocation for a key seeds the row from
/// the largest suffix among live codes already stored for it, so switching an
/// existing dataset over to counters never reissues a code. Every later
/// allocation re-checks that maximum and takes whichever is larger, which
/// tolerates codes written behind the counter's back.
///
/// Same-key allocations serialize on the row lock; different keys never
/// contend.
///
/// # Example
/// ```
/// use reception_code::{
///     CounterKey, MemoryStore, SequenceCounterStore, SequenceSource, SequenceTransaction,
///     TransactionSource,
/// };
///
/// let store = MemoryStore::new();
/// let counters = SequenceCounterStore::default();
/// let key = CounterKey::new("BLOOD", "2512");
///
/// let mut tx = store.begin().unwrap();
/// assert_eq!(counters.next_sequence(&mut tx, &key).unwrap(), 1);
/// assert_eq!(counters.next_sequence(&mut tx, &key).unwrap(), 2);
/// tx.commit().unwrap();
/// ```
#[derive(Clone, Copy, Debug)]
pub struct SequenceCounterStore {
    max_insert_races: u32,
}

impl Default for SequenceCounterStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INSERT_RACES)
    }
}

impl SequenceCounterStore {
    /// Creates a counter strategy that gives up with
    /// [`Error::CounterUnavailable`] after `max_insert_races` lost
    /// insert-then-reread rounds. A value of zero is treated as one.
    pub const fn new(max_insert_races: u32) -> Self {
        Self {
            max_insert_races: if max_insert_races == 0 {
                1
            } else {
                max_insert_races
            },
        }
    }

    pub const fn max_insert_races(&self) -> u32 {
        self.max_insert_races
    }

    /// Locks the row for `key`, creating it if needed. Returns the stored
    /// `last_issued` and whether this transaction just created the row.
    fn lock_or_create<T: SequenceTransaction>(
        &self,
        tx: &mut T,
        key: &CounterKey,
    ) -> Result<(u64, bool), T::Error> {
        let mut races = 0;
        loop {
            if let Some(last_issued) = tx.lock_counter(key).map_err(Error::Store)? {
                return Ok((last_issued, false));
            }

            let seed = max_issued_suffix(tx, key)?;
            match tx.insert_counter(key, seed) {
                Ok(true) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(%key, seed, "created counter row");
                    return Ok((seed, true));
                }
                Ok(false) => {}
                Err(e) if e.is_unique_violation() => {}
                Err(e) => return Err(Error::Store(e)),
            }

            // Another transaction created the row first; lock it instead.
            races += 1;
            #[cfg(feature = "tracing")]
            tracing::debug!(%key, races, "lost counter insert race");
            if races >= self.max_insert_races {
                return Err(Error::CounterUnavailable { key: key.clone() });
            }
        }
    }
}

impl SequenceSource for SequenceCounterStore {
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "trace", skip(self, tx), fields(key = %key))
    )]
    fn next_sequence<T: SequenceTransaction>(
        &self,
        tx: &mut T,
        key: &CounterKey,
    ) -> Result<u64, T::Error> {
        let (last_issued, created) = self.lock_or_create(tx, key)?;

        // A freshly created row was seeded from this very scan.
        let effective = if created {
            last_issued
        } else {
            let seed = max_issued_suffix(tx, key)?;
            #[cfg(feature = "tracing")]
            if seed > last_issued {
                tracing::warn!(%key, last_issued, seed, "counter row behind stored codes");
            }
            last_issued.max(seed)
        };

        let next = effective
            .checked_add(1)
            .ok_or_else(|| Error::SequenceExhausted { key: key.clone() })?;
        tx.update_counter(key, next).map_err(Error::Store)?;
        Ok(next)
    }

    fn peek_sequence<T: SequenceTransaction>(
        &self,
        tx: &mut T,
        key: &CounterKey,
    ) -> Result<u64, T::Error> {
        let last_issued = tx.read_counter(key).map_err(Error::Store)?.unwrap_or(0);
        let seed = max_issued_suffix(tx, key)?;
        last_issued
            .max(seed)
            .checked_add(1)
            .ok_or_else(|| Error::SequenceExhausted { key: key.clone() })
    }

    fn skips_live_codes(&self) -> bool {
        true
    }
}

/// The largest sequence among live codes stored under `key`, or zero.
///
/// Suffixes are parsed with a minimum width of one so codes minted under an
/// older, narrower width still count. Codes that share the stem but do not
/// parse are skipped.
pub(crate) fn max_issued_suffix<T: SequenceTransaction>(
    tx: &mut T,
    key: &CounterKey,
) -> Result<u64, T::Error> {
    let formatter = CodeFormatter::default();
    let codes = tx
        .scan_codes(&code_stem(key.prefix(), key.bucket()))
        .map_err(Error::Store)?;

    Ok(codes
        .iter()
        .filter_map(
            |code| match formatter.parse_sequence(code, key.prefix(), key.bucket(), 1) {
                Ok(sequence) => Some(sequence),
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(code = %code, error = %_e, "skipping unparseable code");
                    None
                }
            },
        )
        .max()
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::{MemoryStore, MemoryStoreError, ReceptionRecord, TransactionSource};

    fn record(code: &str) -> ReceptionRecord {
        ReceptionRecord {
            code: code.to_owned(),
            sequence: 0,
            category: "T".to_owned(),
            received_at: NaiveDate::from_ymd_opt(2026, 1, 5)
                .unwrap()
                .and_hms_opt(9, 30, 0)
                .unwrap(),
        }
    }

    fn store_with(codes: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        for code in codes {
            tx.insert_reception(record(code)).unwrap();
        }
        tx.commit().unwrap();
        store
    }

    /// A transaction whose counter row is always created by "someone else"
    /// between the locked read and the insert.
    #[derive(Default)]
    struct LosingTx {
        locks: u32,
        inserts: u32,
        unique_errors: bool,
    }

    impl SequenceTransaction for LosingTx {
        type Error = MemoryStoreError;

        fn lock_counter(&mut self, _key: &CounterKey) -> core::result::Result<Option<u64>, Self::Error> {
            self.locks += 1;
            Ok(None)
        }

        fn read_counter(&mut self, _key: &CounterKey) -> core::result::Result<Option<u64>, Self::Error> {
            Ok(None)
        }

        fn insert_counter(
            &mut self,
            key: &CounterKey,
            _last_issued: u64,
        ) -> core::result::Result<bool, Self::Error> {
            self.inserts += 1;
            if self.unique_errors {
                Err(MemoryStoreError::UniqueViolation { code: key.to_string() })
            } else {
                Ok(false)
            }
        }

        fn update_counter(&mut self, _key: &CounterKey, _last_issued: u64) -> core::result::Result<(), Self::Error> {
            unreachable!("the row is never locked")
        }

        fn scan_codes(&mut self, _stem: &str) -> core::result::Result<Vec<String>, Self::Error> {
            Ok(Vec::new())
        }

        fn code_exists(&mut self, _code: &str) -> core::result::Result<bool, Self::Error> {
            Ok(false)
        }

        fn commit(self) -> core::result::Result<(), Self::Error> {
            Ok(())
        }

        fn rollback(self) -> core::result::Result<(), Self::Error> {
            Ok(())
        }
    }

    #[test]
    fn first_allocation_starts_at_one() {
        let store = MemoryStore::new();
        let key = CounterKey::new("BLOOD", "2512");
        let counters = SequenceCounterStore::default();

        let mut tx = store.begin().unwrap();
        assert_eq!(counters.next_sequence(&mut tx, &key).unwrap(), 1);
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        assert_eq!(counters.next_sequence(&mut tx, &key).unwrap(), 2);
        tx.commit().unwrap();

        assert_eq!(store.counter(&key), Some(2));
    }

    #[test]
    fn seeds_from_existing_codes() {
        let store = store_with(&["T2601.2338", "T2601.2340", "T2602.9000", "TX2601.5000"]);
        let key = CounterKey::new("T", "2601");

        let mut tx = store.begin().unwrap();
        assert_eq!(SequenceCounterStore::default().next_sequence(&mut tx, &key).unwrap(), 2341);
        tx.commit().unwrap();
        assert_eq!(store.counter(&key), Some(2341));
    }

    #[test]
    fn seed_skips_codes_that_do_not_parse() {
        let store = store_with(&["T2601.12", "T2601.12a", "T2601."]);
        let key = CounterKey::new("T", "2601");

        let mut tx = store.begin().unwrap();
        assert_eq!(SequenceCounterStore::default().next_sequence(&mut tx, &key).unwrap(), 13);
    }

    #[test]
    fn catches_up_with_codes_written_behind_the_counter() {
        let store = MemoryStore::new();
        let key = CounterKey::new("A", "25");
        let counters = SequenceCounterStore::default();

        let mut tx = store.begin().unwrap();
        assert_eq!(counters.next_sequence(&mut tx, &key).unwrap(), 1);
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        tx.insert_reception(record("A25.0009")).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        assert_eq!(counters.next_sequence(&mut tx, &key).unwrap(), 10);
        tx.commit().unwrap();
        assert_eq!(store.counter(&key), Some(10));
    }

    #[test]
    fn rollback_restores_the_counter() {
        let store = MemoryStore::new();
        let key = CounterKey::new("A", "25");
        let counters = SequenceCounterStore::default();

        let mut tx = store.begin().unwrap();
        counters.next_sequence(&mut tx, &key).unwrap();
        tx.rollback().unwrap();
        assert_eq!(store.counter(&key), None);

        let mut tx = store.begin().unwrap();
        assert_eq!(counters.next_sequence(&mut tx, &key).unwrap(), 1);
    }

    #[test]
    fn peek_does_not_reserve() {
        let store = store_with(&["T2601.0004"]);
        let key = CounterKey::new("T", "2601");
        let counters = SequenceCounterStore::default();

        let mut tx = store.begin().unwrap();
        assert_eq!(counters.peek_sequence(&mut tx, &key).unwrap(), 5);
        assert_eq!(counters.peek_sequence(&mut tx, &key).unwrap(), 5);
        assert_eq!(counters.next_sequence(&mut tx, &key).unwrap(), 5);
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        assert_eq!(counters.peek_sequence(&mut tx, &key).unwrap(), 6);
    }

    #[test]
    fn exhausted_counter_fails() {
        let store = MemoryStore::new();
        let key = CounterKey::new("A", "");
        store.set_counter(&key, u64::MAX);

        let mut tx = store.begin().unwrap();
        assert!(matches!(
            SequenceCounterStore::default().next_sequence(&mut tx, &key),
            Err(Error::SequenceExhausted { .. })
        ));
    }

    #[test]
    fn insert_races_are_bounded() {
        let key = CounterKey::new("A", "25");
        for unique_errors in [false, true] {
            let mut tx = LosingTx { unique_errors, ..Default::default() };
            let result = SequenceCounterStore::new(3).next_sequence(&mut tx, &key);
            assert!(matches!(result, Err(Error::CounterUnavailable { .. })));
            assert_eq!(tx.inserts, 3);
            assert_eq!(tx.locks, 3);
        }
    }

    #[test]
    fn zero_races_means_one_attempt() {
        assert_eq!(SequenceCounterStore::new(0).max_insert_races(), 1);
    }
}
