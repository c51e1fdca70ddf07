use core::time::Duration;
use std::sync::Arc;

use chrono::NaiveDateTime;
#[cfg(feature = "tracing")]
use tracing::instrument;

use super::{AllocationStats, AllocatorConfig};
use crate::{
    Category, CategoryResolver, ClassifyStoreError, CounterKey, Error, LocalClock,
    RandSource, ReceptionRecord, Result, SequenceCounterStore, SequenceSource,
    SequenceTransaction, ThreadRandom, TimeSource, TransactionSource, TxError, format_bucket,
};

/// A reserved sequence and the code formatted from it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub key: CounterKey,
    pub sequence: u64,
    pub code: String,
}

impl Allocation {
    /// Builds the reception row that owns this code.
    pub fn to_record(&self, category: impl Into<String>, received_at: NaiveDateTime) -> ReceptionRecord {
        ReceptionRecord {
            code: self.code.clone(),
            sequence: self.sequence,
            category: category.into(),
            received_at,
        }
    }
}

/// Mints reception codes.
///
/// The allocator holds no locks and no mutable state of its own besides its
/// statistics; all coordination happens in the store's per-key row lock,
/// reached through the [`SequenceSource`] strategy `S`. Categories come from
/// `R`, the default timestamp from `C`, and backoff jitter from `N`.
///
/// Use [`allocate`] inside a transaction you manage yourself, or one of the
/// `*_with_retry` methods to let the allocator open, retry and commit
/// transactions for you.
///
/// # Example
/// ```
/// use chrono::NaiveDate;
/// use reception_code::{
///     Allocation, Category, CategoryRegistry, MemoryStore, MemoryTransaction, ReceptionAllocator,
/// };
///
/// let registry: CategoryRegistry =
///     [("BLOOD", Category::with_prefix("BLOOD").unwrap())].into_iter().collect();
/// let allocator = ReceptionAllocator::new(registry);
/// let store = MemoryStore::new();
/// let now = NaiveDate::from_ymd_opt(2025, 12, 11).unwrap().and_hms_opt(8, 0, 0).unwrap();
///
/// let insert = |tx: &mut MemoryTransaction, a: &Allocation| {
///     tx.insert_reception(a.to_record("BLOOD", now))
/// };
/// let (first, ()) = allocator.allocate_with_retry(&store, "BLOOD", Some(now), insert).unwrap();
/// let (second, ()) = allocator.allocate_with_retry(&store, "BLOOD", Some(now), insert).unwrap();
/// assert_eq!(first.code, "BLOOD2512.0001");
/// assert_eq!(second.code, "BLOOD2512.0002");
/// ```
///
/// [`allocate`]: ReceptionAllocator::allocate
#[derive(Debug)]
pub struct ReceptionAllocator<R, S = SequenceCounterStore, C = LocalClock, N = ThreadRandom> {
    categories: R,
    sequencer: S,
    clock: C,
    rand: N,
    config: AllocatorConfig,
    stats: Arc<AllocationStats>,
}

impl<R: CategoryResolver> ReceptionAllocator<R> {
    /// An allocator using the counter-table strategy, the local wall clock,
    /// and the default configuration.
    pub fn new(categories: R) -> Self {
        Self::from_parts(
            categories,
            SequenceCounterStore::default(),
            LocalClock,
            ThreadRandom,
            AllocatorConfig::default(),
        )
    }
}

impl<R, S, C, N> ReceptionAllocator<R, S, C, N>
where
    R: CategoryResolver,
    S: SequenceSource,
    C: TimeSource,
    N: RandSource<u64>,
{
    pub fn from_parts(categories: R, sequencer: S, clock: C, rand: N, config: AllocatorConfig) -> Self {
        Self {
            categories,
            sequencer,
            clock,
            rand,
            config,
            stats: Arc::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: AllocatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Reports into `stats` instead of a private set of counters.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<AllocationStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_sequencer<S2: SequenceSource>(self, sequencer: S2) -> ReceptionAllocator<R, S2, C, N> {
        ReceptionAllocator {
            categories: self.categories,
            sequencer,
            clock: self.clock,
            rand: self.rand,
            config: self.config,
            stats: self.stats,
        }
    }

    pub fn with_clock<C2: TimeSource>(self, clock: C2) -> ReceptionAllocator<R, S, C2, N> {
        ReceptionAllocator {
            categories: self.categories,
            sequencer: self.sequencer,
            clock,
            rand: self.rand,
            config: self.config,
            stats: self.stats,
        }
    }

    pub fn with_rand<N2: RandSource<u64>>(self, rand: N2) -> ReceptionAllocator<R, S, C, N2> {
        ReceptionAllocator {
            categories: self.categories,
            sequencer: self.sequencer,
            clock: self.clock,
            rand,
            config: self.config,
            stats: self.stats,
        }
    }

    pub fn categories(&self) -> &R {
        &self.categories
    }

    pub const fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<AllocationStats> {
        &self.stats
    }

    /// The current time according to the allocator's clock.
    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    /// Looks up the category registered under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CategoryNotFound`] if nothing is registered.
    pub fn resolve(&self, key: &str) -> Result<Category> {
        self.categories
            .resolve(key)
            .ok_or_else(|| Error::CategoryNotFound {
                category: key.to_owned(),
            })
    }

    /// Reserves the next sequence for `category` at `now` and formats its
    /// code, inside a transaction the caller owns.
    ///
    /// The caller inserts the owning record through the same `tx` and
    /// commits. Until then the counter row stays locked; rolling back releases
    /// it and un-reserves the sequence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Code`] with [`CodeError::Overflow`] if the sequence no
    /// longer fits the category's width under [`OverflowPolicy::Reject`], or
    /// whatever the sequence strategy reports.
    ///
    /// [`CodeError::Overflow`]: crate::CodeError::Overflow
    /// [`OverflowPolicy::Reject`]: crate::OverflowPolicy::Reject
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, tx, category), fields(prefix = category.prefix()))
    )]
    pub fn allocate<T: SequenceTransaction>(
        &self,
        tx: &mut T,
        category: &Category,
        now: NaiveDateTime,
    ) -> Result<Allocation, T::Error> {
        let key = counter_key(category, now);
        let sequence = self.sequencer.next_sequence(tx, &key)?;
        let code = self.format(category, &key, sequence)?;
        #[cfg(feature = "tracing")]
        tracing::debug!(%key, sequence, code = %code, "reserved sequence");
        Ok(Allocation {
            key,
            sequence,
            code,
        })
    }

    /// The code the next allocation for `category` at `now` would most
    /// likely receive. Nothing is locked or written, so a concurrent
    /// allocation may take it first.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate).
    pub fn preview<T: SequenceTransaction>(
        &self,
        tx: &mut T,
        category: &Category,
        now: NaiveDateTime,
    ) -> Result<Allocation, T::Error> {
        let key = counter_key(category, now);
        let sequence = self.sequencer.peek_sequence(tx, &key)?;
        let code = self.format(category, &key, sequence)?;
        Ok(Allocation {
            key,
            sequence,
            code,
        })
    }

    /// Allocates a code for the category registered under `category_key`
    /// and inserts its owning record through `insert`, retrying conflicts.
    ///
    /// The category is resolved once, before the first attempt. `now`
    /// defaults to the allocator's clock and is likewise fixed across
    /// attempts, so every attempt targets the same bucket.
    ///
    /// # Errors
    ///
    /// - [`Error::CategoryNotFound`] if `category_key` is not registered.
    /// - [`Error::DuplicateCodePolicyViolation`] if the category forbids
    ///   duplicates and the sequencer handed out a code a live record already
    ///   carries. With the built-in sequencers such a code can only come from
    ///   a concurrent commit, which is retried instead.
    /// - [`Error::AllocationConflict`] once every attempt failed with a
    ///   unique violation, concurrently taken code, serialization failure or
    ///   lock timeout.
    /// - Any other error from the store or `insert`, unretried.
    pub fn allocate_with_retry<Src, F, T>(
        &self,
        source: &Src,
        category_key: &str,
        now: Option<NaiveDateTime>,
        insert: F,
    ) -> Result<(Allocation, T), TxError<Src>>
    where
        Src: TransactionSource,
        F: FnMut(&mut Src::Tx, &Allocation) -> core::result::Result<T, TxError<Src>>,
    {
        let category = self.resolve(category_key).map_err(Error::widen)?;
        self.allocate_category_with_retry(source, &category, now, insert)
    }

    /// Like [`allocate_with_retry`](Self::allocate_with_retry) for an ad-hoc
    /// category built from `prefix` with [`Category::with_prefix`] defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCategory`] for an invalid prefix, otherwise as
    /// [`allocate_with_retry`](Self::allocate_with_retry).
    pub fn allocate_prefix_with_retry<Src, F, T>(
        &self,
        source: &Src,
        prefix: &str,
        now: Option<NaiveDateTime>,
        insert: F,
    ) -> Result<(Allocation, T), TxError<Src>>
    where
        Src: TransactionSource,
        F: FnMut(&mut Src::Tx, &Allocation) -> core::result::Result<T, TxError<Src>>,
    {
        let category = Category::with_prefix(prefix).map_err(Error::widen)?;
        self.allocate_category_with_retry(source, &category, now, insert)
    }

    /// The retry loop behind the other `*_with_retry` methods, for a
    /// category snapshot the caller already holds.
    ///
    /// # Errors
    ///
    /// As [`allocate_with_retry`](Self::allocate_with_retry), minus category
    /// resolution.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(prefix = category.prefix()))
    )]
    pub fn allocate_category_with_retry<Src, F, T>(
        &self,
        source: &Src,
        category: &Category,
        now: Option<NaiveDateTime>,
        mut insert: F,
    ) -> Result<(Allocation, T), TxError<Src>>
    where
        Src: TransactionSource,
        F: FnMut(&mut Src::Tx, &Allocation) -> core::result::Result<T, TxError<Src>>,
    {
        let now = now.unwrap_or_else(|| self.clock.now());
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(source, category, now, &mut insert) {
                Ok(done) => return Ok(done),
                Err(e) => {
                    let delay = self.after_failure(category, attempt, e)?;
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
            }
        }
    }

    /// One transaction: allocate, check the duplicate policy, insert, commit.
    /// Anything that fails rolls the transaction back.
    pub(crate) fn attempt<Src, F, T>(
        &self,
        source: &Src,
        category: &Category,
        now: NaiveDateTime,
        insert: &mut F,
    ) -> Result<(Allocation, T), TxError<Src>>
    where
        Src: TransactionSource,
        F: FnMut(&mut Src::Tx, &Allocation) -> core::result::Result<T, TxError<Src>>,
    {
        self.stats.record_attempt();
        let mut tx = source.begin().map_err(Error::Store)?;

        let result = self.allocate(&mut tx, category, now).and_then(|allocation| {
            if !category.allow_duplicate_code()
                && tx.code_exists(&allocation.code).map_err(Error::Store)?
            {
                let code = allocation.code;
                return Err(if self.sequencer.skips_live_codes() {
                    Error::CodeTaken { code }
                } else {
                    Error::DuplicateCodePolicyViolation { code }
                });
            }
            let inserted = insert(&mut tx, &allocation).map_err(Error::Store)?;
            Ok((allocation, inserted))
        });

        match result {
            Ok(done) => {
                tx.commit().map_err(Error::Store)?;
                self.stats.record_allocation();
                Ok(done)
            }
            Err(e) => {
                if let Err(_rollback) = tx.rollback() {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Decides what follows a failed attempt: the delay before the next one,
    /// or the error to surface.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub(crate) fn after_failure<E: ClassifyStoreError + core::fmt::Display>(
        &self,
        category: &Category,
        attempt: u32,
        error: Error<E>,
    ) -> Result<Duration, E> {
        if !error.is_retryable() {
            #[cfg(feature = "tracing")]
            tracing::debug!(prefix = category.prefix(), attempt, %error, "allocation failed");
            return Err(error);
        }

        let max_attempts = self.config.attempts();
        if attempt >= max_attempts {
            self.stats.record_conflict();
            #[cfg(feature = "tracing")]
            tracing::error!(
                prefix = category.prefix(),
                attempts = attempt,
                last_error = %error,
                "allocation retries exhausted"
            );
            return Err(Error::AllocationConflict { attempts: attempt });
        }

        self.stats.record_retry();
        let delay = self.config.backoff().delay(attempt - 1, &self.rand);
        #[cfg(feature = "tracing")]
        tracing::warn!(
            prefix = category.prefix(),
            attempt,
            max_attempts,
            ?delay,
            %error,
            "retrying allocation"
        );
        Ok(delay)
    }

    fn format<E>(&self, category: &Category, key: &CounterKey, sequence: u64) -> Result<String, E> {
        self.config
            .formatter()
            .format_code(key.prefix(), key.bucket(), category.numeric_width(), sequence)
            .map_err(|e| {
                #[cfg(feature = "tracing")]
                if matches!(e, crate::CodeError::Overflow { .. }) {
                    tracing::error!(
                        %key,
                        sequence,
                        width = category.numeric_width(),
                        "sequence overflows the code width"
                    );
                }
                Error::Code(e)
            })
    }
}

fn counter_key(category: &Category, now: NaiveDateTime) -> CounterKey {
    CounterKey::new(category.prefix(), format_bucket(&now, category.reset_period()))
}
