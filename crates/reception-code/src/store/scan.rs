#[cfg(feature = "tracing")]
use tracing::instrument;

use super::{CounterKey, SequenceSource, SequenceTransaction, counter::max_issued_suffix};
use crate::{Error, Result};

/// The fallback strategy: `max(suffix) + 1` over live codes, with no counter
/// row and no lock.
///
/// Two concurrent callers can compute the same sequence. The loser's insert
/// then trips the unique index on the code column and the retry loop runs it
/// again in a fresh transaction. Useful while migrating a dataset that has no
/// counter table yet, and as a baseline for comparing contention.
#[derive(Clone, Copy, Debug, Default)]
pub struct MaxScanSequencer;

impl SequenceSource for MaxScanSequencer {
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "trace", skip(self, tx), fields(key = %key))
    )]
    fn next_sequence<T: SequenceTransaction>(
        &self,
        tx: &mut T,
        key: &CounterKey,
    ) -> Result<u64, T::Error> {
        self.peek_sequence(tx, key)
    }

    fn peek_sequence<T: SequenceTransaction>(
        &self,
        tx: &mut T,
        key: &CounterKey,
    ) -> Result<u64, T::Error> {
        max_issued_suffix(tx, key)?
            .checked_add(1)
            .ok_or_else(|| Error::SequenceExhausted { key: key.clone() })
    }

    fn skips_live_codes(&self) -> bool {
        true
    }
}
