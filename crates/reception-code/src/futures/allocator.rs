use core::future::Future;

use chrono::NaiveDateTime;

use super::SleepProvider;
use crate::{
    Allocation, Category, CategoryResolver, Error, RandSource, ReceptionAllocator, Result,
    SequenceSource, TimeSource, TransactionSource, TxError,
};

/// Extension trait for running the allocation retry loop in async code.
///
/// Each attempt still talks to the store synchronously; only the backoff
/// between attempts is awaited through the [`SleepProvider`] `SP`, so a
/// waiting allocation never parks a runtime worker on `thread::sleep`.
pub trait ReceptionAllocatorAsyncExt {
    /// Async counterpart of [`ReceptionAllocator::allocate_with_retry`].
    ///
    /// # Errors
    ///
    /// As [`ReceptionAllocator::allocate_with_retry`].
    fn allocate_with_retry_async<SP, Src, F, T>(
        &self,
        source: &Src,
        category_key: &str,
        now: Option<NaiveDateTime>,
        insert: F,
    ) -> impl Future<Output = Result<(Allocation, T), TxError<Src>>>
    where
        SP: SleepProvider,
        Src: TransactionSource,
        F: FnMut(&mut Src::Tx, &Allocation) -> core::result::Result<T, TxError<Src>>;

    /// Async counterpart of
    /// [`ReceptionAllocator::allocate_category_with_retry`].
    ///
    /// # Errors
    ///
    /// As [`ReceptionAllocator::allocate_category_with_retry`].
    fn allocate_category_with_retry_async<SP, Src, F, T>(
        &self,
        source: &Src,
        category: &Category,
        now: Option<NaiveDateTime>,
        insert: F,
    ) -> impl Future<Output = Result<(Allocation, T), TxError<Src>>>
    where
        SP: SleepProvider,
        Src: TransactionSource,
        F: FnMut(&mut Src::Tx, &Allocation) -> core::result::Result<T, TxError<Src>>;
}

impl<R, S, C, N> ReceptionAllocatorAsyncExt for ReceptionAllocator<R, S, C, N>
where
    R: CategoryResolver,
    S: SequenceSource,
    C: TimeSource,
    N: RandSource<u64>,
{
    fn allocate_with_retry_async<SP, Src, F, T>(
        &self,
        source: &Src,
        category_key: &str,
        now: Option<NaiveDateTime>,
        insert: F,
    ) -> impl Future<Output = Result<(Allocation, T), TxError<Src>>>
    where
        SP: SleepProvider,
        Src: TransactionSource,
        F: FnMut(&mut Src::Tx, &Allocation) -> core::result::Result<T, TxError<Src>>,
    {
        async move {
            let category = self.resolve(category_key).map_err(Error::widen)?;
            self.allocate_category_with_retry_async::<SP, _, _, _>(source, &category, now, insert)
                .await
        }
    }

    fn allocate_category_with_retry_async<SP, Src, F, T>(
        &self,
        source: &Src,
        category: &Category,
        now: Option<NaiveDateTime>,
        mut insert: F,
    ) -> impl Future<Output = Result<(Allocation, T), TxError<Src>>>
    where
        SP: SleepProvider,
        Src: TransactionSource,
        F: FnMut(&mut Src::Tx, &Allocation) -> core::result::Result<T, TxError<Src>>,
    {
        async move {
            let now = now.unwrap_or_else(|| self.now());
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.attempt(source, category, now, &mut insert) {
                    Ok(done) => return Ok(done),
                    Err(e) => {
                        let delay = self.after_failure(category, attempt, e)?;
                        if !delay.is_zero() {
                            SP::sleep_for(delay).await;
                        }
                    }
                }
            }
        }
    }
}
