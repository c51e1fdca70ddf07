use crate::futures::SleepProvider;

/// An implementation of [`SleepProvider`] using Tokio's timer.
///
/// This is the provider to use in async applications built on Tokio.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleep;

impl SleepProvider for TokioSleep {
    type Sleep = ::tokio::time::Sleep;

    fn sleep_for(dur: core::time::Duration) -> Self::Sleep {
        ::tokio::time::sleep(dur)
    }
}
