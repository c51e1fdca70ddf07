use core::{future::Future, time::Duration};

/// Abstracts over how to sleep for a [`Duration`] in async contexts.
///
/// The async retry loop waits out its backoff through this trait, so it is
/// not tied to one runtime.
pub trait SleepProvider {
    /// `Send` so the future can move across worker threads.
    type Sleep: Future<Output = ()> + Send;

    fn sleep_for(dur: Duration) -> Self::Sleep;
}
