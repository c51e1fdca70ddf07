use ::rand::{Rng, rng};

/// A trait for random sources that return random integers.
///
/// The retry loop uses it to jitter backoff delays so contending callers
/// desynchronize. Tests plug in a fixed source to make delays deterministic.
///
/// # Example
/// ```
/// use reception_code::RandSource;
///
/// struct FixedRand;
/// impl RandSource<u64> for FixedRand {
///     fn rand(&self) -> u64 {
///         1234
///     }
/// }
///
/// assert_eq!(FixedRand.rand(), 1234);
/// ```
pub trait RandSource<T> {
    /// Returns a random integer.
    fn rand(&self) -> T;
}

impl<T, R: RandSource<T> + ?Sized> RandSource<T> for &R {
    fn rand(&self) -> T {
        (**self).rand()
    }
}

/// A `RandSource` backed by the thread-local RNG (`rand::rng()`).
///
/// This type stores no RNG state; it reaches for the calling thread's
/// generator on each call, so it is freely shareable across threads.
#[derive(Default, Clone, Copy, Debug)]
pub struct ThreadRandom;

impl RandSource<u64> for ThreadRandom {
    fn rand(&self) -> u64 {
        rng().random()
    }
}
