use core::time::Duration;

use crate::RandSource;

/// Jittered exponential backoff between allocation attempts.
///
/// The `n`th retry waits `base * 2^n`, capped at `max`, then shifted by up to
/// `jitter * delay` in either direction so callers that collided once do not
/// collide again on the same schedule.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    jitter: f64,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, jitter: f64) -> Self {
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            jitter: if jitter.is_nan() {
                0.0
            } else {
                jitter.clamp(0.0, 1.0)
            },
        }
    }

    pub const fn base_ms(&self) -> u64 {
        self.base_ms
    }

    pub const fn max_ms(&self) -> u64 {
        self.max_ms
    }

    pub const fn jitter(&self) -> f64 {
        self.jitter
    }

    /// The delay before retry number `retry` (zero-based).
    pub fn delay<R: RandSource<u64>>(&self, retry: u32, rand: &R) -> Duration {
        let delay = self
            .base_ms
            .saturating_mul(2_u64.saturating_pow(retry))
            .min(self.max_ms);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let spread = ((delay as f64 * self.jitter) as u64).min(delay);
        if spread == 0 {
            return Duration::from_millis(delay);
        }
        let offset = rand.rand() % spread.saturating_mul(2).saturating_add(1);
        Duration::from_millis((delay - spread).saturating_add(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRand(u64);

    impl RandSource<u64> for FixedRand {
        fn rand(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn doubles_and_caps() {
        let backoff = Backoff::new(100, 500, 0.0);
        let delays: Vec<_> = (0..5).map(|n| backoff.delay(n, &FixedRand(7))).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(500));
        assert_eq!(delays[4], Duration::from_millis(500));
        assert_eq!(backoff.delay(u32::MAX, &FixedRand(7)), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_spread() {
        let backoff = Backoff::new(100, 100, 0.5);
        assert_eq!(backoff.delay(0, &FixedRand(0)), Duration::from_millis(50));
        assert_eq!(backoff.delay(0, &FixedRand(100)), Duration::from_millis(150));
        assert_eq!(backoff.delay(0, &FixedRand(101)), Duration::from_millis(50));
        for n in [1, 17, 99, u64::MAX] {
            let delay = backoff.delay(0, &FixedRand(n));
            assert!((50..=150).contains(&delay.as_millis()));
        }
    }

    #[test]
    fn clamps_inputs() {
        let backoff = Backoff::new(20, 5, 3.0);
        assert_eq!(backoff.max_ms(), 20);
        assert_eq!(backoff.jitter(), 1.0);
        assert_eq!(Backoff::new(0, 0, f64::NAN).delay(3, &FixedRand(1)), Duration::ZERO);
    }
}
