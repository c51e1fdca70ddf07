use super::Backoff;
use crate::{CodeFormatter, OverflowPolicy};

/// Attempts the retry loop makes before failing with a conflict.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Delay before the first retry, in milliseconds.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 10;

/// Upper bound for a single backoff delay, in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 250;

/// Fraction of each delay that is randomized in either direction.
pub const DEFAULT_JITTER: f64 = 0.5;

/// Tuning for a [`ReceptionAllocator`].
///
/// [`ReceptionAllocator`]: crate::ReceptionAllocator
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct AllocatorConfig {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Clamped to `0.0..=1.0`.
    pub jitter: f64,
    pub overflow: OverflowPolicy,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            jitter: DEFAULT_JITTER,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl AllocatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, base_ms: u64, max_ms: u64, jitter: f64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_max_ms = max_ms;
        self.jitter = jitter;
        self
    }

    /// Retries immediately. Meant for tests.
    #[must_use]
    pub const fn without_backoff(self) -> Self {
        self.with_backoff(0, 0, 0.0)
    }

    #[must_use]
    pub const fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// `max_attempts`, never less than one.
    pub const fn attempts(&self) -> u32 {
        if self.max_attempts == 0 {
            1
        } else {
            self.max_attempts
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base_ms, self.backoff_max_ms, self.jitter)
    }

    pub const fn formatter(&self) -> CodeFormatter {
        CodeFormatter::new(self.overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AllocatorConfig::default();
        assert_eq!(config.attempts(), 5);
        assert_eq!(config.overflow, OverflowPolicy::Reject);
        assert_eq!(AllocatorConfig::new().with_max_attempts(0).attempts(), 1);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserializes_partial_config() {
        let config: AllocatorConfig =
            serde_json::from_str(r#"{"maxAttempts":3,"overflow":"widen"}"#).unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.overflow, OverflowPolicy::Widen);
        assert_eq!(config.backoff_base_ms, DEFAULT_BACKOFF_BASE_MS);
    }
}
