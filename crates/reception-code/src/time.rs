use chrono::{Local, NaiveDateTime, Utc};

/// A source of "now" for allocations that do not pass an explicit timestamp.
///
/// This abstraction lets the allocator run against the wall clock in
/// production and a pinned instant in tests.
///
/// # Example
///
/// ```
/// use chrono::NaiveDate;
/// use reception_code::TimeSource;
///
/// struct Pinned;
/// impl TimeSource for Pinned {
///     fn now(&self) -> chrono::NaiveDateTime {
///         NaiveDate::from_ymd_opt(2025, 12, 11).unwrap().and_hms_opt(8, 0, 0).unwrap()
///     }
/// }
///
/// assert_eq!(Pinned.now().to_string(), "2025-12-11 08:00:00");
/// ```
pub trait TimeSource {
    /// The current local calendar time.
    fn now(&self) -> NaiveDateTime;
}

impl<T: TimeSource + ?Sized> TimeSource for &T {
    fn now(&self) -> NaiveDateTime {
        (**self).now()
    }
}

/// Wall clock in the host's local time zone.
///
/// Buckets roll over at local midnight, matching what staff see on the
/// reception desk.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalClock;

impl TimeSource for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Wall clock in UTC.
#[derive(Clone, Copy, Debug, Default)]
pub struct UtcClock;

impl TimeSource for UtcClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

/// A clock pinned to one instant.
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub NaiveDateTime);

impl TimeSource for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}
