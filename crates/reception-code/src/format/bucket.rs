use core::{fmt, str::FromStr};

use chrono::Datelike;

/// How often a category's sequence restarts.
///
/// The reset period decides the date bucket embedded in every code, and
/// therefore which counter row an allocation touches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ResetPeriod {
    /// `YYMMDD`
    Daily,
    /// `YYMM`
    #[default]
    Monthly,
    /// `YY`
    Yearly,
    /// No date component; one sequence for the lifetime of the prefix.
    Never,
}

impl ResetPeriod {
    /// Every reset period, shortest bucket last.
    pub const ALL: [Self; 4] = [Self::Daily, Self::Monthly, Self::Yearly, Self::Never];

    /// Number of characters the bucket contributes to a code.
    pub const fn bucket_len(self) -> usize {
        match self {
            Self::Daily => 6,
            Self::Monthly => 4,
            Self::Yearly => 2,
            Self::Never => 0,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "DAILY",
            Self::Monthly => "MONTHLY",
            Self::Yearly => "YEARLY",
            Self::Never => "NEVER",
        }
    }
}

impl fmt::Display for ResetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known [`ResetPeriod`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown reset period {0:?}; expected DAILY, MONTHLY, YEARLY or NEVER")]
pub struct ParseResetPeriodError(pub String);

impl FromStr for ResetPeriod {
    type Err = ParseResetPeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|period| period.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseResetPeriodError(s.to_owned()))
    }
}

/// Renders the date bucket for `now` under `period`.
///
/// - `Daily` → `YYMMDD`
/// - `Monthly` → `YYMM`
/// - `Yearly` → `YY`
/// - `Never` → `""`
///
/// The year is truncated to two digits to stay compatible with codes already
/// printed on sample labels. Buckets therefore repeat every century; this is
/// a known limitation, not an oversight.
///
/// # Example
/// ```
/// use chrono::NaiveDate;
/// use reception_code::{ResetPeriod, format_bucket};
///
/// let date = NaiveDate::from_ymd_opt(2025, 12, 11).unwrap();
/// assert_eq!(format_bucket(&date, ResetPeriod::Daily), "251211");
/// assert_eq!(format_bucket(&date, ResetPeriod::Monthly), "2512");
/// assert_eq!(format_bucket(&date, ResetPeriod::Yearly), "25");
/// assert_eq!(format_bucket(&date, ResetPeriod::Never), "");
/// ```
pub fn format_bucket<D: Datelike>(now: &D, period: ResetPeriod) -> String {
    let yy = now.year().rem_euclid(100);
    match period {
        ResetPeriod::Daily => format!("{yy:02}{:02}{:02}", now.month(), now.day()),
        ResetPeriod::Monthly => format!("{yy:02}{:02}", now.month()),
        ResetPeriod::Yearly => format!("{yy:02}"),
        ResetPeriod::Never => String::new(),
    }
}

/// The bucket every reset period would produce for `now`.
pub fn bucket_examples<D: Datelike>(now: &D) -> [(ResetPeriod, String); 4] {
    ResetPeriod::ALL.map(|period| (period, format_bucket(now, period)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn buckets_have_fixed_width() {
        let d = date(2026, 1, 5);
        for period in ResetPeriod::ALL {
            assert_eq!(format_bucket(&d, period).len(), period.bucket_len());
        }
        assert_eq!(format_bucket(&d, ResetPeriod::Daily), "260105");
        assert_eq!(format_bucket(&d, ResetPeriod::Monthly), "2601");
    }

    #[test]
    fn year_is_truncated_to_two_digits() {
        assert_eq!(format_bucket(&date(2100, 3, 1), ResetPeriod::Yearly), "00");
        assert_eq!(format_bucket(&date(2009, 3, 1), ResetPeriod::Monthly), "0903");
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("daily".parse::<ResetPeriod>(), Ok(ResetPeriod::Daily));
        assert_eq!(" NEVER ".parse::<ResetPeriod>(), Ok(ResetPeriod::Never));
        assert!("WEEKLY".parse::<ResetPeriod>().is_err());
    }

    #[test]
    fn examples_cover_every_period() {
        let examples = bucket_examples(&date(2025, 12, 11));
        assert_eq!(
            examples.map(|(_, bucket)| bucket),
            ["251211".to_owned(), "2512".into(), "25".into(), String::new()]
        );
    }
}
