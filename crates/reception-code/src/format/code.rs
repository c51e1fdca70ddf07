use super::CodeError;

/// Separator between the date bucket and the padded sequence.
pub const SEPARATOR: char = '.';

/// What to do when a sequence needs more digits than the category's width.
///
/// Codes are never truncated. `Reject` treats the overflow as a data error
/// and fails the allocation; `Widen` prints the full number, producing a code
/// longer than its siblings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum OverflowPolicy {
    #[default]
    Reject,
    Widen,
}

/// Formats and parses `PREFIX + BUCKET + "." + PADDED_SEQUENCE` codes.
///
/// # Example
/// ```
/// use reception_code::{CodeFormatter, OverflowPolicy};
///
/// let formatter = CodeFormatter::default();
/// assert_eq!(formatter.format_code("BLOOD", "2512", 4, 7).unwrap(), "BLOOD2512.0007");
/// assert!(formatter.format_code("BLOOD", "2512", 4, 10_000).is_err());
///
/// let widening = CodeFormatter::new(OverflowPolicy::Widen);
/// assert_eq!(widening.format_code("BLOOD", "2512", 4, 10_000).unwrap(), "BLOOD2512.10000");
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CodeFormatter {
    overflow: OverflowPolicy,
}

impl CodeFormatter {
    pub const fn new(overflow: OverflowPolicy) -> Self {
        Self { overflow }
    }

    pub const fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Zero-pads `sequence` to `width` digits and joins it with `prefix` and
    /// `bucket`.
    ///
    /// # Errors
    ///
    /// Returns [`CodeError::Overflow`] if the sequence does not fit in
    /// `width` digits and the policy is [`OverflowPolicy::Reject`].
    pub fn format_code(
        &self,
        prefix: &str,
        bucket: &str,
        width: u8,
        sequence: u64,
    ) -> Result<String, CodeError> {
        if digit_count(sequence) > u32::from(width) && self.overflow == OverflowPolicy::Reject {
            return Err(CodeError::Overflow { sequence, width });
        }
        let width = usize::from(width);
        Ok(format!("{prefix}{bucket}{SEPARATOR}{sequence:0width$}"))
    }

    /// Extracts the sequence from a code laid out as `prefix + bucket + "." +
    /// digits`.
    ///
    /// At least `width` digits are required. Longer suffixes are accepted so
    /// widened codes and codes minted under a narrower historical width still
    /// parse.
    ///
    /// # Errors
    ///
    /// Returns a [`CodeError`] naming the first part of the layout that does
    /// not match.
    pub fn parse_sequence(
        &self,
        code: &str,
        prefix: &str,
        bucket: &str,
        width: u8,
    ) -> Result<u64, CodeError> {
        let rest = code
            .strip_prefix(prefix)
            .ok_or_else(|| CodeError::PrefixMismatch {
                code: code.to_owned(),
                prefix: prefix.to_owned(),
            })?;
        let rest = rest
            .strip_prefix(bucket)
            .ok_or_else(|| CodeError::BucketMismatch {
                code: code.to_owned(),
                bucket: bucket.to_owned(),
            })?;
        let digits = rest
            .strip_prefix(SEPARATOR)
            .ok_or_else(|| CodeError::MissingSeparator { code: code.to_owned() })?;

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CodeError::InvalidDigits { code: code.to_owned() });
        }
        if digits.len() < usize::from(width) {
            return Err(CodeError::TooShort { code: code.to_owned(), width });
        }
        digits
            .parse()
            .map_err(|_| CodeError::SequenceTooLarge { code: code.to_owned() })
    }
}

/// The leading part shared by every code of a `(prefix, bucket)` key,
/// separator included.
pub fn code_stem(prefix: &str, bucket: &str) -> String {
    format!("{prefix}{bucket}{SEPARATOR}")
}

fn digit_count(n: u64) -> u32 {
    n.checked_ilog10().map_or(1, |d| d + 1)
}
