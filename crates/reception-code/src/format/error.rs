/// Errors produced while formatting or parsing a reception code.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodeError {
    /// The sequence needs more digits than the configured width and the
    /// overflow policy forbids widening.
    #[error("sequence {sequence} does not fit in {width} digits")]
    Overflow { sequence: u64, width: u8 },

    #[error("code {code:?} does not start with prefix {prefix:?}")]
    PrefixMismatch { code: String, prefix: String },

    #[error("code {code:?} does not carry date bucket {bucket:?}")]
    BucketMismatch { code: String, bucket: String },

    #[error("code {code:?} is missing the sequence separator")]
    MissingSeparator { code: String },

    #[error("code {code:?} has a non-numeric sequence")]
    InvalidDigits { code: String },

    #[error("code {code:?} has fewer than {width} sequence digits")]
    TooShort { code: String, width: u8 },

    #[error("code {code:?} has a sequence that does not fit in 64 bits")]
    SequenceTooLarge { code: String },
}
