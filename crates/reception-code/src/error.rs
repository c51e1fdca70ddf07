use core::convert::Infallible;

use crate::{
    format::CodeError,
    store::{ClassifyStoreError, CounterKey, StoreErrorKind},
};

/// A result type whose error is generic over the store driver's error.
///
/// Pure operations (formatting, category validation) never touch a store and
/// use the default `Infallible` driver error.
pub type Result<T, E = Infallible> = core::result::Result<T, Error<E>>;

/// All errors the allocator can surface.
///
/// `E` is the error type of the transaction driver in use (see
/// [`SequenceTransaction`]). Driver errors are never inspected by message;
/// they are classified through [`ClassifyStoreError`].
///
/// [`SequenceTransaction`]: crate::SequenceTransaction
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error<E = Infallible> {
    /// No category is registered under the requested key.
    #[error("category not found: {category}")]
    CategoryNotFound { category: String },

    /// A category configuration failed validation.
    #[error("invalid category: {reason}")]
    InvalidCategory { reason: String },

    /// Every attempt of the retry loop hit a retryable conflict.
    ///
    /// Callers should surface this as a retryable client error (HTTP 409),
    /// never as a server error.
    #[error("failed to allocate a unique reception code after {attempts} attempts")]
    AllocationConflict { attempts: u32 },

    /// The category forbids duplicate codes and a live record already carries
    /// this code. Re-allocating will not change a configuration decision, so
    /// this is never retried.
    #[error("reception code already exists: {code}")]
    DuplicateCodePolicyViolation { code: String },

    /// Another writer committed the code between sequencing and the
    /// duplicate check. A fresh attempt sees that code and moves past it.
    #[error("reception code taken by a concurrent writer: {code}")]
    CodeTaken { code: String },

    /// The counter row kept appearing and disappearing under concurrent
    /// inserts and rollbacks.
    #[error("counter row for {key} could not be created or locked")]
    CounterUnavailable { key: CounterKey },

    /// The counter for this key reached `u64::MAX`.
    #[error("sequence space exhausted for {key}")]
    SequenceExhausted { key: CounterKey },

    /// Formatting or parsing a reception code failed.
    #[error(transparent)]
    Code(#[from] CodeError),

    /// The underlying store failed.
    #[error("store error: {0}")]
    Store(#[source] E),
}

/// Coarse, transport-agnostic classification of an [`Error`].
///
/// Maps one-to-one onto the HTTP status a front end should return.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorStatus {
    /// The referenced category does not exist.
    NotFound,
    /// A uniqueness conflict; retryable unless it stems from policy.
    Conflict,
    /// The request or configuration is invalid.
    InvalidArgument,
    /// The store or the persisted data is in a bad state.
    Internal,
}

impl ErrorStatus {
    /// The HTTP status code equivalent.
    pub const fn http_code(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::InvalidArgument => 422,
            Self::Internal => 500,
        }
    }
}

impl<E: ClassifyStoreError> Error<E> {
    /// Returns `true` if resubmitting the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AllocationConflict { .. }
            | Self::CodeTaken { .. }
            | Self::CounterUnavailable { .. } => true,
            Self::Store(e) => e.kind().is_retryable(),
            _ => false,
        }
    }

    /// Classifies the error for a transport layer.
    pub fn status(&self) -> ErrorStatus {
        match self {
            Self::CategoryNotFound { .. } => ErrorStatus::NotFound,
            Self::InvalidCategory { .. } => ErrorStatus::InvalidArgument,
            Self::AllocationConflict { .. }
            | Self::DuplicateCodePolicyViolation { .. }
            | Self::CodeTaken { .. }
            | Self::CounterUnavailable { .. } => ErrorStatus::Conflict,
            Self::SequenceExhausted { .. } => ErrorStatus::Internal,
            Self::Code(CodeError::Overflow { .. }) => ErrorStatus::Internal,
            Self::Code(_) => ErrorStatus::InvalidArgument,
            Self::Store(e) => match e.kind() {
                StoreErrorKind::Other => ErrorStatus::Internal,
                _ => ErrorStatus::Conflict,
            },
        }
    }
}

impl Error<Infallible> {
    /// Widens a store-free error into one carrying driver error `E`.
    pub fn widen<E>(self) -> Error<E> {
        match self {
            Self::CategoryNotFound { category } => Error::CategoryNotFound { category },
            Self::InvalidCategory { reason } => Error::InvalidCategory { reason },
            Self::AllocationConflict { attempts } => Error::AllocationConflict { attempts },
            Self::DuplicateCodePolicyViolation { code } => {
                Error::DuplicateCodePolicyViolation { code }
            }
            Self::CodeTaken { code } => Error::CodeTaken { code },
            Self::CounterUnavailable { key } => Error::CounterUnavailable { key },
            Self::SequenceExhausted { key } => Error::SequenceExhausted { key },
            Self::Code(e) => Error::Code(e),
            Self::Store(e) => match e {},
        }
    }
}
