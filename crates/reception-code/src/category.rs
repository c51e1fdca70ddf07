use std::collections::HashMap;

use parking_lot::RwLock;

use crate::{Error, ResetPeriod, Result};

/// Longest prefix a category may use.
pub const MAX_PREFIX_LEN: usize = 10;

/// Widest zero-padded sequence a category may use.
pub const MAX_NUMERIC_WIDTH: u8 = 6;

/// Sequence width used when a category does not specify one.
pub const DEFAULT_NUMERIC_WIDTH: u8 = 4;

/// Code generation settings for one sample type.
///
/// A `Category` is validated on construction and immutable afterwards; to
/// change a category, build a new one and replace it in the
/// [`CategoryRegistry`]. An allocation always works against the snapshot it
/// resolved at its start.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(try_from = "CategorySpec", into = "CategorySpec")
)]
pub struct Category {
    prefix: String,
    numeric_width: u8,
    reset_period: ResetPeriod,
    allow_duplicate_code: bool,
}

impl Category {
    /// Creates a validated category.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCategory`] if the prefix is empty, longer than
    /// [`MAX_PREFIX_LEN`], or contains anything other than ASCII letters,
    /// digits, `-` or `_`; or if `numeric_width` is outside
    /// `1..=MAX_NUMERIC_WIDTH`.
    pub fn new(
        prefix: impl Into<String>,
        numeric_width: u8,
        reset_period: ResetPeriod,
        allow_duplicate_code: bool,
    ) -> Result<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        if !(1..=MAX_NUMERIC_WIDTH).contains(&numeric_width) {
            return Err(Error::InvalidCategory {
                reason: format!(
                    "numeric width {numeric_width} is outside 1..={MAX_NUMERIC_WIDTH}"
                ),
            });
        }
        Ok(Self {
            prefix,
            numeric_width,
            reset_period,
            allow_duplicate_code,
        })
    }

    /// An ad-hoc category for allocating directly against a prefix: width
    /// [`DEFAULT_NUMERIC_WIDTH`], monthly reset, duplicates disallowed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCategory`] if the prefix is invalid.
    pub fn with_prefix(prefix: impl Into<String>) -> Result<Self> {
        Self::new(prefix, DEFAULT_NUMERIC_WIDTH, ResetPeriod::Monthly, false)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub const fn numeric_width(&self) -> u8 {
        self.numeric_width
    }

    pub const fn reset_period(&self) -> ResetPeriod {
        self.reset_period
    }

    pub const fn allow_duplicate_code(&self) -> bool {
        self.allow_duplicate_code
    }

    /// Largest sequence that fits the configured width without widening.
    pub const fn max_sequence(&self) -> u64 {
        10_u64.pow(self.numeric_width as u32) - 1
    }
}

fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
        return Err(Error::InvalidCategory {
            reason: format!(
                "prefix {prefix:?} must be between 1 and {MAX_PREFIX_LEN} characters"
            ),
        });
    }
    if let Some(c) = prefix
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(Error::InvalidCategory {
            reason: format!("prefix {prefix:?} contains unsupported character {c:?}"),
        });
    }
    Ok(())
}

/// Wire form of a [`Category`], validated through `TryFrom`.
#[cfg(feature = "serde")]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CategorySpec {
    prefix: String,
    #[serde(default = "default_width")]
    numeric_width: u8,
    #[serde(default)]
    reset_period: ResetPeriod,
    #[serde(default)]
    allow_duplicate_code: bool,
}

#[cfg(feature = "serde")]
const fn default_width() -> u8 {
    DEFAULT_NUMERIC_WIDTH
}

#[cfg(feature = "serde")]
impl TryFrom<CategorySpec> for Category {
    type Error = Error;

    fn try_from(spec: CategorySpec) -> Result<Self> {
        Self::new(
            spec.prefix,
            spec.numeric_width,
            spec.reset_period,
            spec.allow_duplicate_code,
        )
    }
}

#[cfg(feature = "serde")]
impl From<Category> for CategorySpec {
    fn from(category: Category) -> Self {
        Self {
            prefix: category.prefix,
            numeric_width: category.numeric_width,
            reset_period: category.reset_period,
            allow_duplicate_code: category.allow_duplicate_code,
        }
    }
}

/// Looks up category configuration by key (typically the sample type code).
pub trait CategoryResolver {
    /// Returns a snapshot of the category registered under `key`.
    fn resolve(&self, key: &str) -> Option<Category>;
}

impl<R: CategoryResolver + ?Sized> CategoryResolver for &R {
    fn resolve(&self, key: &str) -> Option<Category> {
        (**self).resolve(key)
    }
}

impl CategoryResolver for HashMap<String, Category> {
    fn resolve(&self, key: &str) -> Option<Category> {
        self.get(key).cloned()
    }
}

/// A thread-safe, updatable set of categories.
///
/// Updates take effect for allocations that resolve after the update; an
/// allocation already in flight keeps the snapshot it resolved.
#[derive(Debug, Default)]
pub struct CategoryRegistry {
    categories: RwLock<HashMap<String, Category>>,
}

impl CategoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a category, returning the previous one.
    pub fn insert(&self, key: impl Into<String>, category: Category) -> Option<Category> {
        self.categories.write().insert(key.into(), category)
    }

    pub fn remove(&self, key: &str) -> Option<Category> {
        self.categories.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.categories.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.read().is_empty()
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.categories.read().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }
}

impl CategoryResolver for CategoryRegistry {
    fn resolve(&self, key: &str) -> Option<Category> {
        self.categories.read().get(key).cloned()
    }
}

impl<K: Into<String>> FromIterator<(K, Category)> for CategoryRegistry {
    fn from_iter<I: IntoIterator<Item = (K, Category)>>(iter: I) -> Self {
        Self {
            categories: RwLock::new(iter.into_iter().map(|(k, c)| (k.into(), c)).collect()),
        }
    }
}
