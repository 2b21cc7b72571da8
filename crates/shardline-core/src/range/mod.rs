//! Module: range
//! Responsibility: the effective-partition-key space and slices of it.
//! Does not own: which partitions currently serve a slice (see `routing`).


use crate::routing::{PartitionId, RoutingError, RoutingResolver};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{borrow::Cow, cmp::Ordering, fmt};
use thiserror::Error as ThisError;

// Hashed keys keep this many digest bytes.
const HASHED_KEY_BYTES: usize = 16;

///
/// EffectiveKey
///
/// Position in the effective-partition-key space: an upper-case hex string
/// compared lexicographically. `MIN` is the empty string and `MAX` is `"FF"`;
/// hashed logical keys always sort strictly below `MAX`.
///

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(from = "String")]
pub struct EffectiveKey(Cow<'static, str>);

impl EffectiveKey {
    pub const MIN: Self = Self(Cow::Borrowed(""));
    pub const MAX: Self = Self(Cow::Borrowed("FF"));

    #[must_use]
    pub fn new(hex: impl Into<String>) -> Self {
        Self(Cow::Owned(hex.into().to_ascii_uppercase()))
    }

    /// Hash one logical partition-key value into the effective space.
    #[must_use]
    pub fn hash_of(partition_key: &str) -> Self {
        let digest = Sha256::digest(partition_key.as_bytes());
        let mut bytes = [0u8; HASHED_KEY_BYTES];
        bytes.copy_from_slice(&digest[..HASHED_KEY_BYTES]);
        // Top two bits cleared keeps every hashed key below `MAX`.
        bytes[0] &= 0x3f;

        let mut out = String::with_capacity(HASHED_KEY_BYTES * 2);
        for byte in bytes {
            use std::fmt::Write as _;
            let _ = write!(out, "{byte:02X}");
        }

        Self(Cow::Owned(out))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for EffectiveKey {
    fn from(hex: String) -> Self {
        Self::new(hex)
    }
}

impl fmt::Display for EffectiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

///
/// RangeError
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum RangeError {
    #[error("partition range lower bound {lower} is above upper bound {upper}")]
    Inverted {
        lower: EffectiveKey,
        upper: EffectiveKey,
    },

    #[error("partition range [{key}] is empty: equal bounds must both be inclusive")]
    EmptyPoint { key: EffectiveKey },
}

///
/// PartitionRange
///
/// Immutable contiguous slice of the effective key space. Invariant:
/// `lower <= upper`, and equal bounds describe a single inclusive point.
///

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(try_from = "RawPartitionRange")]
pub struct PartitionRange {
    lower: EffectiveKey,
    upper: EffectiveKey,
    lower_inclusive: bool,
    upper_inclusive: bool,
}

// Decoded form of a range, checked by `try_new` before it is trusted.
#[derive(Deserialize)]
struct RawPartitionRange {
    lower: EffectiveKey,
    upper: EffectiveKey,
    lower_inclusive: bool,
    upper_inclusive: bool,
}

impl TryFrom<RawPartitionRange> for PartitionRange {
    type Error = RangeError;

    fn try_from(raw: RawPartitionRange) -> Result<Self, Self::Error> {
        Self::try_new(raw.lower, raw.upper, raw.lower_inclusive, raw.upper_inclusive)
    }
}

impl PartitionRange {
    /// The entire key space, `["", "FF")`.
    pub const FULL: Self = Self {
        lower: EffectiveKey::MIN,
        upper: EffectiveKey::MAX,
        lower_inclusive: true,
        upper_inclusive: false,
    };

    pub fn try_new(
        lower: EffectiveKey,
        upper: EffectiveKey,
        lower_inclusive: bool,
        upper_inclusive: bool,
    ) -> Result<Self, RangeError> {
        match lower.cmp(&upper) {
            Ordering::Greater => Err(RangeError::Inverted { lower, upper }),
            Ordering::Equal if !(lower_inclusive && upper_inclusive) => {
                Err(RangeError::EmptyPoint { key: lower })
            }
            _ => Ok(Self {
                lower,
                upper,
                lower_inclusive,
                upper_inclusive,
            }),
        }
    }

    /// Half-open `[lower, upper)` range, the shape partitions are served in.
    pub fn half_open(
        lower: impl Into<String>,
        upper: impl Into<String>,
    ) -> Result<Self, RangeError> {
        Self::try_new(
            EffectiveKey::new(lower),
            EffectiveKey::new(upper),
            true,
            false,
        )
    }

    /// Single-key range `[key, key]`.
    #[must_use]
    pub fn point(key: EffectiveKey) -> Self {
        Self {
            lower: key.clone(),
            upper: key,
            lower_inclusive: true,
            upper_inclusive: true,
        }
    }

    #[must_use]
    pub const fn lower(&self) -> &EffectiveKey {
        &self.lower
    }

    #[must_use]
    pub const fn upper(&self) -> &EffectiveKey {
        &self.upper
    }

    #[must_use]
    pub const fn lower_inclusive(&self) -> bool {
        self.lower_inclusive
    }

    #[must_use]
    pub const fn upper_inclusive(&self) -> bool {
        self.upper_inclusive
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        *self == Self::FULL
    }

    #[must_use]
    pub fn contains(&self, key: &EffectiveKey) -> bool {
        let above_lower = match key.cmp(&self.lower) {
            Ordering::Greater => true,
            Ordering::Equal => self.lower_inclusive,
            Ordering::Less => false,
        };
        let below_upper = match key.cmp(&self.upper) {
            Ordering::Less => true,
            Ordering::Equal => self.upper_inclusive,
            Ordering::Greater => false,
        };

        above_lower && below_upper
    }

    /// The overlapping fragment of two ranges, if any.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let (lower, lower_inclusive) = match self.lower.cmp(&other.lower) {
            Ordering::Greater => (&self.lower, self.lower_inclusive),
            Ordering::Less => (&other.lower, other.lower_inclusive),
            Ordering::Equal => (
                &self.lower,
                self.lower_inclusive && other.lower_inclusive,
            ),
        };
        let (upper, upper_inclusive) = match self.upper.cmp(&other.upper) {
            Ordering::Less => (&self.upper, self.upper_inclusive),
            Ordering::Greater => (&other.upper, other.upper_inclusive),
            Ordering::Equal => (
                &self.upper,
                self.upper_inclusive && other.upper_inclusive,
            ),
        };

        Self::try_new(lower.clone(), upper.clone(), lower_inclusive, upper_inclusive).ok()
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.intersection(other).is_some()
    }

    /// Order ranges by where they start; an exclusive start begins later.
    #[must_use]
    pub fn cmp_start(&self, other: &Self) -> Ordering {
        self.lower
            .cmp(&other.lower)
            .then_with(|| other.lower_inclusive.cmp(&self.lower_inclusive))
    }
}

impl fmt::Display for PartitionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = if self.lower_inclusive { '[' } else { '(' };
        let close = if self.upper_inclusive { ']' } else { ')' };

        write!(f, "{open}{},{}{close}", self.lower, self.upper)
    }
}

///
/// FeedRange
///
/// The ways a query can scope itself to part of a collection. Matched
/// explicitly wherever the variants behave differently.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FeedRange {
    /// An explicit slice of the effective key space.
    Effective(PartitionRange),

    /// Everything stored under one logical partition-key value.
    PartitionKey(String),
}

impl FeedRange {
    /// The whole collection.
    #[must_use]
    pub const fn full() -> Self {
        Self::Effective(PartitionRange::FULL)
    }

    /// Resolve this feed range to the effective range it covers.
    #[must_use]
    pub fn effective_range(&self) -> PartitionRange {
        match self {
            Self::Effective(range) => range.clone(),
            Self::PartitionKey(key) => PartitionRange::point(EffectiveKey::hash_of(key)),
        }
    }

    /// Identifiers of the partitions currently serving this feed range.
    pub async fn partitions(
        &self,
        resolver: &dyn RoutingResolver,
    ) -> Result<Vec<PartitionId>, RoutingError> {
        let range = self.effective_range();
        let resolution = resolver.resolve(&range).await?;

        Ok(resolution
            .partitions
            .into_iter()
            .filter(|assignment| assignment.range.overlaps(&range))
            .map(|assignment| assignment.id)
            .collect())
    }
}

impl fmt::Display for FeedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Effective(range) => write!(f, "{range}"),
            Self::PartitionKey(key) => write!(f, "pk({key})"),
        }
    }
}
