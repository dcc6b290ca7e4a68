//! Service rank packing.
//!
//! A [`Rank`] packs a [`RankAssertion`] into the high 8 bits and a service
//! order index into the low 24 bits. Comparisons are plain numeric
//! comparisons: the lower value wins, so the assertion decides before the
//! configured order does.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Explicit priority override attached to a service or interface.
///
/// Ordered numerically; a greater value is more restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum RankAssertion {
    First = 0,
    #[default]
    Default = 1,
    Last = 2,
    Never = 3,
    Scoped = 4,
}

impl RankAssertion {
    /// Returns the raw value stored in the high byte of a [`Rank`].
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a raw assertion byte. Unknown values decode as `Never`.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => RankAssertion::First,
            1 => RankAssertion::Default,
            2 => RankAssertion::Last,
            4 => RankAssertion::Scoped,
            _ => RankAssertion::Never,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RankAssertion::First => "First",
            RankAssertion::Default => "Default",
            RankAssertion::Last => "Last",
            RankAssertion::Never => "Never",
            RankAssertion::Scoped => "Scoped",
        }
    }
}

impl fmt::Display for RankAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RankAssertion {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "first" => Ok(RankAssertion::First),
            "default" => Ok(RankAssertion::Default),
            "last" => Ok(RankAssertion::Last),
            "never" => Ok(RankAssertion::Never),
            "scoped" => Ok(RankAssertion::Scoped),
            _ => Err(ParseError::InvalidRankAssertion(s.to_string())),
        }
    }
}

/// Packed `(assertion << 24) | index` rank. Lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rank(u32);

impl Rank {
    /// Largest service order index; also the index of unordered services.
    pub const INDEX_MASK: u32 = 0x00ff_ffff;
    const ASSERTION_SHIFT: u32 = 24;

    pub const fn new(index: u32, assertion: RankAssertion) -> Self {
        Rank(((assertion.as_u8() as u32) << Self::ASSERTION_SHIFT) | (index & Self::INDEX_MASK))
    }

    /// Rank with index 0 carrying only an assertion.
    pub const fn from_assertion(assertion: RankAssertion) -> Self {
        Self::new(0, assertion)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Rank(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn index(self) -> u32 {
        self.0 & Self::INDEX_MASK
    }

    pub const fn assertion(self) -> RankAssertion {
        RankAssertion::from_u8((self.0 >> Self::ASSERTION_SHIFT) as u8)
    }

    /// Keeps the index and replaces the assertion.
    pub const fn with_assertion(self, assertion: RankAssertion) -> Self {
        Self::new(self.index(), assertion)
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
