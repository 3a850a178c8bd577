//! # Monetary Amounts
//!
//! [`Amount`] is the only monetary representation in the engine: an
//! integer count of minor units (cents, satoshi, stroops — whatever the
//! settlement rail's smallest unit is).
//!
//! ## Security Invariant
//!
//! Monetary values are never floating point and never wrap. All
//! arithmetic goes through `checked_*` methods; callers must handle the
//! `None` case explicitly rather than letting an overflow mint or burn
//! value.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A monetary amount in minor units of the invoice's asset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    /// The zero amount.
    pub const ZERO: Amount = Amount(0);

    /// Create an amount from minor units.
    pub const fn from_minor(minor: u64) -> Self {
        Self(minor)
    }

    /// The amount in minor units.
    pub const fn minor(&self) -> u64 {
        self.0
    }

    /// Whether the amount is zero.
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checked addition. `None` on overflow.
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Checked subtraction. `None` on underflow.
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Sum an iterator of amounts, failing on overflow.
    pub fn checked_sum<I: IntoIterator<Item = Amount>>(amounts: I) -> Option<Amount> {
        amounts
            .into_iter()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(a))
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated currency/asset tag (e.g. `USD`, `USDC`, `XLM`).
///
/// Stored uppercase. The engine never converts between assets; the tag
/// exists so that an invoice's custody record and its settlement rail
/// agree on what is being held.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetCode(String);

impl AssetCode {
    /// Maximum tag length.
    pub const MAX_LEN: usize = 12;

    /// Create a validated asset code.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] if the tag is empty, longer than
    /// [`MAX_LEN`](Self::MAX_LEN), or contains non-alphanumeric ASCII.
    pub fn new(code: impl Into<String>) -> Result<Self, CoreError> {
        let code = code.into();
        if code.is_empty() || code.len() > Self::MAX_LEN {
            return Err(CoreError::Validation(format!(
                "asset code must be 1-{} characters, got {:?}",
                Self::MAX_LEN,
                code
            )));
        }
        if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CoreError::Validation(format!(
                "asset code must be ASCII alphanumeric, got {code:?}"
            )));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    /// The tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AssetCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
