//! Strongly-typed coin amounts.
//!
//! An [`Amount`] carries a marker type describing the range of values it is
//! allowed to hold, so that value-balance arithmetic can't silently produce
//! out-of-range results.

use std::convert::TryFrom;
use std::marker::PhantomData;

use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// Total issuance cap, in the smallest unit.
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;

/// A typed amount in the smallest currency unit.
///
/// At https://en.bitcoin.it/wiki/Protocol_documentation#tx, this is an i64.
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount<C = NonNegative>(i64, PhantomData<C>);

impl<C: Constraint> Amount<C> {
    /// The zero amount.
    pub fn zero() -> Amount<C> {
        Amount(0, PhantomData)
    }

    /// The raw value in the smallest unit.
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl<C> Clone for Amount<C> {
    fn clone(&self) -> Self {
        Amount(self.0, PhantomData)
    }
}

impl<C> Copy for Amount<C> {}

impl<C> std::fmt::Debug for Amount<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Amount").field(&self.0).finish()
    }
}

impl<C> PartialEq for Amount<C> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<C> Eq for Amount<C> {}

impl<C> std::hash::Hash for Amount<C> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl<C> PartialOrd for Amount<C> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(&other.0)
    }
}

impl<C> Ord for Amount<C> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

/// Marker trait for the value range an [`Amount`] may hold.
pub trait Constraint {
    /// Check that `value` is within range, returning it unchanged if so.
    fn validate(value: i64) -> Result<i64, Error>;
}

/// Allows only values in `0..=MAX_MONEY`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NonNegative {}

impl Constraint for NonNegative {
    fn validate(value: i64) -> Result<i64, Error> {
        if (0..=MAX_MONEY).contains(&value) {
            Ok(value)
        } else {
            Err(Error::OutOfRange(value))
        }
    }
}

/// Allows values in `-MAX_MONEY..=MAX_MONEY`, used for fee arithmetic.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NegativeAllowed {}

impl Constraint for NegativeAllowed {
    fn validate(value: i64) -> Result<i64, Error> {
        if (-MAX_MONEY..=MAX_MONEY).contains(&value) {
            Ok(value)
        } else {
            Err(Error::OutOfRange(value))
        }
    }
}

/// An amount construction error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The value is outside the constraint's allowed range.
    #[error("amount {0} is out of range")]
    OutOfRange(i64),
}

impl<C: Constraint> TryFrom<i64> for Amount<C> {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        C::validate(value).map(|v| Amount(v, PhantomData))
    }
}

impl<C> From<Amount<C>> for i64 {
    fn from(amount: Amount<C>) -> Self {
        amount.0
    }
}

impl<C> BitcoinSerialize for Amount<C> {
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(target)
    }
}

impl<C: Constraint> BitcoinDeserialize for Amount<C> {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        let value = i64::bitcoin_deserialize(reader)?;
        Amount::try_from(value).map_err(|_| SerializationError::Parse("amount out of range"))
    }
}
