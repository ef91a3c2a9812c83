use crate::error::LedgerError;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// A strictly positive monetary amount.
///
/// Wraps `rust_decimal::Decimal` so that amounts entering the ledger from
/// callers are validated once at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, LedgerError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(LedgerError::InvalidAmount {
                amount: value,
                reason: "amount must be positive".to_string(),
            })
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

/// Rounds half-up (away from zero on the midpoint) to `decimals` places.
///
/// This is the single rounding rule of the ledger: conversions, commissions
/// and withdrawal fees all go through it.
pub fn round_to_unit(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero)
}

/// `value × percent / 100`, rounded to the token unit.
pub fn percent_of(value: Decimal, percent: Decimal, decimals: u32) -> Decimal {
    round_to_unit(value * percent / Decimal::ONE_HUNDRED, decimals)
}
