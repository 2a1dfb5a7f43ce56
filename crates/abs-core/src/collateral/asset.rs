use rust_decimal::Decimal;
use rust_decimal::MathematicalOps;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::AbsError;
use crate::types::{Money, Rate};
use crate::AbsResult;

/// Collateral backing a single loan: an initial value that depreciates
/// geometrically month over month. Concrete depreciation tables for
/// particular collateral kinds live with the caller; the engine only needs
/// the rate itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    initial_value: Money,
    annual_depreciation_rate: Rate,
}

impl Asset {
    pub fn new(initial_value: Money, annual_depreciation_rate: Rate) -> AbsResult<Self> {
        if initial_value <= Decimal::ZERO {
            return Err(AbsError::InvalidInput {
                field: "initial_value".into(),
                reason: "Asset value must be positive".into(),
            });
        }
        if annual_depreciation_rate < Decimal::ZERO || annual_depreciation_rate >= Decimal::ONE {
            return Err(AbsError::InvalidInput {
                field: "annual_depreciation_rate".into(),
                reason: "Depreciation rate must be in [0, 1)".into(),
            });
        }
        Ok(Self {
            initial_value,
            annual_depreciation_rate,
        })
    }

    pub fn initial_value(&self) -> Money {
        self.initial_value
    }

    pub fn annual_depreciation_rate(&self) -> Rate {
        self.annual_depreciation_rate
    }

    /// Monthly depreciation rate (annual / 12).
    pub fn monthly_depreciation_rate(&self) -> Rate {
        self.annual_depreciation_rate / dec!(12)
    }

    /// Depreciated value after `period` months:
    /// `initial_value * (1 - monthly_rate)^period`.
    pub fn value(&self, period: u32) -> Money {
        self.initial_value * (Decimal::ONE - self.monthly_depreciation_rate()).powi(period as i64)
    }
}
