use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::collateral::loan::Loan;
use crate::error::AbsError;
use crate::types::{Money, Rate};
use crate::AbsResult;

// ---------------------------------------------------------------------------
// Hazard table
// ---------------------------------------------------------------------------

/// Period-indexed monthly default probabilities with step/floor lookup: the
/// probability at period T is the value of the greatest key <= T, or zero
/// when no key qualifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HazardTable {
    rates: BTreeMap<u32, Rate>,
}

impl HazardTable {
    pub fn new(rates: BTreeMap<u32, Rate>) -> AbsResult<Self> {
        for (period, p) in &rates {
            if *p <= Decimal::ZERO || *p > Decimal::ONE {
                return Err(AbsError::InvalidConfiguration {
                    field: format!("hazard[{period}]"),
                    reason: format!("Default probability must be in (0, 1], got {p}"),
                });
            }
        }
        Ok(Self { rates })
    }

    /// The calibrated seasoning curve: low hazard while loans are new,
    /// peaking around period 120, tailing off after 180.
    pub fn seasoned() -> Self {
        let rates = BTreeMap::from([
            (1, dec!(0.0005)),
            (11, dec!(0.001)),
            (60, dec!(0.002)),
            (120, dec!(0.004)),
            (180, dec!(0.002)),
            (210, dec!(0.001)),
        ]);
        Self { rates }
    }

    /// An empty table: no loan ever defaults. Useful for deterministic runs.
    pub fn none() -> Self {
        Self {
            rates: BTreeMap::new(),
        }
    }

    pub fn probability_at(&self, period: u32) -> Rate {
        self.rates
            .range(..=period)
            .next_back()
            .map(|(_, p)| *p)
            .unwrap_or(Decimal::ZERO)
    }
}

// ---------------------------------------------------------------------------
// Default model
// ---------------------------------------------------------------------------

/// Randomized default sweep over a set of loans. A loan with hazard `p`
/// defaults when a uniform integer draw over `[0, round(1/p) - 1]` lands on
/// zero; the transition is one-shot and the asset's recovery value is
/// credited exactly once, in the period of the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultModel {
    hazards: HazardTable,
}

impl DefaultModel {
    pub fn new(hazards: HazardTable) -> Self {
        Self { hazards }
    }

    pub fn hazards(&self) -> &HazardTable {
        &self.hazards
    }

    /// Run the default draw for every non-defaulted loan at `period` and
    /// return the total recovery cash produced this period.
    pub fn sweep(&self, loans: &mut [Loan], period: u32, rng: &mut StdRng) -> Money {
        let p = self.hazards.probability_at(period);
        if p.is_zero() {
            return Decimal::ZERO;
        }
        let odds = (Decimal::ONE / p).round();
        let draw_range = odds.to_u64().unwrap_or(u64::MAX).saturating_sub(1);

        let mut recovered = Decimal::ZERO;
        for loan in loans.iter_mut() {
            if loan.is_defaulted() {
                continue;
            }
            if rng.gen_range(0..=draw_range) == 0 {
                loan.mark_defaulted();
                recovered += loan.recovery_value(period);
            }
        }
        recovered
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
