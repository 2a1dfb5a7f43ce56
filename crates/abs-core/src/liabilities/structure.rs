use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::AbsError;
use crate::liabilities::tranche::{PaymentStatus, Tranche};
use crate::types::{Money, Rate};
use crate::AbsResult;

/// Principal allocation mode. An unrecognized mode is unrepresentable:
/// deserializing an unknown string fails at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayMode {
    /// Strict waterfall: senior tranches drain the shared cash pool first.
    Sequential,
    /// Proportional split: each tranche claims its face-percent share.
    ProRata,
}

impl fmt::Display for PayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayMode::Sequential => write!(f, "Sequential"),
            PayMode::ProRata => write!(f, "Pro Rata"),
        }
    }
}

/// Per-tranche state captured for one waterfall period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrancheSnapshot {
    pub notional_balance: Money,
    pub interest_due: Money,
    pub interest_paid: Money,
    pub interest_shortfall: Money,
    pub principal_paid: Money,
}

/// The ordered collection of tranches plus the reserve account. Tranches are
/// kept sorted ascending by subordination (0 = most senior, serviced first);
/// cash left over after a full allocation pass carries to the next period
/// through the reserve.
#[derive(Debug, Clone)]
pub struct StructuredSecurities {
    total_face: Money,
    tranches: Vec<Tranche>,
    mode: PayMode,
    reserve_account: Money,
}

impl StructuredSecurities {
    pub fn new(total_face: Money, mode: PayMode) -> AbsResult<Self> {
        if total_face <= Decimal::ZERO {
            return Err(AbsError::InvalidInput {
                field: "total_face".into(),
                reason: "Total face must be positive".into(),
            });
        }
        Ok(Self {
            total_face,
            tranches: Vec::new(),
            mode,
            reserve_account: Decimal::ZERO,
        })
    }

    /// Add a tranche sized as `face_percent` of the total face. The list is
    /// re-sorted by subordination on every insertion.
    pub fn add_tranche(
        &mut self,
        face_percent: Rate,
        rate: Rate,
        subordination: u32,
    ) -> AbsResult<()> {
        let tranche = Tranche::new(
            face_percent * self.total_face,
            rate,
            face_percent,
            subordination,
        )?;
        self.tranches.push(tranche);
        self.tranches.sort_by_key(Tranche::subordination);
        Ok(())
    }

    pub fn total_face(&self) -> Money {
        self.total_face
    }

    pub fn mode(&self) -> PayMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: PayMode) {
        self.mode = mode;
    }

    pub fn reserve_account(&self) -> Money {
        self.reserve_account
    }

    pub fn tranches(&self) -> &[Tranche] {
        &self.tranches
    }

    /// Revise every tranche's coupon, senior-first order.
    pub fn set_rates(&mut self, rates: &[Rate]) -> AbsResult<()> {
        if rates.len() != self.tranches.len() {
            return Err(AbsError::InvalidInput {
                field: "rates".into(),
                reason: format!(
                    "Expected {} rates, got {}",
                    self.tranches.len(),
                    rates.len()
                ),
            });
        }
        for (tranche, rate) in self.tranches.iter_mut().zip(rates) {
            tranche.set_rate(*rate);
        }
        Ok(())
    }

    /// Advance every tranche into the next period.
    pub fn advance_period(&mut self) {
        for tranche in &mut self.tranches {
            tranche.advance_period();
        }
    }

    /// Allocate one period's cash: reserve is folded into the available
    /// amount, interest is paid senior-first regardless of mode, then
    /// principal per the configured mode, and whatever remains becomes the
    /// new reserve. Duplicate-payment no-ops are reported through `warnings`.
    pub fn make_payments(
        &mut self,
        cash_amount: Money,
        principal_due_total: Money,
        warnings: &mut Vec<String>,
    ) {
        let mut cash_left = cash_amount + self.reserve_account;
        self.reserve_account = Decimal::ZERO;

        // Interest pass: senior first, always.
        for tranche in &mut self.tranches {
            let (remaining, status) = tranche.make_interest_payment(cash_left);
            if status == PaymentStatus::DuplicateIgnored {
                warnings.push(format!(
                    "Duplicate interest payment ignored for subordination {} in period {}",
                    tranche.subordination(),
                    tranche.current_period()
                ));
            }
            cash_left = remaining;
        }

        // Principal pass: only with cash remaining, only against live balances.
        if cash_left > Decimal::ZERO {
            match self.mode {
                PayMode::Sequential => {
                    for tranche in &mut self.tranches {
                        if tranche.notional_balance() > Decimal::ZERO {
                            let (remaining, status) =
                                tranche.make_principal_payment(cash_left, principal_due_total);
                            if status == PaymentStatus::DuplicateIgnored {
                                warnings.push(format!(
                                    "Duplicate principal payment ignored for subordination {} in period {}",
                                    tranche.subordination(),
                                    tranche.current_period()
                                ));
                            }
                            cash_left = remaining;
                        }
                    }
                }
                PayMode::ProRata => {
                    // Each live tranche draws on its own face-percent sleeve
                    // of the available cash, so a senior claim cannot starve
                    // a junior one.
                    let available = cash_left;
                    for tranche in &mut self.tranches {
                        if tranche.notional_balance() > Decimal::ZERO {
                            let sleeve = available * tranche.face_percent();
                            let due = principal_due_total * tranche.face_percent();
                            let (unspent, status) = tranche.make_principal_payment(sleeve, due);
                            if status == PaymentStatus::DuplicateIgnored {
                                warnings.push(format!(
                                    "Duplicate principal payment ignored for subordination {} in period {}",
                                    tranche.subordination(),
                                    tranche.current_period()
                                ));
                            }
                            cash_left -= sleeve - unspent;
                        }
                    }
                }
            }
        }

        self.reserve_account = cash_left;
    }

    /// Per-tranche state for the waterfall record, senior-first.
    pub fn snapshot(&self) -> Vec<TrancheSnapshot> {
        self.tranches
            .iter()
            .map(|t| TrancheSnapshot {
                notional_balance: t.notional_balance(),
                interest_due: t.interest_due(),
                interest_paid: t.current_interest_paid(),
                interest_shortfall: t.interest_shortfall(),
                principal_paid: t.current_principal_paid(),
            })
            .collect()
    }

    /// Restore the structure (tranches and reserve) to its period-0 state.
    pub fn reset(&mut self) {
        self.reserve_account = Decimal::ZERO;
        for tranche in &mut self.tranches {
            tranche.reset();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
