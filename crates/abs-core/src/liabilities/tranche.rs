use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::AbsError;
use crate::types::{Money, Rate};
use crate::AbsResult;

/// Outcome of applying a payment to a tranche within a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// The payment was applied (possibly partially, recording a shortfall).
    Applied,
    /// A payment of this kind was already applied this period; ignored.
    DuplicateIgnored,
    /// Nothing is due (zero interest due or zero balance); ignored.
    NothingDue,
}

/// A single ranked debt class. Interest accrues each period on the notional
/// balance; unpaid interest or principal rolls forward one period as a
/// shortfall. At most one interest payment and one principal payment may be
/// applied per period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tranche {
    face: Money,
    rate: Rate,
    face_percent: Rate,
    subordination: u32,
    current_period: u32,
    notional_balance: Money,
    current_interest_due: Money,
    current_interest_paid: Money,
    interest_shortfall: Money,
    current_principal_due: Money,
    current_principal_paid: Money,
    principal_shortfall: Money,
}

fn monthly_rate(annual_rate: Rate) -> Rate {
    annual_rate / dec!(12)
}

impl Tranche {
    pub fn new(face: Money, rate: Rate, face_percent: Rate, subordination: u32) -> AbsResult<Self> {
        if face <= Decimal::ZERO {
            return Err(AbsError::InvalidInput {
                field: "face".into(),
                reason: "Tranche face must be positive".into(),
            });
        }
        if rate < Decimal::ZERO {
            return Err(AbsError::InvalidInput {
                field: "rate".into(),
                reason: "Coupon rate cannot be negative".into(),
            });
        }
        if face_percent <= Decimal::ZERO || face_percent > Decimal::ONE {
            return Err(AbsError::InvalidInput {
                field: "face_percent".into(),
                reason: "Face percent must be in (0, 1]".into(),
            });
        }
        Ok(Self {
            face,
            rate,
            face_percent,
            subordination,
            current_period: 0,
            notional_balance: face,
            current_interest_due: Decimal::ZERO,
            current_interest_paid: Decimal::ZERO,
            interest_shortfall: Decimal::ZERO,
            current_principal_due: Decimal::ZERO,
            current_principal_paid: Decimal::ZERO,
            principal_shortfall: Decimal::ZERO,
        })
    }

    // -----------------------------------------------------------------------
    // Period machinery
    // -----------------------------------------------------------------------

    /// Roll into the next period: accrue interest on the running balance,
    /// fold last period's unpaid interest into the new due amount, and clear
    /// the per-period paid counters.
    pub fn advance_period(&mut self) {
        self.current_period += 1;
        self.current_interest_due =
            self.notional_balance * monthly_rate(self.rate) + self.interest_shortfall;
        self.current_interest_paid = Decimal::ZERO;
        self.current_principal_paid = Decimal::ZERO;
        self.interest_shortfall = Decimal::ZERO;
    }

    /// Apply an interest payment for the current period. Consumes
    /// `min(interest_due, cash)`, records the unpaid remainder as a
    /// shortfall, and returns the unconsumed cash. A second call in the same
    /// period is a no-op.
    pub fn make_interest_payment(&mut self, cash: Money) -> (Money, PaymentStatus) {
        if self.current_interest_paid > Decimal::ZERO {
            return (cash, PaymentStatus::DuplicateIgnored);
        }
        if self.current_interest_due.is_zero() {
            return (cash, PaymentStatus::NothingDue);
        }
        self.current_interest_paid = self.current_interest_due.min(cash);
        self.interest_shortfall = self.current_interest_due - self.current_interest_paid;
        (cash - self.current_interest_paid, PaymentStatus::Applied)
    }

    /// Apply a principal payment for the current period. The claim is
    /// `min(notional_balance, due_amount + prior shortfall)`; payment is
    /// capped at the available cash, the balance is reduced, and any unmet
    /// claim carries forward. Returns the unconsumed cash. A second call in
    /// the same period is a no-op.
    pub fn make_principal_payment(&mut self, cash: Money, due_amount: Money) -> (Money, PaymentStatus) {
        if self.current_principal_paid > Decimal::ZERO {
            return (cash, PaymentStatus::DuplicateIgnored);
        }
        if self.notional_balance.is_zero() {
            return (cash, PaymentStatus::NothingDue);
        }
        self.current_principal_due = self
            .notional_balance
            .min(due_amount + self.principal_shortfall);
        self.current_principal_paid = self.current_principal_due.min(cash);
        self.notional_balance -= self.current_principal_paid;
        self.principal_shortfall = self.current_principal_due - self.current_principal_paid;
        (cash - self.current_principal_paid, PaymentStatus::Applied)
    }

    /// Restore the tranche to its period-0 state for a fresh trial.
    pub fn reset(&mut self) {
        self.current_period = 0;
        self.notional_balance = self.face;
        self.current_interest_due = Decimal::ZERO;
        self.current_interest_paid = Decimal::ZERO;
        self.interest_shortfall = Decimal::ZERO;
        self.current_principal_due = Decimal::ZERO;
        self.current_principal_paid = Decimal::ZERO;
        self.principal_shortfall = Decimal::ZERO;
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn face(&self) -> Money {
        self.face
    }

    pub fn rate(&self) -> Rate {
        self.rate
    }

    /// Coupon rates are revised between Monte Carlo iterations.
    pub fn set_rate(&mut self, rate: Rate) {
        self.rate = rate;
    }

    pub fn face_percent(&self) -> Rate {
        self.face_percent
    }

    pub fn subordination(&self) -> u32 {
        self.subordination
    }

    pub fn current_period(&self) -> u32 {
        self.current_period
    }

    pub fn notional_balance(&self) -> Money {
        self.notional_balance
    }

    pub fn interest_due(&self) -> Money {
        self.current_interest_due
    }

    pub fn current_interest_paid(&self) -> Money {
        self.current_interest_paid
    }

    pub fn interest_shortfall(&self) -> Money {
        self.interest_shortfall
    }

    pub fn current_principal_paid(&self) -> Money {
        self.current_principal_paid
    }

    pub fn principal_shortfall(&self) -> Money {
        self.principal_shortfall
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
