use rand::rngs::StdRng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::collateral::default_model::DefaultModel;
use crate::collateral::loan::Loan;
use crate::error::AbsError;
use crate::types::{Money, Rate};
use crate::AbsResult;

/// Per-loan state captured for one waterfall period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoanSnapshot {
    pub balance: Money,
    pub monthly_payment: Money,
    pub principal_due: Money,
    pub interest_due: Money,
}

/// An unordered pool of amortizing loans. All aggregate queries are simple
/// sums over the individual loans; out-of-domain periods contribute zero at
/// the loan level, so no bounds checks are needed here.
#[derive(Debug, Clone)]
pub struct LoanPool {
    loans: Vec<Loan>,
}

impl LoanPool {
    pub fn new(loans: Vec<Loan>) -> AbsResult<Self> {
        if loans.is_empty() {
            return Err(AbsError::InsufficientData(
                "A loan pool requires at least one loan".into(),
            ));
        }
        Ok(Self { loans })
    }

    pub fn loans(&self) -> &[Loan] {
        &self.loans
    }

    pub fn len(&self) -> usize {
        self.loans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loans.is_empty()
    }

    /// Total face amount of the pool.
    pub fn total_principal(&self) -> Money {
        self.loans.iter().map(|l| l.face()).sum()
    }

    /// Total scheduled payments over every loan's full term.
    pub fn total_payments(&self) -> Money {
        self.loans.iter().map(|l| l.total_payments()).sum()
    }

    /// Lifetime interest across the pool.
    pub fn total_interest(&self) -> Money {
        self.total_payments() - self.total_principal()
    }

    /// Total scheduled payment due at `period`.
    pub fn payment_due(&self, period: u32) -> Money {
        self.loans.iter().map(|l| l.monthly_payment(period)).sum()
    }

    /// Total principal due at `period`.
    pub fn principal_due(&self, period: u32) -> Money {
        self.loans.iter().map(|l| l.principal_due(period)).sum()
    }

    /// Total interest due at `period`.
    pub fn interest_due(&self, period: u32) -> Money {
        self.loans.iter().map(|l| l.interest_due(period)).sum()
    }

    /// Total outstanding balance at `period`.
    pub fn balance(&self, period: u32) -> Money {
        self.loans.iter().map(|l| l.balance(period)).sum()
    }

    /// Number of loans with a positive balance at `period`.
    pub fn active_loan_count(&self, period: u32) -> usize {
        self.loans
            .iter()
            .filter(|l| l.balance(period) > Decimal::ZERO)
            .count()
    }

    /// Face-weighted average annual rate at `period`.
    pub fn weighted_average_rate(&self, period: u32) -> Rate {
        let weighted: Decimal = self
            .loans
            .iter()
            .map(|l| l.face() * l.rate_at(period))
            .sum();
        weighted / self.total_principal()
    }

    /// Face-weighted average maturity, in years.
    pub fn weighted_average_maturity(&self) -> Decimal {
        let weighted: Decimal = self
            .loans
            .iter()
            .map(|l| l.face() * Decimal::from(l.term()) / dec!(12))
            .sum();
        weighted / self.total_principal()
    }

    /// Per-loan state for the waterfall record at `period`.
    pub fn snapshot(&self, period: u32) -> Vec<LoanSnapshot> {
        self.loans
            .iter()
            .map(|l| LoanSnapshot {
                balance: l.balance(period),
                monthly_payment: l.monthly_payment(period),
                principal_due: l.principal_due(period),
                interest_due: l.interest_due(period),
            })
            .collect()
    }

    /// Delegate the period's default draw to the model, mutating loan flags
    /// and returning the recovery cash.
    pub fn sweep_defaults(&mut self, model: &DefaultModel, period: u32, rng: &mut StdRng) -> Money {
        model.sweep(&mut self.loans, period, rng)
    }

    /// Restore every loan to its period-0 state for a fresh trial.
    pub fn reset(&mut self) {
        for loan in &mut self.loans {
            loan.reset();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
