use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use rust_decimal::MathematicalOps;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::collateral::asset::Asset;
use crate::error::AbsError;
use crate::types::{Money, Rate};
use crate::AbsResult;

/// Fraction of the collateral's depreciated value recovered when a loan
/// defaults. Credited once, in the period the default is detected.
const RECOVERY_MULTIPLIER: Decimal = dec!(0.6);

// ---------------------------------------------------------------------------
// Rate source
// ---------------------------------------------------------------------------

/// Where a loan's annual rate comes from: a fixed scalar for the whole term,
/// or a period-keyed step function. For the step function the effective rate
/// at period T is the value of the greatest key <= T; a period below the
/// smallest key carries rate 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RateSource {
    Fixed { rate: Rate },
    Stepped { schedule: BTreeMap<u32, Rate> },
}

impl RateSource {
    pub fn fixed(rate: Rate) -> Self {
        RateSource::Fixed { rate }
    }

    pub fn stepped(schedule: BTreeMap<u32, Rate>) -> AbsResult<Self> {
        if schedule.is_empty() {
            return Err(AbsError::InvalidConfiguration {
                field: "schedule".into(),
                reason: "A stepped rate requires at least one period entry".into(),
            });
        }
        Ok(RateSource::Stepped { schedule })
    }

    fn rate_at(&self, period: u32) -> Rate {
        match self {
            RateSource::Fixed { rate } => *rate,
            RateSource::Stepped { schedule } => schedule
                .range(..=period)
                .next_back()
                .map(|(_, r)| *r)
                .unwrap_or(Decimal::ZERO),
        }
    }
}

// ---------------------------------------------------------------------------
// Insurance surcharge
// ---------------------------------------------------------------------------

/// Optional insurance surcharge attached to mortgage-style loans: while the
/// loan-to-value ratio stays above `ltv_threshold`, each monthly payment
/// carries an extra `premium_rate * face`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MortgageInsurance {
    pub ltv_threshold: Rate,
    pub premium_rate: Rate,
}

impl MortgageInsurance {
    /// Standard private mortgage insurance: 0.75bp of face per month while
    /// the LTV exceeds 80%.
    pub fn standard() -> Self {
        Self {
            ltv_threshold: dec!(0.8),
            premium_rate: dec!(0.000075),
        }
    }
}

// ---------------------------------------------------------------------------
// Loan
// ---------------------------------------------------------------------------

/// A single amortizing loan: level-payment annuity schedule over `term`
/// months, secured by an [`Asset`], with a one-way default flag.
///
/// Period queries outside `[0, term]` return zero rather than failing, so
/// pool aggregation never needs per-loan bounds checks.
#[derive(Debug, Clone)]
pub struct Loan {
    term: u32,
    face: Money,
    rate: RateSource,
    asset: Asset,
    insurance: Option<MortgageInsurance>,
    defaulted: bool,
    balance_cache: RefCell<HashMap<u32, Money>>,
}

fn monthly_rate(annual_rate: Rate) -> Rate {
    annual_rate / dec!(12)
}

impl Loan {
    pub fn new(term: u32, rate: RateSource, face: Money, asset: Asset) -> AbsResult<Self> {
        if term == 0 {
            return Err(AbsError::InvalidInput {
                field: "term".into(),
                reason: "Loan term must be at least one month".into(),
            });
        }
        if face <= Decimal::ZERO {
            return Err(AbsError::InvalidInput {
                field: "face".into(),
                reason: "Loan face must be positive".into(),
            });
        }
        Ok(Self {
            term,
            face,
            rate,
            asset,
            insurance: None,
            defaulted: false,
            balance_cache: RefCell::new(HashMap::new()),
        })
    }

    /// Attach an insurance surcharge (mortgages carry one, other loan kinds
    /// do not).
    pub fn with_insurance(mut self, insurance: MortgageInsurance) -> Self {
        self.insurance = Some(insurance);
        self
    }

    pub fn term(&self) -> u32 {
        self.term
    }

    pub fn face(&self) -> Money {
        self.face
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    pub fn is_defaulted(&self) -> bool {
        self.defaulted
    }

    /// Effective annual rate at `period`; zero outside `[1, term]`.
    pub fn rate_at(&self, period: u32) -> Rate {
        if period == 0 || period > self.term {
            return Decimal::ZERO;
        }
        self.rate.rate_at(period)
    }

    fn level_payment(&self, period: u32) -> Money {
        let rate = self.rate_at(period);
        if rate <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let mr = monthly_rate(rate);
        mr * self.face / (Decimal::ONE - (Decimal::ONE + mr).powi(-(self.term as i64)))
    }

    fn insurance_surcharge(&self, period: u32) -> Money {
        let Some(insurance) = self.insurance else {
            return Decimal::ZERO;
        };
        let ltv = self.balance(period) / self.asset.initial_value();
        if ltv > insurance.ltv_threshold {
            insurance.premium_rate * self.face
        } else {
            Decimal::ZERO
        }
    }

    /// Scheduled payment at `period`: the level annuity payment plus any
    /// insurance surcharge. Zero once defaulted or outside `[1, term]`.
    pub fn monthly_payment(&self, period: u32) -> Money {
        if self.defaulted || period == 0 || period > self.term {
            return Decimal::ZERO;
        }
        self.level_payment(period) + self.insurance_surcharge(period)
    }

    /// Outstanding balance at `period` via the closed-form future-value
    /// formula. `face` at period 0, zero once defaulted or past the term.
    pub fn balance(&self, period: u32) -> Money {
        if self.defaulted || period > self.term {
            return Decimal::ZERO;
        }
        if period == 0 {
            return self.face;
        }
        if let Some(cached) = self.balance_cache.borrow().get(&period) {
            return *cached;
        }
        let rate = self.rate_at(period);
        let balance = if rate.is_zero() {
            self.face
        } else {
            let mr = monthly_rate(rate);
            let compound = (Decimal::ONE + mr).powi(period as i64);
            self.face * compound - self.level_payment(period) * ((compound - Decimal::ONE) / mr)
        };
        self.balance_cache.borrow_mut().insert(period, balance);
        balance
    }

    /// Interest portion due at `period`: last period's balance times the
    /// monthly rate.
    pub fn interest_due(&self, period: u32) -> Money {
        if period == 0 || period > self.term {
            return Decimal::ZERO;
        }
        monthly_rate(self.rate_at(period)) * self.balance(period - 1)
    }

    /// Principal portion due at `period`.
    pub fn principal_due(&self, period: u32) -> Money {
        if period == 0 || period > self.term {
            return Decimal::ZERO;
        }
        self.monthly_payment(period) - self.interest_due(period)
    }

    /// Sum of all scheduled payments over the life of the loan.
    pub fn total_payments(&self) -> Money {
        (1..=self.term).map(|t| self.monthly_payment(t)).sum()
    }

    /// Lifetime interest: total payments less the face amount.
    pub fn total_interest(&self) -> Money {
        self.total_payments() - self.face
    }

    /// Borrower equity: collateral value less the outstanding balance,
    /// floored at zero.
    pub fn equity(&self, period: u32) -> Money {
        (self.asset.value(period) - self.balance(period)).max(Decimal::ZERO)
    }

    /// Cash recovered if the loan defaults at `period`.
    pub fn recovery_value(&self, period: u32) -> Money {
        self.asset.value(period) * RECOVERY_MULTIPLIER
    }

    /// Flag the loan as defaulted. One-way: stays set until [`Loan::reset`].
    pub fn mark_defaulted(&mut self) {
        self.defaulted = true;
    }

    /// Restore the loan to its period-0 state for a fresh trial.
    pub fn reset(&mut self) {
        self.defaulted = false;
        self.balance_cache.borrow_mut().clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TOLERANCE: Decimal = dec!(0.0001);

    fn plain_asset() -> Asset {
        Asset::new(dec!(2000), dec!(0.12)).unwrap()
    }

    fn fixed_loan() -> Loan {
        // 12 months at 12% on 1200: monthly rate 1%, payment ~106.62
        Loan::new(12, RateSource::fixed(dec!(0.12)), dec!(1200), plain_asset()).unwrap()
    }

    #[test]
    fn test_balance_at_zero_is_face() {
        assert_eq!(fixed_loan().balance(0), dec!(1200));
    }

    #[test]
    fn test_amortization_identity() {
        let loan = fixed_loan();
        let total_principal: Decimal = (1..=12).map(|t| loan.principal_due(t)).sum();
        assert!(
            (total_principal - dec!(1200)).abs() < TOLERANCE,
            "principal should sum to face, got {total_principal}"
        );
        assert!(
            loan.balance(12).abs() < TOLERANCE,
            "balance at term should be ~0, got {}",
            loan.balance(12)
        );
    }

    #[test]
    fn test_payment_splits_into_interest_and_principal() {
        let loan = fixed_loan();
        for t in 1..=12 {
            let split = loan.interest_due(t) + loan.principal_due(t);
            assert!((split - loan.monthly_payment(t)).abs() < TOLERANCE);
        }
    }

    #[test]
    fn test_first_period_interest() {
        // 1% of the full 1200 face
        let loan = fixed_loan();
        assert_eq!(loan.interest_due(1), dec!(12));
    }

    #[test]
    fn test_out_of_domain_periods_return_zero() {
        let loan = fixed_loan();
        assert_eq!(loan.monthly_payment(0), Decimal::ZERO);
        assert_eq!(loan.monthly_payment(13), Decimal::ZERO);
        assert_eq!(loan.interest_due(0), Decimal::ZERO);
        assert_eq!(loan.principal_due(13), Decimal::ZERO);
        assert_eq!(loan.balance(13), Decimal::ZERO);
    }

    #[test]
    fn test_default_zeroes_schedule() {
        let mut loan = fixed_loan();
        loan.mark_defaulted();
        assert!(loan.is_defaulted());
        for t in 0..=12 {
            assert_eq!(loan.balance(t), Decimal::ZERO);
            assert_eq!(loan.monthly_payment(t), Decimal::ZERO);
        }
    }

    #[test]
    fn test_reset_restores_schedule() {
        let mut loan = fixed_loan();
        let before = loan.balance(6);
        loan.mark_defaulted();
        assert_eq!(loan.balance(6), Decimal::ZERO);
        loan.reset();
        assert!(!loan.is_defaulted());
        assert_eq!(loan.balance(6), before);
    }

    #[test]
    fn test_stepped_rate_floor_lookup() {
        let mut schedule = BTreeMap::new();
        schedule.insert(1, dec!(0.06));
        schedule.insert(6, dec!(0.12));
        let rate = RateSource::stepped(schedule).unwrap();
        let loan = Loan::new(24, rate, dec!(10000), plain_asset()).unwrap();

        assert_eq!(loan.rate_at(1), dec!(0.06));
        assert_eq!(loan.rate_at(5), dec!(0.06));
        assert_eq!(loan.rate_at(6), dec!(0.12));
        assert_eq!(loan.rate_at(24), dec!(0.12));
        // Outside the term
        assert_eq!(loan.rate_at(0), Decimal::ZERO);
        assert_eq!(loan.rate_at(25), Decimal::ZERO);
    }

    #[test]
    fn test_stepped_rate_below_smallest_key_is_zero() {
        let mut schedule = BTreeMap::new();
        schedule.insert(5, dec!(0.08));
        let rate = RateSource::stepped(schedule).unwrap();
        let loan = Loan::new(24, rate, dec!(10000), plain_asset()).unwrap();
        assert_eq!(loan.rate_at(3), Decimal::ZERO);
        assert_eq!(loan.rate_at(5), dec!(0.08));
    }

    #[test]
    fn test_empty_step_schedule_rejected() {
        assert!(RateSource::stepped(BTreeMap::new()).is_err());
    }

    #[test]
    fn test_recovery_value() {
        let asset = Asset::new(dec!(10000), Decimal::ZERO).unwrap();
        let loan = Loan::new(12, RateSource::fixed(dec!(0.12)), dec!(8000), asset).unwrap();
        assert_eq!(loan.recovery_value(0), dec!(6000));
        assert_eq!(loan.recovery_value(7), dec!(6000));
    }

    #[test]
    fn test_equity_floored_at_zero() {
        // Collateral worth far less than the balance
        let asset = Asset::new(dec!(100), Decimal::ZERO).unwrap();
        let loan = Loan::new(12, RateSource::fixed(dec!(0.12)), dec!(1200), asset).unwrap();
        assert_eq!(loan.equity(1), Decimal::ZERO);
    }

    #[test]
    fn test_equity_positive_when_collateral_exceeds_balance() {
        let asset = Asset::new(dec!(5000), Decimal::ZERO).unwrap();
        let loan = Loan::new(12, RateSource::fixed(dec!(0.12)), dec!(1200), asset).unwrap();
        assert!(loan.equity(1) > Decimal::ZERO);
        assert!(loan.equity(1) < dec!(5000));
    }

    #[test]
    fn test_insurance_surcharge_above_ltv_threshold() {
        let asset = Asset::new(dec!(110000), Decimal::ZERO).unwrap();
        let base = Loan::new(360, RateSource::fixed(dec!(0.06)), dec!(100000), asset.clone())
            .unwrap();
        let insured = Loan::new(360, RateSource::fixed(dec!(0.06)), dec!(100000), asset)
            .unwrap()
            .with_insurance(MortgageInsurance::standard());

        // LTV ~0.91 at period 1, above the 0.8 threshold
        let surcharge = insured.monthly_payment(1) - base.monthly_payment(1);
        assert_eq!(surcharge, dec!(0.000075) * dec!(100000));
    }

    #[test]
    fn test_insurance_surcharge_drops_below_threshold() {
        // Small balance against a large asset: LTV under 0.8, no surcharge
        let asset = Asset::new(dec!(110000), Decimal::ZERO).unwrap();
        let base = Loan::new(360, RateSource::fixed(dec!(0.06)), dec!(50000), asset.clone())
            .unwrap();
        let insured = Loan::new(360, RateSource::fixed(dec!(0.06)), dec!(50000), asset)
            .unwrap()
            .with_insurance(MortgageInsurance::standard());
        assert_eq!(insured.monthly_payment(1), base.monthly_payment(1));
    }

    #[test]
    fn test_total_payments_and_interest() {
        let loan = fixed_loan();
        let expected: Decimal = (1..=12).map(|t| loan.monthly_payment(t)).sum();
        assert_eq!(loan.total_payments(), expected);
        assert!(loan.total_interest() > Decimal::ZERO);
        assert!((loan.total_interest() - (expected - dec!(1200))).abs() < TOLERANCE);
    }

    #[test]
    fn test_validation_errors() {
        assert!(Loan::new(0, RateSource::fixed(dec!(0.1)), dec!(100), plain_asset()).is_err());
        assert!(Loan::new(12, RateSource::fixed(dec!(0.1)), dec!(0), plain_asset()).is_err());
        assert!(Loan::new(12, RateSource::fixed(dec!(0.1)), dec!(-5), plain_asset()).is_err());
    }
}
