//! Risk metrics for a tranche's realized cashflow stream: internal rate of
//! return, rate degradation (DIRR), weighted average life, the letter-rating
//! lookup, and the calibrated risk-implied yield curve.

use rust_decimal::Decimal;
use rust_decimal::MathematicalOps;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::AbsError;
use crate::types::{Money, Periods, Rate};
use crate::AbsResult;

const IRR_CONVERGENCE_THRESHOLD: Decimal = dec!(0.0000001);
const MAX_IRR_ITERATIONS: u32 = 100;
const BISECTION_MAX_ITER: u32 = 200;
const MONTHS_PER_YEAR: Decimal = dec!(12);

// ---------------------------------------------------------------------------
// IRR
// ---------------------------------------------------------------------------

/// Annualized internal rate of return of a tranche's realized cash flows.
///
/// `NoSolution` is the explicit sentinel for streams that can never recoup
/// the invested face within a reasonable rate bracket (e.g. a total
/// wipeout). Downstream consumers must handle it; it is never a silent NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrancheIrr {
    Annualized(Rate),
    NoSolution,
}

impl TrancheIrr {
    pub fn value(&self) -> Option<Rate> {
        match self {
            TrancheIrr::Annualized(r) => Some(*r),
            TrancheIrr::NoSolution => None,
        }
    }
}

/// NPV of `-face` at period 0 plus `payments` at periods 1..=N, discounted
/// monthly. Saturates to `Decimal::MAX` when a deeply negative rate blows
/// the tail terms out of Decimal range; a tail made negligible by a huge
/// positive rate is simply truncated.
fn npv_saturating(face: Money, payments: &[Money], monthly_rate: Rate) -> Decimal {
    let one_plus_r = Decimal::ONE + monthly_rate;
    let mut discount = Decimal::ONE;
    let mut acc = -face;
    for p in payments {
        match discount.checked_mul(one_plus_r) {
            Some(d) if !d.is_zero() => discount = d,
            Some(_) => return Decimal::MAX,
            None => break,
        }
        match p.checked_div(discount).and_then(|term| acc.checked_add(term)) {
            Some(a) => acc = a,
            None => return Decimal::MAX,
        }
    }
    acc
}

fn npv_and_derivative(face: Money, payments: &[Money], monthly_rate: Rate) -> Option<(Decimal, Decimal)> {
    let one_plus_r = Decimal::ONE + monthly_rate;
    if one_plus_r <= Decimal::ZERO {
        return None;
    }
    let mut discount = Decimal::ONE;
    let mut npv = -face;
    let mut dnpv = Decimal::ZERO;
    for (t, p) in payments.iter().enumerate() {
        discount = discount.checked_mul(one_plus_r)?;
        if discount.is_zero() {
            return None;
        }
        let term = p.checked_div(discount)?;
        npv = npv.checked_add(term)?;
        let t_dec = Decimal::from(t as u64 + 1);
        dnpv = dnpv.checked_sub(t_dec.checked_mul(term)?.checked_div(one_plus_r)?)?;
    }
    Some((npv, dnpv))
}

/// Solve for the monthly rate at which `-face` plus the payment stream has
/// zero NPV, annualized by multiplying by 12. Newton-Raphson first, falling
/// back to bisection on `[-0.99, 10]` per month when Newton stalls.
pub fn tranche_irr(
    face: Money,
    payments: &[Money],
    warnings: &mut Vec<String>,
) -> AbsResult<TrancheIrr> {
    if face <= Decimal::ZERO {
        return Err(AbsError::InvalidInput {
            field: "face".into(),
            reason: "Face must be positive".into(),
        });
    }
    if payments.is_empty() {
        return Err(AbsError::InsufficientData(
            "IRR requires at least one payment period".into(),
        ));
    }
    let total: Money = payments.iter().copied().sum();
    if total.is_zero() {
        return Ok(TrancheIrr::NoSolution);
    }

    let mut rate = dec!(0.005);
    for _ in 0..MAX_IRR_ITERATIONS {
        let Some((npv, dnpv)) = npv_and_derivative(face, payments, rate) else {
            break;
        };
        if npv.abs() < IRR_CONVERGENCE_THRESHOLD {
            return Ok(TrancheIrr::Annualized(rate * MONTHS_PER_YEAR));
        }
        if dnpv.is_zero() {
            break;
        }
        let Some(step) = npv.checked_div(dnpv) else {
            break;
        };
        let Some(next) = rate.checked_sub(step) else {
            break;
        };
        rate = next.clamp(dec!(-0.99), dec!(10));
    }

    bisect_irr(face, payments, warnings)
}

fn bisect_irr(
    face: Money,
    payments: &[Money],
    warnings: &mut Vec<String>,
) -> AbsResult<TrancheIrr> {
    let mut lo = dec!(-0.99);
    let mut hi = dec!(10);
    let f_lo = npv_saturating(face, payments, lo);
    let f_hi = npv_saturating(face, payments, hi);
    if f_lo <= Decimal::ZERO || f_hi >= Decimal::ZERO {
        return Ok(TrancheIrr::NoSolution);
    }

    for _ in 0..BISECTION_MAX_ITER {
        let mid = (lo + hi) / dec!(2);
        let f_mid = npv_saturating(face, payments, mid);
        if f_mid.abs() < IRR_CONVERGENCE_THRESHOLD || mid == lo || mid == hi {
            return Ok(TrancheIrr::Annualized(mid * MONTHS_PER_YEAR));
        }
        if f_mid > Decimal::ZERO {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    warnings.push(format!(
        "IRR bisection stopped after {BISECTION_MAX_ITER} iterations, using midpoint estimate"
    ));
    Ok(TrancheIrr::Annualized((lo + hi) / dec!(2) * MONTHS_PER_YEAR))
}

// ---------------------------------------------------------------------------
// DIRR and average life
// ---------------------------------------------------------------------------

/// Rate degradation: the coupon promised less the rate realized, capped at
/// total degradation of 1.0 (10,000 basis points). The `NoSolution` sentinel
/// is by definition total degradation.
pub fn dirr(coupon: Rate, irr: TrancheIrr) -> Rate {
    match irr {
        TrancheIrr::Annualized(r) => (coupon - r).min(Decimal::ONE),
        TrancheIrr::NoSolution => Decimal::ONE,
    }
}

/// Dollar-time-weighted average life in periods:
/// `sum(t * principal_paid_t) / face`, with `t` counted from 1.
pub fn average_life(face: Money, principal_payments: &[Money]) -> AbsResult<Periods> {
    if face <= Decimal::ZERO {
        return Err(AbsError::InvalidInput {
            field: "face".into(),
            reason: "Face must be positive".into(),
        });
    }
    let weighted: Decimal = principal_payments
        .iter()
        .enumerate()
        .map(|(t, p)| Decimal::from(t as u64 + 1) * p)
        .sum();
    Ok(weighted / face)
}

// ---------------------------------------------------------------------------
// Letter rating
// ---------------------------------------------------------------------------

/// Letter rating grades, best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Rating {
    Aaa,
    Aa1,
    Aa2,
    Aa3,
    A1,
    A2,
    A3,
    Baa1,
    Baa2,
    Baa3,
    Ba1,
    Ba2,
    Ba3,
    B1,
    B2,
    B3,
    Caa,
    Ca,
}

impl std::fmt::Display for Rating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Rating::Aaa => "Aaa",
            Rating::Aa1 => "Aa1",
            Rating::Aa2 => "Aa2",
            Rating::Aa3 => "Aa3",
            Rating::A1 => "A1",
            Rating::A2 => "A2",
            Rating::A3 => "A3",
            Rating::Baa1 => "Baa1",
            Rating::Baa2 => "Baa2",
            Rating::Baa3 => "Baa3",
            Rating::Ba1 => "Ba1",
            Rating::Ba2 => "Ba2",
            Rating::Ba3 => "Ba3",
            Rating::B1 => "B1",
            Rating::B2 => "B2",
            Rating::B3 => "B3",
            Rating::Caa => "Caa",
            Rating::Ca => "Ca",
        };
        write!(f, "{s}")
    }
}

/// Ascending DIRR thresholds in basis points and the grade assigned at and
/// above each.
const RATING_THRESHOLDS_BPS: [(Decimal, Rating); 18] = [
    (dec!(0.06), Rating::Aaa),
    (dec!(0.67), Rating::Aa1),
    (dec!(1.3), Rating::Aa2),
    (dec!(2.7), Rating::Aa3),
    (dec!(5.2), Rating::A1),
    (dec!(8.9), Rating::A2),
    (dec!(13), Rating::A3),
    (dec!(19), Rating::Baa1),
    (dec!(27), Rating::Baa2),
    (dec!(46), Rating::Baa3),
    (dec!(72), Rating::Ba1),
    (dec!(106), Rating::Ba2),
    (dec!(143), Rating::Ba3),
    (dec!(183), Rating::B1),
    (dec!(231), Rating::B2),
    (dec!(311), Rating::B3),
    (dec!(2500), Rating::Caa),
    (dec!(10000), Rating::Ca),
];

/// Convert a DIRR to a letter grade: the rating of the largest threshold at
/// or below `dirr * 10000` basis points. Values below the smallest threshold
/// clamp to Aaa; values above 10,000bp are unrepresentable and fatal.
pub fn rating_for_dirr(dirr: Rate) -> AbsResult<Rating> {
    let bps = dirr * dec!(10000);
    if bps > dec!(10000) {
        return Err(AbsError::RatingOutOfRange { dirr_bps: bps });
    }
    let mut rating = Rating::Aaa;
    for (threshold, grade) in RATING_THRESHOLDS_BPS {
        if bps >= threshold {
            rating = grade;
        } else {
            break;
        }
    }
    Ok(rating)
}

// ---------------------------------------------------------------------------
// Risk-implied yield
// ---------------------------------------------------------------------------

/// Calibrated yield curve mapping a tranche's realized risk to the coupon
/// the market would demand:
/// `(7 / (1 + 0.08 e^(-0.19 AL/12)) + 0.019 sqrt(AL * DIRR * 100 / 12)) / 100`.
/// A negative product under the root (DIRR slightly above the coupon's
/// realized rate) contributes zero.
pub fn risk_implied_yield(dirr: Rate, average_life: Periods) -> Rate {
    let decay = (dec!(-0.19) * average_life / MONTHS_PER_YEAR).exp();
    let base = dec!(7) / (Decimal::ONE + dec!(0.08) * decay);
    let product = (average_life * dirr * dec!(100) / MONTHS_PER_YEAR).max(Decimal::ZERO);
    let spread = dec!(0.019) * product.sqrt().unwrap_or_default();
    (base + spread) / dec!(100)
}

// ---------------------------------------------------------------------------
// Combined tranche metrics
// ---------------------------------------------------------------------------

/// The full risk picture for one tranche over one simulated life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrancheMetrics {
    pub irr: TrancheIrr,
    pub dirr: Rate,
    pub average_life: Periods,
    pub rating: Rating,
}

/// Derive IRR, DIRR, average life, and the letter rating from a tranche's
/// full-history payment series (total payments and principal-only payments,
/// both indexed from period 1).
pub fn tranche_metrics(
    face: Money,
    coupon: Rate,
    payments: &[Money],
    principal_payments: &[Money],
    warnings: &mut Vec<String>,
) -> AbsResult<TrancheMetrics> {
    if payments.len() != principal_payments.len() {
        return Err(AbsError::InvalidInput {
            field: "principal_payments".into(),
            reason: format!(
                "Series length mismatch: {} payments vs {} principal payments",
                payments.len(),
                principal_payments.len()
            ),
        });
    }
    let irr = tranche_irr(face, payments, warnings)?;
    let dirr_value = dirr(coupon, irr);
    let al = average_life(face, principal_payments)?;
    let rating = rating_for_dirr(dirr_value)?;
    Ok(TrancheMetrics {
        irr,
        dirr: dirr_value,
        average_life: al,
        rating,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
