use std::ops::Range;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::collateral::default_model::DefaultModel;
use crate::collateral::pool::LoanPool;
use crate::error::AbsError;
use crate::liabilities::structure::{PayMode, StructuredSecurities};
use crate::metrics::{rating_for_dirr, risk_implied_yield, Rating, TrancheIrr};
use crate::types::{with_metadata, ComputationOutput, Money, Periods, Rate};
use crate::waterfall::run_waterfall;
use crate::AbsResult;

/// Tolerance when checking that tranche face percents cover the pool.
const FACE_PERCENT_TOLERANCE: Decimal = dec!(0.0001);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// One tranche of the target structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrancheConfig {
    /// Share of total pool face taken by this tranche.
    pub face_percent: Rate,
    /// Starting coupon guess for the fixed-point search.
    pub initial_rate: Rate,
    /// Rank: 0 is most senior, serviced first.
    pub subordination: u32,
    /// Dampening coefficient applied to this tranche's rate update.
    pub coefficient: Decimal,
}

/// Explicit configuration surface for the Monte Carlo convergence loop.
/// Everything the loop needs arrives here; nothing is read from ambient
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloConfig {
    /// Tranches of the structure (any order; sorted by subordination).
    pub tranches: Vec<TrancheConfig>,
    /// Principal allocation mode.
    pub mode: PayMode,
    /// Stop once the face-weighted relative rate change falls below this.
    pub tolerance: Decimal,
    /// Randomized trials per iteration.
    #[serde(default = "default_num_trials")]
    pub num_trials: u32,
    /// Upper bound on fixed-point iterations; hitting it reports
    /// non-convergence rather than looping unboundedly.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Optional seed for reproducibility.
    pub seed: Option<u64>,
}

fn default_num_trials() -> u32 {
    2_000
}

fn default_max_iterations() -> u32 {
    50
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// Averaged (DIRR, AL) pair for one tranche across a batch of trials.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrancheAverages {
    pub dirr: Rate,
    pub average_life: Periods,
}

/// Converged picture for one tranche.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrancheConvergence {
    pub subordination: u32,
    pub face_percent: Rate,
    pub average_dirr: Rate,
    pub average_life: Periods,
    pub rating: Rating,
    pub coupon_rate: Rate,
}

/// Result of the full Monte Carlo coupon search. Non-convergence within the
/// iteration budget is an expected outcome, reported here rather than as an
/// error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloOutput {
    /// Per-tranche results in subordination order.
    pub tranches: Vec<TrancheConvergence>,
    /// Fixed-point iterations performed.
    pub iterations: u32,
    pub converged: bool,
    pub num_trials: u32,
}

// ---------------------------------------------------------------------------
// Rate-update helpers
// ---------------------------------------------------------------------------

/// Damped fixed-point step toward the risk-implied yield. A full
/// replacement oscillates; the coefficient scales the move.
pub fn new_tranche_rate(old_rate: Rate, coefficient: Decimal, implied_yield: Rate) -> Rate {
    old_rate + coefficient * (implied_yield - old_rate)
}

/// Face-weighted relative rate change between two coupon vectors:
/// `sum_i percent_i * |old_i - new_i| / old_i`.
pub fn weighted_rate_change(
    percents: &[Rate],
    old_rates: &[Rate],
    new_rates: &[Rate],
) -> AbsResult<Decimal> {
    let mut total = Decimal::ZERO;
    for ((percent, old), new) in percents.iter().zip(old_rates).zip(new_rates) {
        if old.is_zero() {
            return Err(AbsError::DivisionByZero {
                context: "weighted rate change (zero coupon)".into(),
            });
        }
        total += percent * ((old - new) / old).abs();
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Trial batches
// ---------------------------------------------------------------------------

/// Run the trials in `range`, resetting the pool and structure before each,
/// and return the per-tranche (DIRR, AL) sums. Each trial draws from its own
/// RNG seeded by `base_seed + trial index`, so partial sums are independent
/// of how a batch is partitioned. An AL contribution is dropped (zero) for
/// any trial whose IRR hit the no-solution sentinel.
pub(crate) fn accumulate_trials(
    pool: &mut LoanPool,
    securities: &mut StructuredSecurities,
    model: &DefaultModel,
    range: Range<u32>,
    base_seed: u64,
) -> AbsResult<Vec<(Money, Periods)>> {
    let mut sums = vec![(Decimal::ZERO, Decimal::ZERO); securities.tranches().len()];
    for trial in range {
        pool.reset();
        securities.reset();
        let mut rng = StdRng::seed_from_u64(base_seed.wrapping_add(trial as u64));
        let output = run_waterfall(pool, securities, model, &mut rng)?;
        for (sum, metric) in sums.iter_mut().zip(&output.metrics) {
            sum.0 += metric.dirr;
            if metric.irr != TrancheIrr::NoSolution {
                sum.1 += metric.average_life;
            }
        }
    }
    Ok(sums)
}

pub(crate) fn averages_from_sums(sums: Vec<(Money, Periods)>, num_trials: u32) -> Vec<TrancheAverages> {
    let n = Decimal::from(num_trials);
    sums.into_iter()
        .map(|(dirr, al)| TrancheAverages {
            dirr: dirr / n,
            average_life: al / n,
        })
        .collect()
}

/// Run `num_trials` randomized waterfall trials sequentially and average the
/// per-tranche (DIRR, AL) metrics.
pub fn simulate_waterfall(
    pool: &mut LoanPool,
    securities: &mut StructuredSecurities,
    model: &DefaultModel,
    num_trials: u32,
    base_seed: u64,
) -> AbsResult<Vec<TrancheAverages>> {
    if num_trials == 0 {
        return Err(AbsError::InvalidInput {
            field: "num_trials".into(),
            reason: "At least one trial is required".into(),
        });
    }
    let sums = accumulate_trials(pool, securities, model, 0..num_trials, base_seed)?;
    Ok(averages_from_sums(sums, num_trials))
}

// ---------------------------------------------------------------------------
// Convergence loop
// ---------------------------------------------------------------------------

pub(crate) fn validate_config(config: &MonteCarloConfig) -> AbsResult<()> {
    if config.tranches.is_empty() {
        return Err(AbsError::InvalidConfiguration {
            field: "tranches".into(),
            reason: "At least one tranche is required".into(),
        });
    }
    let total_percent: Decimal = config.tranches.iter().map(|t| t.face_percent).sum();
    if (total_percent - Decimal::ONE).abs() > FACE_PERCENT_TOLERANCE {
        return Err(AbsError::InvalidConfiguration {
            field: "tranches".into(),
            reason: format!("Face percents must sum to 1.0, got {total_percent}"),
        });
    }
    for (i, tranche) in config.tranches.iter().enumerate() {
        if tranche.initial_rate <= Decimal::ZERO {
            return Err(AbsError::InvalidConfiguration {
                field: format!("tranches[{i}].initial_rate"),
                reason: "Initial coupon must be positive".into(),
            });
        }
        if tranche.coefficient <= Decimal::ZERO {
            return Err(AbsError::InvalidConfiguration {
                field: format!("tranches[{i}].coefficient"),
                reason: "Dampening coefficient must be positive".into(),
            });
        }
    }
    if config.tolerance <= Decimal::ZERO {
        return Err(AbsError::InvalidConfiguration {
            field: "tolerance".into(),
            reason: "Tolerance must be positive".into(),
        });
    }
    if config.num_trials == 0 {
        return Err(AbsError::InvalidConfiguration {
            field: "num_trials".into(),
            reason: "At least one trial per iteration is required".into(),
        });
    }
    if config.max_iterations == 0 {
        return Err(AbsError::InvalidConfiguration {
            field: "max_iterations".into(),
            reason: "At least one iteration is required".into(),
        });
    }
    Ok(())
}

pub(crate) fn build_securities(
    pool: &LoanPool,
    config: &MonteCarloConfig,
) -> AbsResult<StructuredSecurities> {
    let mut securities = StructuredSecurities::new(pool.total_principal(), config.mode)?;
    for tranche in &config.tranches {
        securities.add_tranche(tranche.face_percent, tranche.initial_rate, tranche.subordination)?;
    }
    Ok(securities)
}

/// The shared fixed-point loop: set coupons, simulate a batch, derive
/// risk-implied yields, step the rates, and stop on tolerance or the
/// iteration cap. `simulate` abstracts over the sequential and parallel
/// trial runners.
pub(crate) fn run_convergence<F>(
    securities: &mut StructuredSecurities,
    config: &MonteCarloConfig,
    base_seed: u64,
    warnings: &mut Vec<String>,
    mut simulate: F,
) -> AbsResult<MonteCarloOutput>
where
    F: FnMut(&mut StructuredSecurities, u64) -> AbsResult<Vec<TrancheAverages>>,
{
    let mut ordered: Vec<&TrancheConfig> = config.tranches.iter().collect();
    ordered.sort_by_key(|t| t.subordination);
    let percents: Vec<Rate> = ordered.iter().map(|t| t.face_percent).collect();
    let coefficients: Vec<Decimal> = ordered.iter().map(|t| t.coefficient).collect();
    let mut rates: Vec<Rate> = ordered.iter().map(|t| t.initial_rate).collect();

    let mut iterations: u32 = 0;
    let mut iteration_seed = base_seed;

    let (averages, converged) = loop {
        iterations += 1;
        securities.set_rates(&rates)?;
        let averages = simulate(securities, iteration_seed)?;
        // Fresh seed block per iteration keeps trials independent across
        // iterations.
        iteration_seed = iteration_seed.wrapping_add(config.num_trials as u64);

        let new_rates: Vec<Rate> = rates
            .iter()
            .zip(&coefficients)
            .zip(&averages)
            .map(|((rate, coefficient), avg)| {
                new_tranche_rate(*rate, *coefficient, risk_implied_yield(avg.dirr, avg.average_life))
            })
            .collect();

        let change = weighted_rate_change(&percents, &rates, &new_rates)?;
        if change < config.tolerance {
            break (averages, true);
        }
        if iterations >= config.max_iterations {
            break (averages, false);
        }
        rates = new_rates;
    };

    if !converged {
        warnings.push(format!(
            "Coupon search stopped after {iterations} iterations without reaching tolerance {}",
            config.tolerance
        ));
    }

    let mut tranches = Vec::with_capacity(ordered.len());
    for ((tranche, avg), rate) in ordered.iter().zip(&averages).zip(&rates) {
        tranches.push(TrancheConvergence {
            subordination: tranche.subordination,
            face_percent: tranche.face_percent,
            average_dirr: avg.dirr,
            average_life: avg.average_life,
            rating: rating_for_dirr(avg.dirr)?,
            coupon_rate: *rate,
        });
    }

    Ok(MonteCarloOutput {
        tranches,
        iterations,
        converged,
        num_trials: config.num_trials,
    })
}

/// Search for tranche coupon rates consistent with their simulated risk:
/// repeatedly run `num_trials` randomized waterfalls, average (DIRR, AL) per
/// tranche, map them through the risk-implied yield curve, and take a damped
/// step toward the implied rates until the face-weighted change falls below
/// tolerance.
pub fn run_monte_carlo(
    pool: &mut LoanPool,
    model: &DefaultModel,
    config: &MonteCarloConfig,
) -> AbsResult<ComputationOutput<MonteCarloOutput>> {
    let start = Instant::now();
    let mut warnings: Vec<String> = Vec::new();

    validate_config(config)?;
    let base_seed = config.seed.unwrap_or_else(rand::random);
    let mut securities = build_securities(pool, config)?;

    let output = run_convergence(
        &mut securities,
        config,
        base_seed,
        &mut warnings,
        |securities, seed| simulate_waterfall(pool, securities, model, config.num_trials, seed),
    )?;

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Monte Carlo tranche coupon convergence",
        &serde_json::json!({
            "mode": config.mode.to_string(),
            "num_trials": config.num_trials,
            "tolerance": config.tolerance.to_string(),
            "max_iterations": config.max_iterations,
            "num_tranches": config.tranches.len(),
            "seed": config.seed,
        }),
        warnings,
        elapsed,
        output,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
