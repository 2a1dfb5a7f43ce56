//! Parallel trial fan-out. Trials are split into contiguous near-equal
//! ranges, one per worker; every worker runs on its own private copies of
//! the pool and the structure, and the per-tranche sums are reduced through
//! a counted join. Because each trial derives its RNG from the global trial
//! index, the result is identical to the sequential runner for any worker
//! count.

use std::ops::Range;
use std::time::Instant;

use rayon::prelude::*;
use rust_decimal::Decimal;

use crate::collateral::default_model::DefaultModel;
use crate::collateral::pool::LoanPool;
use crate::error::AbsError;
use crate::liabilities::structure::StructuredSecurities;
use crate::monte_carlo::convergence::{
    accumulate_trials, averages_from_sums, build_securities, run_convergence, validate_config,
    MonteCarloConfig, MonteCarloOutput, TrancheAverages,
};
use crate::types::{with_metadata, ComputationOutput, Money, Periods};
use crate::AbsResult;

/// Split trial indices into contiguous, near-equal ranges, one per worker.
fn split_trials(num_trials: u32, num_workers: usize) -> Vec<Range<u32>> {
    let workers = (num_workers.max(1) as u32).min(num_trials.max(1));
    let base = num_trials / workers;
    let remainder = num_trials % workers;
    let mut ranges = Vec::with_capacity(workers as usize);
    let mut start = 0u32;
    for i in 0..workers {
        let len = base + u32::from(i < remainder);
        if len == 0 {
            continue;
        }
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

/// Run `num_trials` randomized waterfall trials across `num_workers`
/// independent workers and average the per-tranche (DIRR, AL) metrics. A
/// failure in any worker fails the whole batch.
pub fn simulate_waterfall_parallel(
    pool: &LoanPool,
    securities: &StructuredSecurities,
    model: &DefaultModel,
    num_trials: u32,
    base_seed: u64,
    num_workers: usize,
) -> AbsResult<Vec<TrancheAverages>> {
    if num_trials == 0 {
        return Err(AbsError::InvalidInput {
            field: "num_trials".into(),
            reason: "At least one trial is required".into(),
        });
    }
    if num_workers == 0 {
        return Err(AbsError::InvalidConfiguration {
            field: "num_workers".into(),
            reason: "At least one worker is required".into(),
        });
    }

    // Every worker owns a private copy of the pool and the structure, reset
    // to period 0 at the start of each trial.
    let workers: Vec<(Range<u32>, LoanPool, StructuredSecurities)> =
        split_trials(num_trials, num_workers)
            .into_iter()
            .map(|range| (range, pool.clone(), securities.clone()))
            .collect();

    let partials: Vec<Vec<(Money, Periods)>> = workers
        .into_par_iter()
        .map(|(range, mut pool, mut securities)| {
            accumulate_trials(&mut pool, &mut securities, model, range, base_seed)
        })
        .collect::<AbsResult<Vec<_>>>()?;

    let mut sums = vec![(Decimal::ZERO, Decimal::ZERO); securities.tranches().len()];
    for partial in partials {
        for (sum, p) in sums.iter_mut().zip(partial) {
            sum.0 += p.0;
            sum.1 += p.1;
        }
    }
    Ok(averages_from_sums(sums, num_trials))
}

/// The Monte Carlo coupon search of
/// [`run_monte_carlo`](crate::monte_carlo::run_monte_carlo), with each
/// iteration's trial batch fanned out across `num_workers` workers.
pub fn run_monte_carlo_parallel(
    pool: &LoanPool,
    model: &DefaultModel,
    config: &MonteCarloConfig,
    num_workers: usize,
) -> AbsResult<ComputationOutput<MonteCarloOutput>> {
    let start = Instant::now();
    let mut warnings: Vec<String> = Vec::new();

    validate_config(config)?;
    if num_workers == 0 {
        return Err(AbsError::InvalidConfiguration {
            field: "num_workers".into(),
            reason: "At least one worker is required".into(),
        });
    }
    let base_seed = config.seed.unwrap_or_else(rand::random);
    let mut securities = build_securities(pool, config)?;

    let output = run_convergence(
        &mut securities,
        config,
        base_seed,
        &mut warnings,
        |securities, seed| {
            simulate_waterfall_parallel(pool, securities, model, config.num_trials, seed, num_workers)
        },
    )?;

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Monte Carlo tranche coupon convergence (parallel fan-out)",
        &serde_json::json!({
            "mode": config.mode.to_string(),
            "num_trials": config.num_trials,
            "tolerance": config.tolerance.to_string(),
            "max_iterations": config.max_iterations,
            "num_tranches": config.tranches.len(),
            "num_workers": num_workers,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collateral::asset::Asset;
    use crate::collateral::default_model::HazardTable;
    use crate::collateral::loan::{Loan, RateSource};
    use crate::liabilities::structure::PayMode;
    use crate::monte_carlo::convergence::{run_monte_carlo, simulate_waterfall, TrancheConfig};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    /// Regrouped Decimal sums may differ in the last ulp; compare tightly.
    fn assert_close(a: Decimal, b: Decimal) {
        assert!((a - b).abs() < dec!(0.0000000000000001), "{a} != {b}");
    }

    fn test_pool() -> LoanPool {
        let loans = (0..4)
            .map(|_| {
                let asset = Asset::new(dec!(3000), dec!(0.1)).unwrap();
                Loan::new(24, RateSource::fixed(dec!(0.1)), dec!(1500), asset).unwrap()
            })
            .collect();
        LoanPool::new(loans).unwrap()
    }

    fn two_tranche_config() -> MonteCarloConfig {
        MonteCarloConfig {
            tranches: vec![
                TrancheConfig {
                    face_percent: dec!(0.8),
                    initial_rate: dec!(0.05),
                    subordination: 0,
                    coefficient: dec!(1.2),
                },
                TrancheConfig {
                    face_percent: dec!(0.2),
                    initial_rate: dec!(0.08),
                    subordination: 1,
                    coefficient: dec!(0.8),
                },
            ],
            mode: PayMode::Sequential,
            tolerance: dec!(0.005),
            num_trials: 12,
            max_iterations: 40,
            seed: Some(42),
        }
    }

    #[test]
    fn test_split_trials_covers_all_indices() {
        let ranges = split_trials(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        let total: u32 = ranges.iter().map(|r| r.end - r.start).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_split_trials_more_workers_than_trials() {
        let ranges = split_trials(2, 8);
        assert_eq!(ranges, vec![0..1, 1..2]);
    }

    #[test]
    fn test_parallel_matches_sequential_for_fixed_seed() {
        let model = DefaultModel::new(HazardTable::seasoned());
        let config = two_tranche_config();

        let mut pool = test_pool();
        let mut securities = build_securities(&pool, &config).unwrap();
        let sequential =
            simulate_waterfall(&mut pool, &mut securities, &model, 12, 42).unwrap();

        let pool = test_pool();
        let securities = build_securities(&pool, &config).unwrap();
        let parallel =
            simulate_waterfall_parallel(&pool, &securities, &model, 12, 42, 4).unwrap();

        for (s, p) in sequential.iter().zip(&parallel) {
            assert_close(s.dirr, p.dirr);
            assert_close(s.average_life, p.average_life);
        }
    }

    #[test]
    fn test_partition_count_does_not_change_result() {
        let model = DefaultModel::new(HazardTable::seasoned());
        let config = two_tranche_config();
        let pool = test_pool();
        let securities = build_securities(&pool, &config).unwrap();

        let one = simulate_waterfall_parallel(&pool, &securities, &model, 12, 7, 1).unwrap();
        let four = simulate_waterfall_parallel(&pool, &securities, &model, 12, 7, 4).unwrap();
        let many = simulate_waterfall_parallel(&pool, &securities, &model, 12, 7, 64).unwrap();

        for (a, b) in one.iter().zip(&four).chain(one.iter().zip(&many)) {
            assert_close(a.dirr, b.dirr);
            assert_close(a.average_life, b.average_life);
        }
    }

    #[test]
    fn test_run_monte_carlo_parallel_matches_sequential() {
        let model = DefaultModel::new(HazardTable::seasoned());
        let config = two_tranche_config();

        let sequential = run_monte_carlo(&mut test_pool(), &model, &config).unwrap();
        let parallel =
            run_monte_carlo_parallel(&test_pool(), &model, &config, 4).unwrap();

        assert_eq!(sequential.result.iterations, parallel.result.iterations);
        assert_eq!(sequential.result.converged, parallel.result.converged);
        for (s, p) in sequential.result.tranches.iter().zip(&parallel.result.tranches) {
            assert_eq!(s.rating, p.rating);
            assert_close(s.average_dirr, p.average_dirr);
            assert_close(s.average_life, p.average_life);
            assert_close(s.coupon_rate, p.coupon_rate);
        }
    }

    #[test]
    fn test_zero_workers_rejected() {
        let model = DefaultModel::new(HazardTable::none());
        let config = two_tranche_config();
        let pool = test_pool();
        let securities = build_securities(&pool, &config).unwrap();
        assert!(
            simulate_waterfall_parallel(&pool, &securities, &model, 10, 1, 0).is_err()
        );
        assert!(run_monte_carlo_parallel(&pool, &model, &config, 0).is_err());
    }
}
