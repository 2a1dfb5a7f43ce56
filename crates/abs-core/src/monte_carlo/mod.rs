//! Monte Carlo outer loop: randomized waterfall trials, averaged risk
//! metrics, and the damped fixed-point search for tranche coupons.

pub mod convergence;

#[cfg(feature = "parallel")]
pub mod parallel;

pub use convergence::{
    run_monte_carlo, simulate_waterfall, MonteCarloConfig, MonteCarloOutput, TrancheAverages,
    TrancheConfig, TrancheConvergence,
};

#[cfg(feature = "parallel")]
pub use parallel::{run_monte_carlo_parallel, simulate_waterfall_parallel};
