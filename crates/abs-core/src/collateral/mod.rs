//! Collateral side of the structure: individual amortizing loans, the assets
//! securing them, the default model, and pool-level aggregation.

pub mod asset;
pub mod default_model;
pub mod loan;
pub mod pool;

pub use asset::Asset;
pub use default_model::{DefaultModel, HazardTable};
pub use loan::{Loan, MortgageInsurance, RateSource};
pub use pool::{LoanPool, LoanSnapshot};
