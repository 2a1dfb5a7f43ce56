pub mod collateral;
pub mod error;
pub mod liabilities;
pub mod metrics;
pub mod monte_carlo;
pub mod types;
pub mod waterfall;

pub use error::AbsError;
pub use types::*;

/// Standard result type for all abs-core operations
pub type AbsResult<T> = Result<T, AbsError>;
