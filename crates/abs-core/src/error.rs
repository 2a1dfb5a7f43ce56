use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AbsError {
    #[error("Invalid input: {field} — {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Invalid configuration: {field} — {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Convergence failure: {function} did not converge after {iterations} iterations (delta: {last_delta})")]
    ConvergenceFailure {
        function: String,
        iterations: u32,
        last_delta: Decimal,
    },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Division by zero in {context}")]
    DivisionByZero { context: String },

    #[error("Rating out of range: {dirr_bps} basis points of rate degradation exceeds the rating table")]
    RatingOutOfRange { dirr_bps: Decimal },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for AbsError {
    fn from(e: serde_json::Error) -> Self {
        AbsError::SerializationError(e.to_string())
    }
}
