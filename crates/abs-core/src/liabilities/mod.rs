//! Liability side of the structure: ranked debt tranches and the
//! interest-then-principal allocation protocol that services them.

pub mod structure;
pub mod tranche;

pub use structure::{PayMode, StructuredSecurities, TrancheSnapshot};
pub use tranche::{PaymentStatus, Tranche};
