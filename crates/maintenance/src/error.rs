//! Maintenance Error Types
//!
//! Each variant names the maintenance stream that failed; the cache error
//! that caused it is kept as a child in the `exn` error tree.

use derive_more::{Display, Error};

/// A maintenance error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for maintenance operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("chain regeneration failed")]
    Regenerate,
    #[display("consistency sweep failed")]
    Sweep,
    #[display("scope recovery failed")]
    Recover,
}
