//! Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Rejected sibling/parent edges are
//! *not* errors; they're dropped and logged.

use crate::ids::{FileServiceId, MappingScope, TagServiceId};
use derive_more::{Display, Error};

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// A derived cache disagrees with a from-scratch rebuild. The scope is
    /// quarantined and must be regenerated before it accepts mutations again.
    #[display("cache scope {_0} is inconsistent and needs regeneration")]
    Consistency(#[error(not(source))] MappingScope),
    /// A count row would have gone negative or was missing when reduced.
    #[display("tag counts out of step with mappings in {_0}")]
    CountUnderflow(#[error(not(source))] MappingScope),
    #[display("unknown tag service: {_0}")]
    TagServiceNotFound(#[error(not(source))] TagServiceId),
    #[display("unknown file service: {_0}")]
    FileServiceNotFound(#[error(not(source))] FileServiceId),
    /// The combined (virtual) service can't be used where a real one is required.
    #[display("the combined service is not valid here")]
    CombinedService,
    /// A long scan or regeneration was cancelled before committing anything.
    #[display("operation cancelled")]
    Cancelled,
    /// The raw source tables are missing, so nothing can be rebuilt from them.
    #[display("raw source tables missing; full recovery required")]
    NeedsRecovery,
    /// Serialization/deserialization error.
    #[display("invalid cache data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// The collaborator answering file-domain membership questions failed.
    #[display("file domain membership lookup failed")]
    Membership,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database | Self::Cancelled | Self::Membership)
    }

    /// Returns `true` if the scope needs `generate`/`regen` before further use.
    pub fn needs_regeneration(&self) -> bool {
        matches!(self, Self::Consistency(_) | Self::CountUnderflow(_))
    }
}
