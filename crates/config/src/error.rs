//! Configuration Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;
use tagmap_cache::error::{Error as CacheError, ErrorKind as CacheErrorKind};

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// An explicitly requested configuration file doesn't exist.
    #[display("configuration file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    #[display("unsupported configuration format: {}", _0.display())]
    UnsupportedFormat(#[error(not(source))] PathBuf),
    /// The merged configuration doesn't deserialize.
    #[display("invalid configuration")]
    Invalid,
    /// No database path was configured and the platform has no data directory.
    #[display("no data directory available for the cache database")]
    NoDataDirectory,
    /// The configured services don't form a valid registry.
    #[display("invalid service configuration: {_0}")]
    Services(CacheErrorKind),
}

impl ErrorKind {
    /// Convert a cache error into a configuration error, keeping the cache
    /// crate's `Exn` frame as a child in the error tree.
    #[track_caller]
    pub fn services(err: CacheError) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Services(inner))
    }
}
