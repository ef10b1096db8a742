//! Common error types for the HF time-standard pipeline
//!
//! The taxonomy separates per-minute failures (recorded as X-grade results,
//! never fatal) from provenance threats (version conflicts, archive
//! corruption) that must reach the operator.

use thiserror::Error;

/// Common result type for HFTS operations
pub type Result<T> = std::result::Result<T, Error>;

/// How a caller is expected to react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Data not there yet; try again later
    Retry,
    /// Per-minute failure; record an X-grade result and move on
    RecordAndContinue,
    /// Threatens provenance guarantees; surface to the operator
    Alert,
}

/// Error types shared by all HFTS stages
#[derive(Error, Debug)]
pub enum Error {
    /// Requested range not yet present
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    /// No usable signal in a minute
    #[error("Detection failure: {0}")]
    DetectionFailure(String),

    /// No plausible propagation mode for the observed geometry
    #[error("Unphysical solution: {0}")]
    UnphysicalSolution(String),

    /// Two writers targeted the same (channel, version) series
    #[error("Version conflict: {0}")]
    VersionConflict(String),

    /// Integrity check failed while reading archived samples
    #[error("Archive corruption: {0}")]
    ArchiveCorruption(String),

    /// Attempt to overwrite an already sealed archive segment
    #[error("Archive segment already exists: {0}")]
    ArchiveImmutable(String),

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON encoding/decoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify the error for propagation policy
    pub fn severity(&self) -> Severity {
        match self {
            Error::DataUnavailable(_) => Severity::Retry,
            Error::DetectionFailure(_) | Error::UnphysicalSolution(_) => {
                Severity::RecordAndContinue
            }
            Error::VersionConflict(_)
            | Error::ArchiveCorruption(_)
            | Error::ArchiveImmutable(_) => Severity::Alert,
            Error::Io(_)
            | Error::Database(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::InvalidInput(_)
            | Error::Internal(_) => Severity::Alert,
        }
    }

    /// True when the failure only affects a single minute's result
    pub fn is_per_minute(&self) -> bool {
        self.severity() == Severity::RecordAndContinue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_minute_failures_do_not_alert() {
        assert_eq!(
            Error::DetectionFailure("no tone".into()).severity(),
            Severity::RecordAndContinue
        );
        assert_eq!(
            Error::UnphysicalSolution("9000 km".into()).severity(),
            Severity::RecordAndContinue
        );
        assert!(Error::DetectionFailure("x".into()).is_per_minute());
    }

    #[test]
    fn test_provenance_failures_alert() {
        assert_eq!(
            Error::VersionConflict("v1".into()).severity(),
            Severity::Alert
        );
        assert_eq!(
            Error::ArchiveCorruption("digest".into()).severity(),
            Severity::Alert
        );
        assert_eq!(
            Error::DataUnavailable("later".into()).severity(),
            Severity::Retry
        );
    }
}
