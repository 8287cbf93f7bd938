//! Error type shared by every inversion component.

use thiserror::Error;

/// Errors raised while building or running an inversion.
///
/// Construction errors report the violated condition and the offending
/// value. Numeric errors raised mid-run (non-finite energy, negative
/// entropy) indicate a defect in the inputs and are never retried.
#[derive(Debug, Error)]
pub enum InversionError {
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("initial solution has a negative or non-finite value at index {index}: {value}")]
    InvalidInitialValue { index: usize, value: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid constraint range `{name}`: rows {start}..{end}")]
    InvalidRange {
        name: String,
        start: usize,
        end: usize,
    },

    #[error("missing required input: {0}")]
    MissingInput(&'static str),

    #[error("energy from {component} is not finite: {value}")]
    NonFiniteEnergy { component: &'static str, value: f64 },

    #[error("total entropy is negative: {0}")]
    NegativeEntropy(f64),

    #[error("replica {replica} failed: {source}")]
    Replica {
        replica: usize,
        #[source]
        source: Box<InversionError>,
    },

    #[error("replica {replica} panicked: {message}")]
    ReplicaPanic { replica: usize, message: String },

    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reweighting failed: {0}")]
    Reweight(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, InversionError>;

/// Fails with [`InversionError::DimensionMismatch`] unless `actual == expected`.
pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(InversionError::DimensionMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_len() {
        assert!(check_len("d", 3, 3).is_ok());
        let err = check_len("d", 3, 4).unwrap_err();
        assert!(err.to_string().contains("expected 3, got 4"));
    }

    #[test]
    fn test_replica_error_has_source() {
        let err = InversionError::Replica {
            replica: 2,
            source: Box::new(InversionError::NegativeEntropy(-1.0)),
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().starts_with("replica 2 failed"));
    }
}
