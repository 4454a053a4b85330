//! Error types for the RearView tracking core.

use thiserror::Error;

use crate::track::TrackId;

/// Errors raised by the recursive filters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    /// A measurement or model does not have the configured dimensionality
    #[error("Invalid dimension for {context}: expected {expected}, got {actual}")]
    InvalidDimension {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// H·P·Hᵀ + R could not be factorised
    #[error("Innovation covariance is singular")]
    SingularInnovationCovariance,

    /// A runtime argument is out of range (negative dt, NaN measurement, ...)
    #[error("Invalid filter parameter: {0}")]
    InvalidParameter(String),
}

impl FilterError {
    /// Creates a dimension mismatch error.
    pub fn dimension(context: &'static str, expected: usize, actual: usize) -> Self {
        Self::InvalidDimension {
            context,
            expected,
            actual,
        }
    }
}

/// Configuration rejected at construction time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Sample interval must be positive and finite, got {0}")]
    NonPositiveSampleInterval(f64),

    #[error("Gate half-width {name} must be non-negative and finite, got {value}")]
    InvalidGate { name: &'static str, value: f64 },

    #[error("Maximum consecutive misses must be at least 1")]
    ZeroMissLimit,

    #[error("Confirmation needs at least 2 hits, got {0}")]
    ConfirmHitsTooLow(u32),

    #[error("Fading factor alpha must be >= 1, got {0}")]
    InvalidAlpha(f64),

    #[error("Merge threshold must be non-negative and finite, got {0}")]
    InvalidMergeDistance(f64),

    #[error("Noise parameter {name} must be positive and finite, got {value}")]
    InvalidNoise { name: &'static str, value: f64 },

    #[error("{model} motion model needs a state dimension of {expected}, got {actual}")]
    StateDimension {
        model: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{space} measurements need a measurement dimension of {expected}, got {actual}")]
    MeasurementDimension {
        space: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{filter} filter cannot observe {space} measurements")]
    UnsupportedMeasurementSpace {
        filter: &'static str,
        space: &'static str,
    },

    #[error("Malformed configuration: {0}")]
    Malformed(String),
}

/// Errors from the detection containers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectionError {
    /// A detection was pushed into the list of another cycle
    #[error("Detection belongs to MCC {actual}, list holds MCC {expected}")]
    CycleMismatch { expected: u64, actual: u64 },

    #[error("Detection field {0} is not finite")]
    NonFinite(&'static str),

    #[error("Sample interval must be positive, got {0}")]
    InvalidSampleInterval(f64),
}

/// Errors surfaced by the track manager.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackingError {
    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error("Cycle timestamp {current} does not follow previous timestamp {previous}")]
    NonMonotonicTimestamp { previous: f64, current: f64 },

    #[error("Cycle MCC {current} does not follow previous MCC {previous}")]
    NonMonotonicCycle { previous: u64, current: u64 },

    #[error("Track not found: {0}")]
    TrackNotFound(TrackId),
}
