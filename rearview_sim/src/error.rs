//! Error types for the simulation harness.

use rearview_core::{ConfigError, DetectionError, TrackingError};
use thiserror::Error;

/// Errors that can occur while setting up or running a scenario.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    /// A noise standard deviation was rejected by the distribution
    #[error("Invalid noise model: {0}")]
    Noise(#[from] rand_distr::NormalError),

    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Reading a configuration file failed
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl SimError {
    /// Creates an unknown-scenario error.
    pub fn unknown_scenario(name: impl Into<String>) -> Self {
        Self::UnknownScenario(name.into())
    }
}
