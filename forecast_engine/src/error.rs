//! Error types for the forecast_engine crate

use polars::prelude::PolarsError;
use std::time::Duration;
use thiserror::Error;

/// Custom error types for the forecast_engine crate
#[derive(Debug, Error)]
pub enum ForecastError {
    /// Malformed request; terminal for the whole pass
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The quality gate left nothing to forecast
    #[error("Quality gate rejected all {total} records")]
    AllRejected { total: usize },

    /// Error related to data validation or processing
    #[error("Data error: {0}")]
    DataError(String),

    /// An entity has no usable observations
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// Singular, non-converging or otherwise unusable regression
    #[error("Degenerate fit: {0}")]
    DegenerateFit(String),

    /// Error related to forecasting operations
    #[error("Forecasting error: {0}")]
    ForecastingError(String),

    /// A forecasting engine did not finish within its deadline
    #[error("Engine timed out after {0:?}")]
    EngineTimeout(Duration),

    /// A forecasting engine terminated abnormally
    #[error("Engine crashed: {0}")]
    EngineCrash(String),

    /// An attempt observed its cancellation at a checkpoint
    #[error("Attempt cancelled: {0}")]
    Cancelled(String),

    /// Error from invalid parameters
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Error from mathematical operations
    #[error("Math error: {0}")]
    MathError(#[from] series_math::MathError),

    /// Error from IO operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Error from Polars operations
    #[error("Polars error: {0}")]
    PolarsError(String),

    /// Error from JSON encoding or decoding
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Error while loading configuration
    #[error("Config error: {0}")]
    ConfigError(String),
}

/// Result type with our custom error
pub type Result<T> = std::result::Result<T, ForecastError>;

impl From<PolarsError> for ForecastError {
    fn from(err: PolarsError) -> Self {
        ForecastError::PolarsError(err.to_string())
    }
}

impl From<serde_json::Error> for ForecastError {
    fn from(err: serde_json::Error) -> Self {
        ForecastError::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for ForecastError {
    fn from(err: toml::de::Error) -> Self {
        ForecastError::ConfigError(err.to_string())
    }
}
