//! # Series Math
//!
//! Numeric kernels for monthly volume forecasting.
//! This crate provides the least-squares solvers, regressor rows and summary
//! statistics that the forecasting tiers are built from.

use thiserror::Error;

pub mod design;
pub mod least_squares;
pub mod stats;
pub mod trend;

pub use least_squares::{least_squares, weighted_ridge, LeastSquaresFit};
pub use trend::TrendLine;

/// Errors that can occur in numeric calculations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MathError {
    #[error("Insufficient data for calculation: {0}")]
    InsufficientData(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Calculation error: {0}")]
    CalculationError(String),

    #[error("Singular system: {0}")]
    Singular(String),
}

/// Result type for numeric operations
pub type Result<T> = std::result::Result<T, MathError>;
