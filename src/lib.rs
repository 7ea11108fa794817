//! # Volume Forecast
//!
//! Workspace root re-exporting the member crates:
//!
//! - [`series_math`]: least squares, regressor rows and summary statistics
//! - [`forecast_engine`]: quality gate, model cache, bounded execution and
//!   the tiered forecaster
//!
//! ```
//! use volume_forecast_workspace::forecast_engine::Month;
//!
//! let month = Month::new(2024, 1).unwrap();
//! assert_eq!(month.label(), "Jan 2024");
//! ```

pub use forecast_engine;
pub use series_math;
