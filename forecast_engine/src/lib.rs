//! # Forecast Engine
//!
//! Monthly volume forecasting for noisy transactional data that keeps
//! producing answers when the main statistical engine is slow, crashes, or has
//! too little data to work with.
//!
//! ## Features
//!
//! - Quality gate with strict timestamp parsing, de-duplication and IQR outlier screening
//! - Content fingerprints so unchanged entities reuse their trained model
//! - Deadline-bounded primary attempts, cooperative or raced on a worker thread
//! - Fallback chain: primary (additive or external command) -> regression -> trend
//! - Top-N ranking, dashboard timeline and KPIs per scope
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use forecast_engine::{EngineConfig, ForecastEngine, ForecastRequest, RawRecord, ScopeInput};
//!
//! let records = vec![
//!     RawRecord::new("ACME", "2024-01-15", 100.0),
//!     RawRecord::new("ACME", "2024-02-15", 120.0),
//!     RawRecord::new("ACME", "2024-03-15", 90.0),
//!     RawRecord::new("ACME", "2024-04-15", 130.0),
//! ];
//!
//! let engine = ForecastEngine::new(EngineConfig::default())?;
//! let request = ForecastRequest::new(vec![ScopeInput::new("company", records)], 1, 3);
//! let response = engine.run(&request)?;
//!
//! for row in &response.scopes["company"].timeline {
//!     println!("{} {:?}", row.label, row.values);
//! }
//! # Ok::<(), forecast_engine::ForecastError>(())
//! ```

pub mod aggregate;
pub mod config;
pub mod data;
pub mod decision;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod guard;
pub mod models;
pub mod period;
pub mod quality;
pub mod registry;
pub mod tiers;

// Re-export commonly used types
pub use crate::aggregate::{Kpis, ScopeReport, TimelineRow};
pub use crate::config::{EngineConfig, ExecutionMode, GapPolicy, OutlierPolicy};
pub use crate::data::{EntityKey, EntitySeries, RawRecord, RawValue, ScopeInput, Transaction};
pub use crate::decision::{DecisionEntry, DecisionLog, DecisionReason};
pub use crate::engine::{ForecastEngine, ForecastRequest, ForecastResponse};
pub use crate::error::{ForecastError, Result};
pub use crate::fingerprint::{CacheDecision, Fingerprint, RetrainReason};
pub use crate::guard::{AttemptContext, AttemptOutcome, CrashReason, ExecutionGuard};
pub use crate::models::{
    FittedModel, ForecastPoint, ForecastResult, MethodTag, PrimaryEngine, PrimaryRequest,
};
pub use crate::period::Month;
pub use crate::quality::{QualityGate, RejectReason, RejectionLedger};
pub use crate::registry::{ModelRecord, ModelRegistry};
pub use crate::tiers::TieredForecaster;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
