//! Engine configuration
//!
//! Every knob has a default, so an empty TOML document is a valid
//! configuration. Values are validated once when the engine is built.

use crate::error::{ForecastError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the execution guard enforces its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run on the calling thread; the callee observes the deadline at checkpoints
    Cooperative,
    /// Race a supervised worker thread against the deadline
    #[default]
    WorkerRace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Wall-clock budget for one primary attempt, in milliseconds
    pub deadline_ms: u64,
    pub mode: ExecutionMode,
    /// Parent directory for attempt scratch directories; system temp when unset
    pub scratch_root: Option<PathBuf>,
    /// How often a waiting attempt polls its child process
    pub poll_interval_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 60_000,
            mode: ExecutionMode::default(),
            scratch_root: None,
            poll_interval_ms: 10,
        }
    }
}

impl GuardConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Usable points needed before the primary engine is attempted
    pub primary_min_points: usize,
    /// Usable points needed for a quadratic secondary trend
    pub quadratic_min_points: usize,
    /// Usable points needed for seasonal terms
    pub seasonal_min_points: usize,
    /// Width of the forecast band, in (0, 1)
    pub confidence_level: f64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            primary_min_points: 2,
            quadratic_min_points: 6,
            seasonal_min_points: 12,
            confidence_level: 0.8,
        }
    }
}

/// Tuning for the built-in additive primary engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdditiveConfig {
    pub max_iterations: usize,
    /// Huber threshold in robust standard deviations
    pub huber_k: f64,
    /// Ridge penalty on every coefficient
    pub ridge: f64,
    /// Relative coefficient change that ends the reweighting loop
    pub tolerance: f64,
}

impl Default for AdditiveConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            huber_k: 1.345,
            ridge: 1e-6,
            tolerance: 1e-8,
        }
    }
}

/// Which primary engine the tiered forecaster attempts first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrimaryConfig {
    Additive(AdditiveConfig),
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        PrimaryConfig::Additive(AdditiveConfig::default())
    }
}

/// What the quality gate does with statistical outliers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierPolicy {
    Drop,
    Cap,
    #[default]
    KeepAndFlag,
}

/// How months without records are represented in an entity series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    #[default]
    Zero,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub outlier_policy: OutlierPolicy,
    /// IQR multiplier for the outlier fences
    pub outlier_iqr_multiplier: f64,
    /// Records an entity needs before outliers are looked for
    pub outlier_min_records: usize,
    pub gap_policy: GapPolicy,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            outlier_policy: OutlierPolicy::default(),
            outlier_iqr_multiplier: 3.0,
            outlier_min_records: 4,
            gap_policy: GapPolicy::default(),
        }
    }
}

/// Metric the aggregator ranks entities by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingMetric {
    #[default]
    TrailingTotal,
    ForecastTotal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    pub ranking: RankingMetric,
    /// Trailing months summed by [`RankingMetric::TrailingTotal`]
    pub ranking_window: usize,
    /// Historical months shown ahead of the forecast in the timeline
    pub history_months: usize,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            ranking: RankingMetric::default(),
            ranking_window: 6,
            history_months: 12,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Entities forecast concurrently; 1 runs sequentially
    pub workers: usize,
    pub default_top_n: usize,
    pub default_horizon: usize,
    pub guard: GuardConfig,
    pub tiers: TierConfig,
    pub primary: PrimaryConfig,
    pub quality: QualityConfig,
    pub aggregate: AggregateConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            default_top_n: 5,
            default_horizon: 6,
            guard: GuardConfig::default(),
            tiers: TierConfig::default(),
            primary: PrimaryConfig::default(),
            quality: QualityConfig::default(),
            aggregate: AggregateConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            ForecastError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ForecastError::InvalidParameter(
                "workers must be at least 1".to_string(),
            ));
        }

        if self.default_top_n == 0 || self.default_horizon == 0 {
            return Err(ForecastError::InvalidParameter(
                "default_top_n and default_horizon must be positive".to_string(),
            ));
        }

        let level = self.tiers.confidence_level;
        if !(level > 0.0 && level < 1.0) {
            return Err(ForecastError::InvalidParameter(format!(
                "confidence_level must be between 0 and 1, got {}",
                level
            )));
        }

        if self.tiers.primary_min_points == 0 {
            return Err(ForecastError::InvalidParameter(
                "primary_min_points must be at least 1".to_string(),
            ));
        }

        if self.tiers.quadratic_min_points < 3 {
            return Err(ForecastError::InvalidParameter(
                "quadratic_min_points must be at least 3".to_string(),
            ));
        }

        let k = self.quality.outlier_iqr_multiplier;
        if !(k.is_finite() && k > 0.0) {
            return Err(ForecastError::InvalidParameter(format!(
                "outlier_iqr_multiplier must be positive, got {}",
                k
            )));
        }

        if self.aggregate.ranking_window == 0 {
            return Err(ForecastError::InvalidParameter(
                "ranking_window must be at least 1".to_string(),
            ));
        }

        if let PrimaryConfig::Additive(additive) = &self.primary {
            if additive.max_iterations == 0 {
                return Err(ForecastError::InvalidParameter(
                    "max_iterations must be at least 1".to_string(),
                ));
            }
            if !(additive.huber_k > 0.0 && additive.ridge >= 0.0 && additive.tolerance > 0.0) {
                return Err(ForecastError::InvalidParameter(
                    "huber_k and tolerance must be positive, ridge non-negative".to_string(),
                ));
            }
        }

        if let PrimaryConfig::Command { program, .. } = &self.primary {
            if program.as_os_str().is_empty() {
                return Err(ForecastError::InvalidParameter(
                    "command engine needs a program".to_string(),
                ));
            }
        }

        Ok(())
    }
}
