//! Rolling trend line over irregularly spaced observations
//!
//! Keeps the most recent `period` (x, y) pairs and fits an ordinary
//! least-squares line through them. Used for short-range extrapolation when
//! there is too little data for anything richer.

use crate::{MathError, Result};
use std::collections::VecDeque;

/// Least-squares trend line over a sliding window of points
#[derive(Debug, Clone)]
pub struct TrendLine {
    period: usize,
    points: VecDeque<(f64, f64)>,
    slope: Option<f64>,
    intercept: Option<f64>,
}

impl TrendLine {
    /// Create a new trend line that remembers the last `period` points
    pub fn new(period: usize) -> Result<Self> {
        if period < 1 {
            return Err(MathError::InvalidInput(
                "Period must be at least 1 for a trend line".to_string(),
            ));
        }

        Ok(Self {
            period,
            points: VecDeque::with_capacity(period),
            slope: None,
            intercept: None,
        })
    }

    /// Build a trend line from the tail of a point sequence
    pub fn from_points(period: usize, points: &[(f64, f64)]) -> Result<Self> {
        let mut line = Self::new(period)?;
        for &(x, y) in points {
            line.update(x, y)?;
        }
        Ok(line)
    }

    /// Add an observation at position `x`
    pub fn update(&mut self, x: f64, y: f64) -> Result<()> {
        if !x.is_finite() || !y.is_finite() {
            return Err(MathError::InvalidInput(format!(
                "Trend observations must be finite, got ({}, {})",
                x, y
            )));
        }

        self.points.push_back((x, y));

        if self.points.len() > self.period {
            self.points.pop_front();
        }

        if self.points.len() >= 2 {
            self.calculate_regression()?;
        } else {
            // A single point is a flat line through itself
            self.slope = Some(0.0);
            self.intercept = Some(y);
        }

        Ok(())
    }

    fn calculate_regression(&mut self) -> Result<()> {
        let n = self.points.len() as f64;

        let x_mean = self.points.iter().map(|(x, _)| x).sum::<f64>() / n;
        let y_mean = self.points.iter().map(|(_, y)| y).sum::<f64>() / n;

        let mut numerator = 0.0;
        let mut denominator = 0.0;

        for &(x, y) in &self.points {
            numerator += (x - x_mean) * (y - y_mean);
            denominator += (x - x_mean) * (x - x_mean);
        }

        if denominator.abs() < 1e-10 {
            return Err(MathError::CalculationError(
                "Cannot calculate slope: x values are too similar".to_string(),
            ));
        }

        let slope = numerator / denominator;
        self.slope = Some(slope);
        self.intercept = Some(y_mean - slope * x_mean);

        Ok(())
    }

    /// Evaluate the line at position `x`
    pub fn value_at(&self, x: f64) -> Result<f64> {
        match (self.slope, self.intercept) {
            (Some(slope), Some(intercept)) => Ok(slope * x + intercept),
            _ => Err(MathError::InsufficientData(
                "Trend line has no observations".to_string(),
            )),
        }
    }

    /// Get the current slope
    pub fn slope(&self) -> Result<f64> {
        self.slope.ok_or_else(|| {
            MathError::InsufficientData("Not enough data to calculate slope".to_string())
        })
    }

    /// Get the current intercept
    pub fn intercept(&self) -> Result<f64> {
        self.intercept.ok_or_else(|| {
            MathError::InsufficientData("Not enough data to calculate intercept".to_string())
        })
    }

    /// Position of the most recent observation
    pub fn last_x(&self) -> Option<f64> {
        self.points.back().map(|(x, _)| *x)
    }

    /// Number of observations currently in the window
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the window is empty
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Get the window size
    pub fn period(&self) -> usize {
        self.period
    }
}
