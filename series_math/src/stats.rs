//! Descriptive statistics used by cleaning and forecasting

use crate::{MathError, Result};
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::statistics::{Data, OrderStatistics};

/// Arithmetic mean, `None` for an empty slice
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population variance, `None` for an empty slice
pub fn variance(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    Some(values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64)
}

/// Residual standard deviation with `n - params` degrees of freedom.
///
/// Returns 0.0 when `n <= params`.
pub fn residual_std(residuals: &[f64], params: usize) -> f64 {
    if residuals.len() <= params {
        return 0.0;
    }
    let ss: f64 = residuals.iter().map(|r| r * r).sum();
    (ss / (residuals.len() - params) as f64).sqrt()
}

/// Lower and upper quartiles of the finite values
pub fn quartiles(values: &[f64]) -> Option<(f64, f64)> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    let mut data = Data::new(finite);
    Some((data.lower_quartile(), data.upper_quartile()))
}

/// Median of the finite values
pub fn median(values: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    let mut data = Data::new(finite);
    Some(data.median())
}

/// Normal-consistent median absolute deviation, `1.4826 * MAD`
pub fn robust_scale(values: &[f64]) -> Option<f64> {
    let center = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&deviations).map(|mad| 1.4826 * mad)
}

/// Tukey fences `[Q1 - k * IQR, Q3 + k * IQR]`.
///
/// Needs at least `min_len` finite values; below that there is not enough
/// data to call anything an outlier.
pub fn iqr_fences(values: &[f64], k: f64, min_len: usize) -> Option<(f64, f64)> {
    let count = values.iter().filter(|v| v.is_finite()).count();
    if count < min_len.max(1) {
        return None;
    }
    let (q1, q3) = quartiles(values)?;
    let iqr = q3 - q1;
    Some((q1 - k * iqr, q3 + k * iqr))
}

/// Mean absolute percentage error in percent.
///
/// Pairs with a zero actual value are skipped; `None` if nothing is left.
pub fn mape(actual: &[f64], fitted: &[f64]) -> Option<f64> {
    let errors: Vec<f64> = actual
        .iter()
        .zip(fitted.iter())
        .filter(|(a, f)| **a != 0.0 && a.is_finite() && f.is_finite())
        .map(|(a, f)| ((a - f) / a).abs())
        .collect();

    mean(&errors).map(|m| m * 100.0)
}

/// Two-sided standard normal critical value for a confidence level in (0, 1)
pub fn z_for_confidence(level: f64) -> Result<f64> {
    if !(level > 0.0 && level < 1.0) {
        return Err(MathError::InvalidInput(format!(
            "Confidence level must be between 0 and 1, got {}",
            level
        )));
    }

    let normal =
        Normal::new(0.0, 1.0).map_err(|e| MathError::CalculationError(e.to_string()))?;
    Ok(normal.inverse_cdf(0.5 + level / 2.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_mean_and_variance() {
        let v = [2.0, 4.0, 6.0];
        assert_eq!(mean(&v), Some(4.0));
        assert_abs_diff_eq!(variance(&v).unwrap(), 8.0 / 3.0, epsilon = 1e-12);
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_residual_std_degrees_of_freedom() {
        assert_eq!(residual_std(&[1.0, -1.0], 2), 0.0);
        assert_abs_diff_eq!(
            residual_std(&[1.0, -1.0, 1.0, -1.0], 2),
            2.0_f64.sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_median_and_robust_scale() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[f64::NAN]), None);
        // deviations from 2.5 are [1.5, 0.5, 0.5, 97.5] -> MAD 1.0
        assert_abs_diff_eq!(
            robust_scale(&[1.0, 2.0, 3.0, 100.0]).unwrap(),
            1.4826 * 1.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_fences_flag_extreme_value() {
        let values = [10.0, 11.0, 12.0, 11.0, 10.0, 12.0, 500.0];
        let (lo, hi) = iqr_fences(&values, 3.0, 4).unwrap();
        assert!(lo < 10.0);
        assert!(hi < 500.0);
    }

    #[test]
    fn test_fences_need_enough_data() {
        assert!(iqr_fences(&[1.0, 2.0, 3.0], 3.0, 4).is_none());
    }

    #[test]
    fn test_mape_skips_zero_actuals() {
        let m = mape(&[100.0, 0.0, 200.0], &[110.0, 5.0, 180.0]).unwrap();
        assert_abs_diff_eq!(m, 10.0, epsilon = 1e-9);
        assert!(mape(&[0.0], &[1.0]).is_none());
    }

    #[test]
    fn test_z_values() {
        assert_abs_diff_eq!(z_for_confidence(0.95).unwrap(), 1.959964, epsilon = 1e-4);
        assert_abs_diff_eq!(z_for_confidence(0.80).unwrap(), 1.281552, epsilon = 1e-4);
        assert!(z_for_confidence(1.0).is_err());
    }
}
