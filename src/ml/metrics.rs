use serde::Serialize;

pub fn mean_squared_error(y_true: &[f64], y_pred: &[f64]) -> f64 {
    y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum::<f64>()
        / y_true.len() as f64
}

pub fn mean_absolute_error(y_true: &[f64], y_pred: &[f64]) -> f64 {
    y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).abs())
        .sum::<f64>()
        / y_true.len() as f64
}

/// Coefficient of determination. A constant target scores 0.0.
pub fn r2_score(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let mean = y_true.iter().sum::<f64>() / y_true.len() as f64;
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();
    let ss_res: f64 = y_true.iter().zip(y_pred).map(|(t, p)| (t - p).powi(2)).sum();
    if ss_tot == 0.0 {
        return 0.0;
    }
    1.0 - ss_res / ss_tot
}

/// Population standard deviation of the residuals.
pub fn residual_std(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let residuals: Vec<f64> = y_true.iter().zip(y_pred).map(|(t, p)| t - p).collect();
    let n = residuals.len() as f64;
    let mean = residuals.iter().sum::<f64>() / n;
    (residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Mean of the non-NaN entries, NaN when there are none.
pub fn nan_mean(values: &[f64]) -> f64 {
    let valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        f64::NAN
    } else {
        valid.iter().sum::<f64>() / valid.len() as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegressionMetrics {
    pub mse: f64,
    pub mae: f64,
    pub r2: f64,
    pub std_error: f64,
}

impl RegressionMetrics {
    pub fn compute(y_true: &[f64], y_pred: &[f64]) -> Self {
        Self {
            mse: mean_squared_error(y_true, y_pred),
            mae: mean_absolute_error(y_true, y_pred),
            r2: r2_score(y_true, y_pred),
            std_error: residual_std(y_true, y_pred),
        }
    }

    pub fn nan() -> Self {
        Self {
            mse: f64::NAN,
            mae: f64::NAN,
            r2: f64::NAN,
            std_error: f64::NAN,
        }
    }

    /// NaN-aware average over folds.
    pub fn mean_of(folds: &[RegressionMetrics]) -> Self {
        let pick = |f: fn(&RegressionMetrics) -> f64| nan_mean(&folds.iter().map(f).collect::<Vec<_>>());
        Self {
            mse: pick(|m| m.mse),
            mae: pick(|m| m.mae),
            r2: pick(|m| m.r2),
            std_error: pick(|m| m.std_error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_basic_metrics() {
        let y = [3.0, -0.5, 2.0, 7.0];
        let p = [2.5, 0.0, 2.0, 8.0];
        assert_relative_eq!(mean_squared_error(&y, &p), 0.375);
        assert_relative_eq!(mean_absolute_error(&y, &p), 0.5);
        assert_relative_eq!(r2_score(&y, &p), 0.9486081370449679, epsilon = 1e-12);
    }

    #[test]
    fn test_r2_constant_target() {
        assert_eq!(r2_score(&[1.0, 1.0], &[0.0, 2.0]), 0.0);
    }

    #[test]
    fn test_residual_std_ignores_bias() {
        let y = [1.0, 2.0, 3.0];
        let p = [0.0, 1.0, 2.0];
        assert_relative_eq!(residual_std(&y, &p), 0.0);
    }

    #[test]
    fn test_mean_of_skips_failed_folds() {
        let folds = [
            RegressionMetrics {
                mse: 1.0,
                mae: 1.0,
                r2: 0.5,
                std_error: 1.0,
            },
            RegressionMetrics::nan(),
            RegressionMetrics {
                mse: 3.0,
                mae: 2.0,
                r2: 0.7,
                std_error: 2.0,
            },
        ];
        let avg = RegressionMetrics::mean_of(&folds);
        assert_relative_eq!(avg.mse, 2.0);
        assert_relative_eq!(avg.r2, 0.6, epsilon = 1e-12);
        assert!(RegressionMetrics::mean_of(&[RegressionMetrics::nan()]).mse.is_nan());
    }
}
