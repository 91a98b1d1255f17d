//! Collinearity filtering, scaling and univariate selection of model inputs.

use nalgebra::{DMatrix, DVector};
use tracing::info;

use crate::data::frame::Frame;
use crate::error::FeatureError;
use crate::ml::models::least_squares;

/// Variance inflation factor of every column: `1 / (1 - R²)` of an OLS fit
/// of that column on the remaining ones plus an intercept.
pub fn variance_inflation_factors(x: &DMatrix<f64>) -> Vec<f64> {
    let (n, p) = x.shape();
    (0..p)
        .map(|j| {
            let target = x.column(j).into_owned();
            let mut design = DMatrix::from_element(n, p, 1.0);
            let mut col = 1;
            for k in (0..p).filter(|&k| k != j) {
                design.set_column(col, &x.column(k));
                col += 1;
            }

            let mean = target.mean();
            let ss_tot: f64 = target.iter().map(|v| (v - mean).powi(2)).sum();
            if ss_tot == 0.0 {
                return f64::INFINITY;
            }
            let Some(beta) = least_squares(&design, &target) else {
                return f64::INFINITY;
            };
            let residual = &target - &design * beta;
            let r2 = 1.0 - residual.norm_squared() / ss_tot;
            if r2 >= 1.0 {
                f64::INFINITY
            } else {
                1.0 / (1.0 - r2)
            }
        })
        .collect()
}

/// Drop the most collinear column until every VIF is at or below `threshold`.
pub fn remove_high_vif_features(x: &Frame, threshold: f64) -> Result<Frame, FeatureError> {
    let mut kept: Vec<String> = x.column_names().iter().map(|s| s.to_string()).collect();
    loop {
        if kept.len() < 2 {
            break;
        }
        let current = x.select(&kept).map_err(|e| FeatureError::NoFeatures(e.to_string()))?;
        let vif = variance_inflation_factors(&current.to_matrix());
        let (idx, max_vif) = vif
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best });
        if max_vif > threshold {
            info!("[VIF] Removing '{}' with VIF={:.2}", kept[idx], max_vif);
            kept.remove(idx);
        } else {
            break;
        }
    }
    x.select(&kept).map_err(|e| FeatureError::NoFeatures(e.to_string()))
}

/// Z-score with the population standard deviation. A constant column is
/// only centred.
pub fn standardize(values: &[f64]) -> Vec<f64> {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    let scale = if std == 0.0 { 1.0 } else { std };
    values.iter().map(|v| (v - mean) / scale).collect()
}

/// Univariate F statistic of each column against `y`, from their Pearson
/// correlation. Degenerate columns score NaN.
pub fn f_regression(x: &DMatrix<f64>, y: &DVector<f64>) -> Vec<f64> {
    let n = y.len() as f64;
    let y_centered = y.add_scalar(-y.mean());
    let y_norm = y_centered.norm();
    x.column_iter()
        .map(|col| {
            let centered = col.add_scalar(-col.mean());
            let corr = centered.dot(&y_centered) / (centered.norm() * y_norm);
            corr * corr / (1.0 - corr * corr) * (n - 2.0)
        })
        .collect()
}

/// Indices of the `k` best scores, returned in column order. NaN ranks last
/// and ties favour later columns.
fn select_k_best(scores: &[f64], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    let key = |i: usize| if scores[i].is_nan() { f64::NEG_INFINITY } else { scores[i] };
    order.sort_by(|&a, &b| key(a).total_cmp(&key(b)));
    let mut chosen: Vec<usize> = order.into_iter().rev().take(k).collect();
    chosen.sort_unstable();
    chosen
}

/// VIF filter, standardization, then SelectKBest on F-regression scores.
/// Columns in `force_include` that exist in `x` but were not chosen are
/// standardized from the raw input and appended.
pub fn preprocess_features(
    x: &Frame,
    y: &[f64],
    vif_threshold: f64,
    k_best: usize,
    force_include: &[&str],
) -> Result<Frame, FeatureError> {
    if x.n_columns() == 0 {
        return Err(FeatureError::NoFeatures("input frame has no columns".to_string()));
    }
    if x.len() != y.len() {
        return Err(FeatureError::LengthMismatch {
            features: x.len(),
            target: y.len(),
        });
    }

    let filtered = remove_high_vif_features(x, vif_threshold)?;
    let names: Vec<String> = filtered.column_names().iter().map(|s| s.to_string()).collect();

    let mut scaled = Frame::new(filtered.dates().to_vec());
    for name in &names {
        let raw = filtered
            .require(name)
            .map_err(|e| FeatureError::NoFeatures(e.to_string()))?;
        scaled
            .insert_column(name, standardize(raw))
            .map_err(|e| FeatureError::NoFeatures(e.to_string()))?;
    }

    let k = k_best.min(names.len());
    let scores = f_regression(&scaled.to_matrix(), &DVector::from_column_slice(y));
    let mut selected: Vec<String> = select_k_best(&scores, k)
        .into_iter()
        .map(|i| names[i].clone())
        .collect();

    for &col in force_include {
        if let Some(raw) = x.column(col) {
            if !selected.iter().any(|s| s == col) {
                info!("[Preprocessing] Forcing '{}' into the feature set", col);
                scaled
                    .insert_column(col, standardize(raw))
                    .map_err(|e| FeatureError::NoFeatures(e.to_string()))?;
                selected.push(col.to_string());
            }
        }
    }

    info!("[SelectKBest] Selected features: {:?}", selected);
    scaled
        .select(&selected)
        .map_err(|e| FeatureError::NoFeatures(e.to_string()))
}
