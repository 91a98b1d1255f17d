//! Cross-validated training, model comparison and best-model selection.
//!
//! Every entry point lags the features by one row first, so the model for
//! day T only sees data up to day T-1. The most recent rows are then held
//! out and the rest is split into expanding time-series folds.

use csv::Writer;
use nalgebra::{DMatrix, DVector};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::metrics::{r2_score, RegressionMetrics};
use super::models::{Model, ModelKind, Regressor, SavedModel, TrainingParams};
use super::validation::{
    apply_lag, holdout_split, take_rows, take_values, time_series_split, HoldoutSplit,
};
use crate::data::frame::Frame;
use crate::data::paths::model_filepath;
use crate::error::ModelError;

/// Lagged design matrix and target with the chronological hold-out split.
pub struct PreparedData {
    pub features: Vec<String>,
    pub x: DMatrix<f64>,
    pub y: DVector<f64>,
    pub split: HoldoutSplit,
}

impl PreparedData {
    pub fn new(x: &Frame, y: &[f64], test_size: f64) -> Result<Self, ModelError> {
        if x.len() != y.len() {
            return Err(ModelError::DimensionMismatch(format!(
                "{} feature rows vs {} targets",
                x.len(),
                y.len()
            )));
        }
        let features = x.column_names().iter().map(|s| s.to_string()).collect();
        let (x, y) = apply_lag(&x.to_matrix(), &DVector::from_column_slice(y));
        let split = holdout_split(x.nrows(), test_size);
        Ok(Self {
            features,
            x,
            y,
            split,
        })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn train(&self) -> (DMatrix<f64>, DVector<f64>) {
        (
            take_rows(&self.x, &self.split.train),
            take_values(&self.y, &self.split.train),
        )
    }

    pub fn validation(&self) -> Option<(DMatrix<f64>, DVector<f64>)> {
        self.split
            .validation
            .as_ref()
            .filter(|rows| !rows.is_empty())
            .map(|rows| (take_rows(&self.x, rows), take_values(&self.y, rows)))
    }
}

fn fit_and_score(
    model: &mut Model,
    x_train: &DMatrix<f64>,
    y_train: &DVector<f64>,
    x_test: &DMatrix<f64>,
    y_test: &DVector<f64>,
) -> Result<(RegressionMetrics, DVector<f64>), ModelError> {
    model.fit(x_train, y_train)?;
    let predicted = model.predict(x_test)?;
    Ok((
        RegressionMetrics::compute(y_test.as_slice(), predicted.as_slice()),
        predicted,
    ))
}

/// Per-fold metrics over the training part. A failed fold is logged and
/// recorded as NaN.
fn cross_validate(
    model: &mut Model,
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    kfolds: usize,
    log_folds: bool,
) -> Result<Vec<RegressionMetrics>, ModelError> {
    let folds = time_series_split(x.nrows(), kfolds)?;
    let kind = model.kind();
    Ok(folds
        .iter()
        .enumerate()
        .map(|(i, fold)| {
            let result = fit_and_score(
                model,
                &take_rows(x, &fold.train),
                &take_values(y, &fold.train),
                &take_rows(x, &fold.test),
                &take_values(y, &fold.test),
            );
            match result {
                Ok((metrics, _)) => {
                    if log_folds {
                        info!(
                            "  Fold {}: MSE={:.4}, MAE={:.4}, R2={:.4}",
                            i + 1,
                            metrics.mse,
                            metrics.mae,
                            metrics.r2
                        );
                    }
                    metrics
                }
                Err(e) => {
                    error!("Fold {} failed for {}: {}", i + 1, kind, e);
                    RegressionMetrics::nan()
                }
            }
        })
        .collect())
}

fn all_failed(folds: &[RegressionMetrics]) -> bool {
    folds.iter().all(|m| m.mse.is_nan())
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub kind: ModelKind,
    pub folds: Vec<RegressionMetrics>,
    pub cv_mean: Option<RegressionMetrics>,
    pub holdout: Option<RegressionMetrics>,
    pub model_path: Option<PathBuf>,
}

fn save_model(
    model: Model,
    features: &[String],
    pair: &str,
    models_dir: &Path,
) -> Result<PathBuf, ModelError> {
    let kind = model.kind();
    let path = model_filepath(models_dir, &kind.file_prefix(), &pair.replace(' ', "_"));
    SavedModel {
        kind,
        features: features.to_vec(),
        model,
    }
    .save(&path)?;
    Ok(path)
}

/// Cross-validate one model family, score it on the hold-out, then refit
/// on every lagged row and save it.
pub fn train_and_evaluate_model(
    x: &Frame,
    y: &[f64],
    kind: ModelKind,
    params: &TrainingParams,
    pair: &str,
    models_dir: &Path,
) -> Result<TrainingReport, ModelError> {
    info!("Training and evaluating {} for {}...", kind, pair);
    let mut model = Model::build(kind, params).map_err(|e| {
        error!("Cannot build {} for {}: {}", kind, pair, e);
        e
    })?;

    let data = PreparedData::new(x, y, params.validation_split)?;
    let mut report = TrainingReport {
        kind,
        folds: Vec::new(),
        cv_mean: None,
        holdout: None,
        model_path: None,
    };

    if data.len() < params.kfolds {
        warn!(
            "Not enough data for {}-fold CV on {}, training on the full set",
            params.kfolds, pair
        );
        if !data.is_empty() {
            model.fit(&data.x, &data.y)?;
            report.model_path = Some(save_model(model, &data.features, pair, models_dir)?);
        }
        return Ok(report);
    }

    let (x_train, y_train) = data.train();
    report.folds = cross_validate(&mut model, &x_train, &y_train, params.kfolds, true)?;

    if all_failed(&report.folds) {
        warn!("No fold produced a score for {} on {}", kind, pair);
        return Ok(report);
    }

    let mean = RegressionMetrics::mean_of(&report.folds);
    info!("Average results for {} ({}-fold CV):", kind, params.kfolds);
    info!("  Mean MSE: {:.4}", mean.mse);
    info!("  Mean MAE: {:.4}", mean.mae);
    info!("  Mean R2: {:.4}", mean.r2);
    report.cv_mean = Some(mean);

    if let Some((x_val, y_val)) = data.validation() {
        match fit_and_score(&mut model, &x_train, &y_train, &x_val, &y_val) {
            Ok((metrics, _)) => {
                info!(
                    "[{}] Hold-Out - R2: {:.4}, MAE: {:.2}, MSE: {:.2}",
                    pair, metrics.r2, metrics.mae, metrics.mse
                );
                report.holdout = Some(metrics);
            }
            Err(e) => error!("Hold-out evaluation failed for {} on {}: {}", kind, pair, e),
        }
    }

    model.fit(&data.x, &data.y)?;
    report.model_path = Some(save_model(model, &data.features, pair, models_dir)?);
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct ModelComparison {
    pub kind: ModelKind,
    pub cv_mean: RegressionMetrics,
    pub holdout: Option<RegressionMetrics>,
}

impl ModelComparison {
    /// `None` when no fold produced a score.
    fn from_folds(
        kind: ModelKind,
        folds: &[RegressionMetrics],
        holdout: Option<RegressionMetrics>,
    ) -> Option<Self> {
        if all_failed(folds) {
            return None;
        }
        Some(Self {
            kind,
            cv_mean: RegressionMetrics::mean_of(folds),
            holdout,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ComparisonReport {
    pub results: Vec<ModelComparison>,
    pub best: ModelKind,
    pub equations: Vec<(ModelKind, String)>,
}

impl ComparisonReport {
    pub fn result(&self, kind: ModelKind) -> Option<&ModelComparison> {
        self.results.iter().find(|r| r.kind == kind)
    }
}

fn format_comparison_table(results: &[ModelComparison]) -> String {
    let mut table = format!(
        "{:<14}{:>16}{:>16}{:>12}{:>16}\n",
        "Model", "Avg MSE", "Avg MAE", "Avg R2", "Avg Std Error"
    );
    for r in results {
        table.push_str(&format!(
            "{:<14}{:>16.4}{:>16.4}{:>12.4}{:>16.4}\n",
            r.kind.name(),
            r.cv_mean.mse,
            r.cv_mean.mae,
            r.cv_mean.r2,
            r.cv_mean.std_error
        ));
    }
    table
}

fn csv_error(e: impl std::fmt::Display) -> ModelError {
    ModelError::PersistenceError(e.to_string())
}

fn write_comparison_csv(path: &Path, results: &[ModelComparison]) -> Result<(), ModelError> {
    let mut writer = Writer::from_path(path).map_err(csv_error)?;
    writer
        .write_record([
            "model",
            "avg_mse",
            "avg_mae",
            "avg_r2",
            "avg_std_error",
            "holdout_mse",
            "holdout_mae",
            "holdout_r2",
        ])
        .map_err(csv_error)?;
    let fmt = |v: f64| if v.is_nan() { String::new() } else { v.to_string() };
    for r in results {
        let h = r.holdout.unwrap_or_else(RegressionMetrics::nan);
        writer
            .write_record([
                r.kind.name().to_string(),
                fmt(r.cv_mean.mse),
                fmt(r.cv_mean.mae),
                fmt(r.cv_mean.r2),
                fmt(r.cv_mean.std_error),
                fmt(h.mse),
                fmt(h.mae),
                fmt(h.r2),
            ])
            .map_err(csv_error)?;
    }
    writer.flush().map_err(csv_error)
}

/// Actual values next to each model's predictions, one row per sample.
fn write_prediction_csv(
    path: &Path,
    actual: &DVector<f64>,
    predictions: &[(ModelKind, DVector<f64>)],
) -> Result<(), ModelError> {
    let mut writer = Writer::from_path(path).map_err(csv_error)?;
    let mut header = vec!["actual".to_string()];
    header.extend(predictions.iter().map(|(k, _)| format!("predicted_{}", k.file_prefix())));
    writer.write_record(&header).map_err(csv_error)?;
    for row in 0..actual.len() {
        let mut record = vec![actual[row].to_string()];
        record.extend(predictions.iter().map(|(_, p)| p[row].to_string()));
        writer.write_record(&record).map_err(csv_error)?;
    }
    writer.flush().map_err(csv_error)
}

/// Cross-validate all four families on the same split, log a comparison
/// table and the fitted equations, and write the comparison and scatter
/// data to `analysis_dir`. Returns `None` when nothing could be compared.
pub fn compare_models(
    x: &Frame,
    y: &[f64],
    params: &TrainingParams,
    pair: &str,
    analysis_dir: &Path,
) -> Result<Option<ComparisonReport>, ModelError> {
    info!("Comparing models for {}...", pair);
    let data = PreparedData::new(x, y, params.validation_split)?;
    if data.len() < params.kfolds {
        warn!("Not enough data for {}-fold CV comparison on {}", params.kfolds, pair);
        return Ok(None);
    }

    let (x_train, y_train) = data.train();
    if x_train.nrows() < params.kfolds + 1 {
        warn!(
            "Training part of {} has {} rows, too few for {}-fold CV comparison",
            pair,
            x_train.nrows(),
            params.kfolds
        );
        return Ok(None);
    }
    let validation = data.validation();
    let mut results = Vec::new();
    let mut holdout_predictions = Vec::new();
    let mut holdout_log = String::from("\n");

    for kind in ModelKind::ALL {
        let mut model = match Model::build(kind, params) {
            Ok(model) => model,
            Err(e) => {
                error!("Skipping {} in comparison: {}", kind, e);
                continue;
            }
        };
        let folds = cross_validate(&mut model, &x_train, &y_train, params.kfolds, false)?;

        let mut holdout = None;
        if let Some((x_val, y_val)) = &validation {
            match fit_and_score(&mut model, &x_train, &y_train, x_val, y_val) {
                Ok((metrics, predicted)) => {
                    holdout_log.push_str(&format!(
                        "[{}] {} - Hold-Out -> R2: {:.4}, MAE: {:.2}, MSE: {:.2}\n",
                        pair, kind, metrics.r2, metrics.mae, metrics.mse
                    ));
                    holdout_predictions.push((kind, predicted));
                    holdout = Some(metrics);
                }
                Err(e) => error!("Hold-out evaluation of {} failed: {}", kind, e),
            }
        }

        match ModelComparison::from_folds(kind, &folds, holdout) {
            Some(result) => results.push(result),
            None => warn!("Every fold of {} failed, leaving it out of the comparison", kind),
        }
    }

    let Some(best) = results
        .iter()
        .filter(|r| !r.cv_mean.mse.is_nan())
        .min_by(|a, b| a.cv_mean.mse.total_cmp(&b.cv_mean.mse))
        .map(|r| r.kind)
    else {
        warn!("No model produced results for {}", pair);
        return Ok(None);
    };

    info!(
        "\n*** Model comparison for {} ***\n{}",
        pair,
        format_comparison_table(&results)
    );
    info!("{}", holdout_log);

    fs::create_dir_all(analysis_dir).map_err(csv_error)?;
    let safe_pair = pair.replace(' ', "_");
    write_comparison_csv(&analysis_dir.join(format!("model_comparison_{safe_pair}.csv")), &results)?;
    if let Some((_, y_val)) = &validation {
        let path = analysis_dir.join(format!("scatter_holdout_{safe_pair}.csv"));
        write_prediction_csv(&path, y_val, &holdout_predictions)?;
        info!("Hold-out scatter data saved to {}", path.display());
    }

    info!("Best regressor for {} by mean CV MSE: {}", pair, best);

    if best != ModelKind::Mlp {
        if let (Some(mlp), Some(winner)) = (
            results.iter().find(|r| r.kind == ModelKind::Mlp),
            results.iter().find(|r| r.kind == best),
        ) {
            info!("MLP standard error: {:.4}", mlp.cv_mean.std_error);
            info!("Best regressor ({}) standard error: {:.4}", best, winner.cv_mean.std_error);
            info!(
                "Standard error difference (MLP vs best): {:.4}",
                (mlp.cv_mean.std_error - winner.cv_mean.std_error).abs()
            );
        }
    }

    // In-sample fit of every family on all lagged rows.
    let mut in_sample = Vec::new();
    let mut equations = Vec::new();
    info!("Coefficients and equations for {}:", pair);
    for kind in ModelKind::ALL {
        let Ok(mut model) = Model::build(kind, params) else {
            continue;
        };
        let predicted = match model.fit(&data.x, &data.y).and_then(|_| model.predict(&data.x)) {
            Ok(predicted) => predicted,
            Err(e) => {
                error!("In-sample fit of {} failed: {}", kind, e);
                continue;
            }
        };
        info!(
            "  {} in-sample R2: {:.4}",
            kind,
            r2_score(data.y.as_slice(), predicted.as_slice())
        );
        in_sample.push((kind, predicted));

        match model.equation(&data.features) {
            Some(equation) => {
                info!("  Model: {} -> {}", kind, equation);
                equations.push((kind, equation));
            }
            None => info!("  Model: {} -> not a simple linear equation", kind),
        }
    }
    let scatter_path = analysis_dir.join(format!("scatter_plot_models_{safe_pair}.csv"));
    write_prediction_csv(&scatter_path, &data.y, &in_sample)?;
    info!("Scatter data saved to {}", scatter_path.display());

    Ok(Some(ComparisonReport {
        results,
        best,
        equations,
    }))
}

/// Whether `candidate` should replace the current best score. A NaN or
/// infinite MSE never wins.
fn improves_on(candidate: f64, current: Option<f64>) -> bool {
    candidate.is_finite() && current.map_or(true, |best| candidate < best)
}

/// Pick the family with the lowest mean CV MSE. The winner is returned
/// fitted on the training part, after a logged hold-out check.
pub fn get_best_model_by_mse(
    x: &Frame,
    y: &[f64],
    params: &TrainingParams,
) -> Result<Option<(Model, ModelKind)>, ModelError> {
    info!("Selecting the best model by MSE (with hold-out)...");
    let data = PreparedData::new(x, y, params.validation_split)?;
    let (x_train, y_train) = data.train();

    let mut best: Option<(Model, f64)> = None;
    for kind in ModelKind::ALL {
        let mut model = match Model::build(kind, params) {
            Ok(model) => model,
            Err(e) => {
                error!("Error evaluating {}: {}", kind, e);
                continue;
            }
        };
        let folds = match time_series_split(x_train.nrows(), params.kfolds) {
            Ok(folds) => folds,
            Err(e) => {
                error!("Error evaluating {}: {}", kind, e);
                continue;
            }
        };

        let mut scores = Vec::with_capacity(folds.len());
        let mut failed = None;
        for fold in &folds {
            match fit_and_score(
                &mut model,
                &take_rows(&x_train, &fold.train),
                &take_values(&y_train, &fold.train),
                &take_rows(&x_train, &fold.test),
                &take_values(&y_train, &fold.test),
            ) {
                Ok((metrics, _)) => scores.push(metrics.mse),
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            error!("Error evaluating {}: {}", kind, e);
            continue;
        }

        let avg_mse = scores.iter().sum::<f64>() / scores.len() as f64;
        info!("[{}] Mean MSE (time-series CV): {:.4}", kind, avg_mse);
        if improves_on(avg_mse, best.as_ref().map(|(_, mse)| *mse)) {
            best = Some((model, avg_mse));
        }
    }

    let Some((mut model, _)) = best else {
        return Ok(None);
    };
    let kind = model.kind();

    match data.validation() {
        Some((x_val, y_val)) => match fit_and_score(&mut model, &x_train, &y_train, &x_val, &y_val) {
            Ok((m, _)) => info!(
                "[{}] Hold-out evaluation -> MSE: {:.4}, MAE: {:.4}, R2: {:.4}",
                kind, m.mse, m.mae, m.r2
            ),
            Err(e) => warn!("Hold-out evaluation of the best model ({}) failed: {}", kind, e),
        },
        None => model.fit(&x_train, &y_train)?,
    }

    Ok(Some((model, kind)))
}

/// Fit `model` on every lagged row of `x`/`y`, the same alignment the
/// profit simulation predicts with.
pub fn refit_on_all(model: &mut Model, x: &Frame, y: &[f64]) -> Result<(), ModelError> {
    let data = PreparedData::new(x, y, 0.0)?;
    model.fit(&data.x, &data.y)
}

/// Remove every persisted model of `pair` so stale families cannot leak
/// into the profit simulation.
pub fn clean_old_models(pair: &str, models_dir: &Path) -> usize {
    let mut removed = 0;
    for kind in ModelKind::ALL {
        let path = model_filepath(models_dir, &kind.file_prefix(), pair);
        if path.exists() {
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!("Removed old model: {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
    removed
}
