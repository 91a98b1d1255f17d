//! Raw prices through feature engineering, selection and model training.

#![allow(dead_code)]

#[path = "../src/config.rs"]
mod config;
#[path = "../src/data/mod.rs"]
mod data;
#[path = "../src/error.rs"]
mod error;
#[path = "../src/features/mod.rs"]
mod features;
#[path = "../src/ml/mod.rs"]
mod ml;

use chrono::{Duration, NaiveDate};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use data::paths::{features_filepath, model_filepath};
use data::Frame;
use features::{create_technical_features, preprocess_features};
use ml::{
    compare_models, get_best_model_by_mse, train_and_evaluate_model, ModelKind, Regressor,
    SavedModel, TrainingParams,
};

fn random_walk(seed: u64, n: usize) -> Frame {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let step = Normal::new(0.002, 0.015).unwrap();
    let start = NaiveDate::from_ymd_opt(2020, 3, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
    let mut close = Vec::with_capacity(n);
    let mut price = 250.0;
    for _ in 0..n {
        price *= 1.0 + step.sample(&mut rng);
        close.push(price);
    }
    let open: Vec<f64> = close.iter().map(|c| c * 0.995).collect();
    let high: Vec<f64> = close.iter().enumerate().map(|(i, c)| c * (1.01 + (i % 3) as f64 * 0.005)).collect();
    let low: Vec<f64> = close.iter().enumerate().map(|(i, c)| c * (0.99 - (i % 4) as f64 * 0.004)).collect();
    let volume: Vec<f64> = (0..n).map(|i| 5_000.0 + ((i * 37) % 11) as f64 * 300.0).collect();
    let dates = (0..n).map(|i| start + Duration::days(i as i64)).collect();
    Frame::from_columns(
        dates,
        vec![
            ("open".to_string(), open),
            ("high".to_string(), high),
            ("low".to_string(), low),
            ("close".to_string(), close),
            ("volume".to_string(), volume),
        ],
    )
    .unwrap()
}

fn selected_inputs(n: usize) -> (Frame, Vec<f64>) {
    let featured = create_technical_features(&random_walk(7, n), &[7, 14, 30]).unwrap();
    let y = featured.column("close").unwrap().to_vec();
    let candidates = config::FeaturesConfig::default().candidates;
    let present: Vec<String> = candidates.into_iter().filter(|c| featured.has_column(c)).collect();
    let x = featured.select(&present).unwrap();
    let x = preprocess_features(&x, &y, 10.0, 6, &[]).unwrap();
    (x, y)
}

fn params() -> TrainingParams {
    TrainingParams {
        kfolds: 3,
        poly_degree: 2,
        n_estimators: 8,
        validation_split: 0.1,
        random_state: 42,
    }
}

#[test]
fn test_selected_features_train_and_persist() {
    let (x, y) = selected_inputs(200);
    assert!(x.n_columns() <= 6 && x.n_columns() > 0);
    assert_eq!(x.len(), y.len());

    let dir = tempfile::tempdir().unwrap();
    let report =
        train_and_evaluate_model(&x, &y, ModelKind::RandomForest, &params(), "SOL_USDT", dir.path()).unwrap();
    assert_eq!(report.folds.len(), 3);
    assert!(report.holdout.is_some());

    let path = model_filepath(dir.path(), "randomforest", "SOL_USDT");
    assert_eq!(report.model_path.as_deref(), Some(path.as_path()));
    let saved = SavedModel::load(&path).unwrap();
    assert_eq!(saved.kind, ModelKind::RandomForest);
    let names: Vec<&str> = saved.features.iter().map(|s| s.as_str()).collect();
    assert_eq!(names, x.column_names());
    assert!(!features_filepath(dir.path(), "SOL_USDT").exists());
}

#[test]
fn test_best_model_and_comparison_agree_on_candidates() {
    let (x, y) = selected_inputs(220);
    let (model, kind) = get_best_model_by_mse(&x, &y, &params()).unwrap().unwrap();
    assert_eq!(model.kind(), kind);
    let predictions = model.predict(&x.to_matrix()).unwrap();
    assert_eq!(predictions.len(), x.len());

    let dir = tempfile::tempdir().unwrap();
    let comparison = compare_models(&x, &y, &params(), "SOL_USDT", dir.path()).unwrap().unwrap();
    assert_eq!(comparison.results.len(), 4);
    assert!(comparison.result(comparison.best).is_some());
    assert!(comparison.equations.iter().any(|(k, _)| *k == ModelKind::Linear));
    for file in ["model_comparison_SOL_USDT.csv", "scatter_holdout_SOL_USDT.csv", "scatter_plot_models_SOL_USDT.csv"] {
        assert!(dir.path().join(file).exists(), "{file} missing");
    }
}
