//! Back-test of a long-or-flat strategy driven by each saved model.

use chrono::NaiveDateTime;
use nalgebra::DMatrix;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::PathsConfig;
use crate::data::frame::Frame;
use crate::data::paths::{features_filepath, model_filepath, preprocessed_data_filepath};
use crate::error::SimulationError;
use crate::ml::models::{ModelKind, Regressor, SavedModel};

#[derive(Debug, Clone, Serialize)]
pub struct ModelOutcome {
    pub kind: ModelKind,
    pub final_balance: f64,
    pub profit: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfitReport {
    pub pair: String,
    pub initial_investment: f64,
    pub outcomes: Vec<ModelOutcome>,
    #[serde(skip)]
    pub evolution_path: PathBuf,
}

impl ProfitReport {
    pub fn best(&self) -> Option<&ModelOutcome> {
        self.outcomes
            .iter()
            .max_by(|a, b| a.final_balance.total_cmp(&b.final_balance))
    }
}

/// Balance path of the strategy over `closes`.
///
/// `predictions[i]` is the model's price for day `i`, made from the
/// features of day `i - 1`. The position for day `i` is long when the
/// prediction issued the day before beat the close known at that time,
/// otherwise flat.
pub fn strategy_balance(closes: &[f64], predictions: &[f64], initial: f64) -> Vec<f64> {
    let n = closes.len().min(predictions.len());
    let mut balance = Vec::with_capacity(n);
    let mut acc = 1.0;
    let mut long_yesterday = false;

    for i in 0..n {
        let last_known = if i == 0 { 0.0 } else { closes[i - 1] };
        let daily_return = if i == 0 || closes[i - 1] == 0.0 {
            0.0
        } else {
            closes[i] / closes[i - 1] - 1.0
        };
        let daily_return = if daily_return.is_finite() { daily_return } else { 0.0 };

        if long_yesterday {
            acc *= 1.0 + daily_return;
        }
        balance.push(initial * acc);
        long_yesterday = predictions[i] > last_known;
    }
    balance
}

fn load_models(pair: &str, models_dir: &Path) -> Vec<(ModelKind, SavedModel)> {
    let mut loaded = Vec::new();
    for kind in ModelKind::ALL {
        let path = model_filepath(models_dir, &kind.file_prefix(), pair);
        if !path.exists() {
            warn!("Model {} not found at {}, skipping", kind, path.display());
            continue;
        }
        match SavedModel::load(&path) {
            Ok(saved) => loaded.push((kind, saved)),
            Err(e) => error!("Failed to load model {}: {}", kind, e),
        }
    }
    loaded
}

fn load_feature_list(path: &Path) -> Result<Vec<String>, String> {
    let text = fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&text).map_err(|e| e.to_string())
}

/// Rows `1..n` of `data` paired with the features of the previous row.
/// Rows whose lagged features hold a NaN are skipped.
fn lagged_rows(data: &Frame, features: &[String]) -> Result<(Vec<usize>, DMatrix<f64>), SimulationError> {
    let columns: Vec<&[f64]> = features
        .iter()
        .map(|f| {
            data.column(f)
                .ok_or_else(|| SimulationError::MissingData(format!("feature '{f}'")))
        })
        .collect::<Result<_, _>>()?;
    let rows: Vec<usize> = (1..data.len())
        .filter(|&i| columns.iter().all(|c| !c[i - 1].is_nan()))
        .collect();
    let x = DMatrix::from_fn(rows.len(), columns.len(), |r, c| columns[c][rows[r] - 1]);
    Ok((rows, x))
}

fn write_evolution(
    path: &Path,
    dates: &[NaiveDateTime],
    columns: Vec<(String, Vec<f64>)>,
) -> Result<(), SimulationError> {
    let frame = Frame::from_columns(dates.to_vec(), columns)?;
    frame.write_csv(path)?;
    Ok(())
}

/// Replay every saved model of `pair` over its preprocessed data and write
/// `profit_evolution_{PAIR}.csv` with one balance column per model.
pub fn simulate_investment_and_profit(
    pair: &str,
    paths: &PathsConfig,
    initial_investment: f64,
) -> Result<ProfitReport, SimulationError> {
    info!("Simulating investment and profit for {}...", pair);
    let safe_pair = pair.replace(' ', "_");

    let models = load_models(&safe_pair, &paths.models_dir);
    if models.is_empty() {
        error!("No model loaded for {}, simulation cancelled", pair);
        return Err(SimulationError::NoModels(pair.to_string()));
    }

    let data_path = preprocessed_data_filepath(paths, &safe_pair);
    let data = Frame::read_csv(&data_path).map_err(|e| {
        warn!("Preprocessed file unavailable for {}: {}", pair, e);
        SimulationError::MissingData(pair.to_string())
    })?;
    let closes = data.column("close").ok_or_else(|| {
        warn!("Preprocessed file for {} has no close column", pair);
        SimulationError::MissingData(pair.to_string())
    })?;

    let features_path = features_filepath(&paths.models_dir, &safe_pair);
    let mut evolution = Vec::new();
    let mut outcomes = Vec::new();

    for (kind, saved) in &models {
        info!("Running simulation for model: {}", kind);
        let features = match load_feature_list(&features_path) {
            Ok(features) => features,
            Err(e) => {
                warn!(
                    "Feature list unavailable for {} ({}), skipping {}",
                    pair, e, kind
                );
                continue;
            }
        };
        let missing: Vec<&String> = features.iter().filter(|f| !data.has_column(f)).collect();
        if !missing.is_empty() {
            warn!("[{} - {}] Missing features: {:?}", pair, kind, missing);
            warn!("[{} - {}] Available: {:?}", pair, kind, data.column_names());
            continue;
        }

        let (rows, x) = lagged_rows(&data, &features)?;
        let predictions = match saved.model.predict(&x) {
            Ok(p) => p,
            Err(e) => {
                error!("Prediction with {} failed for {}: {}", kind, pair, e);
                continue;
            }
        };
        let aligned_closes: Vec<f64> = rows.iter().map(|&i| closes[i]).collect();
        let balance = strategy_balance(&aligned_closes, predictions.as_slice(), initial_investment);

        let Some(&final_balance) = balance.last() else {
            warn!("No rows to simulate for {} with {}", pair, kind);
            continue;
        };
        info!(
            "[{} - {}] Final balance: ${:.2} | Profit: ${:.2}",
            pair,
            kind.file_prefix().to_uppercase(),
            final_balance,
            final_balance - initial_investment
        );

        let mut column = vec![f64::NAN; data.len()];
        for (&row, value) in rows.iter().zip(balance) {
            column[row] = value;
        }
        evolution.push((format!("balance_{}", kind.file_prefix()), column));
        outcomes.push(ModelOutcome {
            kind: *kind,
            final_balance,
            profit: final_balance - initial_investment,
        });
    }

    fs::create_dir_all(&paths.profit_plots_dir)?;
    let evolution_path = paths
        .profit_plots_dir
        .join(format!("profit_evolution_{safe_pair}.csv"));
    write_evolution(&evolution_path, data.dates(), evolution)?;
    info!("Profit evolution saved to {}", evolution_path.display());

    Ok(ProfitReport {
        pair: pair.to_string(),
        initial_investment,
        outcomes,
        evolution_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::models::{Model, TrainingParams};
    use approx::assert_relative_eq;
    use chrono::{Duration, NaiveDate};
    use nalgebra::DVector;

    #[test]
    fn test_strategy_balance_follows_signals() {
        let closes = [100.0, 110.0, 121.0, 108.9];
        let predictions = [105.0, 120.0, 100.0, 130.0];
        let balance = strategy_balance(&closes, &predictions, 1000.0);
        assert_relative_eq!(balance[0], 1000.0);
        assert_relative_eq!(balance[1], 1100.0);
        assert_relative_eq!(balance[2], 1210.0, epsilon = 1e-9);
        // Flat on day 3 after the down prediction.
        assert_relative_eq!(balance[3], 1210.0, epsilon = 1e-9);
    }

    #[test]
    fn test_strategy_balance_never_long_keeps_capital() {
        let closes = [10.0, 20.0, 5.0];
        let predictions = [-1.0, 0.0, 0.0];
        assert_eq!(strategy_balance(&closes, &predictions, 500.0), vec![500.0; 3]);
    }

    fn write_fixture(paths: &PathsConfig, pair: &str) {
        fs::create_dir_all(&paths.processed_dir).unwrap();
        fs::create_dir_all(&paths.models_dir).unwrap();
        let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let n = 40;
        let dates = (0..n).map(|i| start + Duration::days(i as i64)).collect();
        let close: Vec<f64> = (0..n).map(|i| 100.0 + i as f64).collect();
        let feature: Vec<f64> = close.iter().map(|c| c + 1.0).collect();
        let frame = Frame::from_columns(
            dates,
            vec![("f".to_string(), feature.clone()), ("close".to_string(), close.clone())],
        )
        .unwrap();
        frame.write_csv(preprocessed_data_filepath(paths, pair)).unwrap();

        let mut model = Model::build(ModelKind::Linear, &TrainingParams::default()).unwrap();
        let x = DMatrix::from_column_slice(n - 1, 1, &feature[..n - 1]);
        let y = DVector::from_column_slice(&close[1..]);
        model.fit(&x, &y).unwrap();
        SavedModel {
            kind: ModelKind::Linear,
            features: vec!["f".to_string()],
            model,
        }
        .save(&model_filepath(&paths.models_dir, "linear", pair))
        .unwrap();
        fs::write(features_filepath(&paths.models_dir, pair), r#"["f"]"#).unwrap();
    }

    fn temp_paths(root: &Path) -> PathsConfig {
        PathsConfig {
            processed_dir: root.join("processed"),
            models_dir: root.join("models"),
            profit_plots_dir: root.join("profit"),
            ..PathsConfig::default()
        }
    }

    #[test]
    fn test_simulation_writes_evolution() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());
        write_fixture(&paths, "BTC_USDT");

        let report = simulate_investment_and_profit("BTC_USDT", &paths, 1000.0).unwrap();
        assert_eq!(report.outcomes.len(), 1);
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.kind, ModelKind::Linear);
        // A perfect model on a rising series stays long after the first day.
        assert!(outcome.profit > 0.0);

        let evolution = Frame::read_csv(&report.evolution_path).unwrap();
        let column = evolution.column("balance_linear").unwrap();
        assert_eq!(column.len(), 40);
        assert!(column[0].is_nan());
        assert_relative_eq!(column[39], outcome.final_balance, epsilon = 1e-6);
    }

    #[test]
    fn test_unwritable_output_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = temp_paths(dir.path());
        write_fixture(&paths, "BTC_USDT");
        let blocked = dir.path().join("blocked");
        fs::write(&blocked, "not a directory").unwrap();
        paths.profit_plots_dir = blocked;

        assert!(matches!(
            simulate_investment_and_profit("BTC_USDT", &paths, 1000.0),
            Err(SimulationError::Io(_))
        ));
    }

    #[test]
    fn test_simulation_without_models_fails() {
        let dir = tempfile::tempdir().unwrap();
        let paths = temp_paths(dir.path());
        assert!(matches!(
            simulate_investment_and_profit("ETH_USDT", &paths, 1000.0),
            Err(SimulationError::NoModels(_))
        ));
    }
}
