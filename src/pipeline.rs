use anyhow::{Context, Result};
use clap::ValueEnum;
use std::fs;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::data::external::frame_date_range;
use crate::data::paths::{
    clean_output_folders, features_filepath, model_filepath, pair_key, preprocessed_data_filepath,
    processed_data_filepath, raw_data_filepath,
};
use crate::data::{enrich_with_external_features, ExternalDataClient, Frame, MarketDataClient};
use crate::features::{create_technical_features, preprocess_features};
use crate::ml::{
    clean_old_models, compare_models, get_best_model_by_mse, refit_on_all,
    train_and_evaluate_model, ModelKind, SavedModel, TrainingParams,
};
use crate::simulation::simulate_investment_and_profit;
use crate::stats::{
    calculate_comparative_variability, calculate_statistics, export_price_chart,
    format_variability_table, generate_analysis_report, perform_anova_analysis,
    perform_hypothesis_test,
};

const USD_BRL: &str = "usd_brl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    All,
    Download,
    Analyze,
    Features,
    Train,
    Profit,
    Stats,
}

impl Action {
    fn runs(self, stages: &[Action]) -> bool {
        self == Action::All || stages.contains(&self)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub action: Action,
    pub symbols: Vec<String>,
    pub model: Option<ModelKind>,
    pub force_download: bool,
}

/// Pairs and their frames, in symbol order.
type PairFrames = Vec<(String, Frame)>;

pub struct Pipeline {
    config: Config,
    params: TrainingParams,
    market_client: MarketDataClient,
    external_client: ExternalDataClient,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self> {
        let market_client = MarketDataClient::new(config.paths.raw_dir.clone(), &config.data.exchange)
            .context("Failed to build market data client")?;
        let external_client = ExternalDataClient::new().context("Failed to build external data client")?;
        let params = TrainingParams::from(&config.training);

        info!(
            "Pipeline initialized (kfolds {}, validation split {}, poly degree {})",
            params.kfolds, params.validation_split, params.poly_degree
        );

        Ok(Self {
            config,
            params,
            market_client,
            external_client,
        })
    }

    pub async fn run(&self, options: &RunOptions) -> Result<()> {
        let paths = &self.config.paths;
        paths.ensure_all()?;

        if options.action == Action::All {
            let removed = clean_output_folders(paths);
            info!("Removed {} files from previous runs", removed);
        }
        self.config
            .write_snapshot(&paths.stats_reports_dir.join("run_config.toml"))?;

        let mut raw_frames = PairFrames::new();
        let mut featured_frames = PairFrames::new();

        if options.action.runs(&[Action::Download, Action::Analyze, Action::Features, Action::Stats]) {
            info!("Loading raw data...");
            raw_frames = self.load_raw_frames(options).await;
        }

        if options.action.runs(&[Action::Train, Action::Profit]) {
            info!("Loading featured data...");
            featured_frames = self.load_featured_frames(&options.symbols);
        }

        if options.action.runs(&[Action::Analyze]) {
            self.run_analyze(&raw_frames);
        }

        if options.action.runs(&[Action::Features]) {
            let built = self.run_features(&raw_frames);
            // Newly built frames replace anything read from disk.
            for (pair, frame) in built {
                featured_frames.retain(|(p, _)| *p != pair);
                featured_frames.push((pair, frame));
            }
        }

        if options.action.runs(&[Action::Train]) {
            self.run_train(&featured_frames, options.model);
        }

        if options.action.runs(&[Action::Profit]) {
            self.run_profit(&featured_frames);
        }

        if options.action.runs(&[Action::Stats]) {
            self.run_stats(&raw_frames);
        }

        info!("WORKFLOW COMPLETE");
        Ok(())
    }

    async fn download_pair(&self, base: &str, force_download: bool) -> Result<Option<Frame>> {
        let data = &self.config.data;
        let Some(mut frame) = self
            .market_client
            .load_crypto_data(base, &data.quote, &data.timeframe, force_download)
            .await?
        else {
            return Ok(None);
        };
        if frame.is_empty() {
            return Ok(None);
        }

        if self.config.features.use_usd_brl {
            if let Some((start, end)) = frame_date_range(&frame) {
                let series = self.external_client.fetch_usd_brl(start, end).await;
                enrich_with_external_features(&mut frame, &series);
            }
        }

        let path = raw_data_filepath(&self.config.paths, base, &data.quote, &data.timeframe);
        frame
            .write_csv(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(Some(frame))
    }

    async fn load_raw_frames(&self, options: &RunOptions) -> PairFrames {
        let data = &self.config.data;
        let mut frames = PairFrames::new();

        for base in &options.symbols {
            let pair = pair_key(base, &data.quote);

            if options.action.runs(&[Action::Download]) {
                info!("Processing {}...", base);
                match self.download_pair(base, options.force_download).await {
                    Ok(Some(frame)) => {
                        info!("Raw data for {} processed and saved", base);
                        frames.push((pair, frame));
                    }
                    Ok(None) => warn!("No data available for {}", pair),
                    Err(e) => error!("Failed to load {}: {:#}", pair, e),
                }
                continue;
            }

            let path = raw_data_filepath(&self.config.paths, base, &data.quote, &data.timeframe);
            if !path.exists() {
                warn!("Raw data file not found for {}. Run the 'download' action", pair);
                continue;
            }
            match Frame::read_csv(&path) {
                Ok(frame) => frames.push((pair, frame)),
                Err(e) => error!("Failed to read {}: {}", path.display(), e),
            }
        }
        frames
    }

    fn load_featured_frames(&self, symbols: &[String]) -> PairFrames {
        let quote = &self.config.data.quote;
        let mut frames = PairFrames::new();
        for base in symbols {
            let pair = pair_key(base, quote);
            let path = processed_data_filepath(&self.config.paths, base, quote);
            if !path.exists() {
                warn!("Featured data file not found for {}. Run the 'features' action", pair);
                continue;
            }
            match Frame::read_csv(&path) {
                Ok(frame) => frames.push((pair, frame)),
                Err(e) => error!("Failed to read featured file {}: {}", path.display(), e),
            }
        }
        frames
    }

    fn run_analyze(&self, raw_frames: &PairFrames) {
        if raw_frames.is_empty() {
            error!("No raw data available for the 'analyze' action");
            return;
        }
        info!("Starting statistical analysis and chart data export");
        let paths = &self.config.paths;
        for (pair, frame) in raw_frames {
            if let Some(stats) = calculate_statistics(frame) {
                info!("[{}] mean close {:.4}, std {:.4}, n {}", pair, stats.mean, stats.std, stats.count);
            }
            if let Err(e) = generate_analysis_report(frame, pair, &paths.analysis_dir) {
                error!("Analysis report failed for {}: {}", pair, e);
            }
            if let Err(e) = export_price_chart(frame, pair, &paths.plots_dir) {
                error!("Chart data export failed for {}: {}", pair, e);
            }
        }
        let variability = calculate_comparative_variability(raw_frames);
        info!(
            "\n*** Comparative variability analysis ***\n{}",
            format_variability_table(&variability)
        );
    }

    fn run_features(&self, raw_frames: &PairFrames) -> PairFrames {
        if raw_frames.is_empty() {
            error!("No raw data available for the 'features' action");
            return PairFrames::new();
        }
        info!("Starting feature engineering");
        let quote = &self.config.data.quote;
        let windows = &self.config.features.moving_average_windows;
        let mut built = PairFrames::new();

        for (pair, frame) in raw_frames {
            info!("Creating features for {}...", pair);
            let featured = match create_technical_features(frame, windows) {
                Ok(featured) => featured,
                Err(e) => {
                    error!("Feature engineering failed for {}: {}", pair, e);
                    continue;
                }
            };
            let base = pair.split('_').next().unwrap_or(pair);
            let path = processed_data_filepath(&self.config.paths, base, quote);
            match featured.write_csv(&path) {
                Ok(()) => info!("Features for {} saved to {}", pair, path.display()),
                Err(e) => error!("Failed to save features for {}: {}", pair, e),
            }
            built.push((pair.clone(), featured));
        }
        built
    }

    fn run_train(&self, featured_frames: &PairFrames, model: Option<ModelKind>) {
        if featured_frames.is_empty() {
            error!("No processed data available for the 'train' action");
            return;
        }
        info!("Starting model training and evaluation");
        for (pair, frame) in featured_frames {
            info!("Processing models for {}...", pair);
            if let Err(e) = self.train_pair(pair, frame, model) {
                error!("Training failed for {}: {:#}", pair, e);
            }
        }
    }

    /// Candidate columns present in `frame`, plus `usd_brl` when enabled.
    fn candidate_features(&self, frame: &Frame) -> Vec<String> {
        let mut features: Vec<String> = self
            .config
            .features
            .candidates
            .iter()
            .filter(|c| frame.has_column(c))
            .cloned()
            .collect();
        if self.config.features.use_usd_brl
            && frame.has_column(USD_BRL)
            && !features.iter().any(|f| f == USD_BRL)
        {
            features.push(USD_BRL.to_string());
            info!("Feature '{}' added to the candidate list", USD_BRL);
        }
        features
    }

    fn train_pair(&self, pair: &str, frame: &Frame, model: Option<ModelKind>) -> Result<()> {
        let paths = &self.config.paths;
        let training = &self.config.training;

        let mut filtered = frame.clone();
        filtered.drop_na_in("close")?;
        let y = filtered.require("close")?.to_vec();
        let candidates = self.candidate_features(&filtered);
        let x = filtered.select(&candidates)?;

        let force_include: &[&str] = if self.config.features.use_usd_brl { &[USD_BRL] } else { &[] };
        let x_clean = match preprocess_features(&x, &y, training.vif_threshold, training.k_best, force_include) {
            Ok(x) if x.n_columns() > 0 && !x.is_empty() => x,
            Ok(_) => {
                warn!("Not enough data to train models for {} after preprocessing", pair);
                return Ok(());
            }
            Err(e) => {
                warn!("Preprocessing failed for {}: {}", pair, e);
                return Ok(());
            }
        };
        clean_old_models(pair, &paths.models_dir);
        let features: Vec<String> = x_clean.column_names().iter().map(|s| s.to_string()).collect();

        let trained = match model {
            Some(kind) => {
                let report = train_and_evaluate_model(&x_clean, &y, kind, &self.params, pair, &paths.models_dir)?;
                if report.model_path.is_some() {
                    self.save_simulation_inputs(pair, &x_clean, &y, &features)?;
                }
                kind
            }
            None => {
                let Some((mut best, kind)) = get_best_model_by_mse(&x_clean, &y, &self.params)? else {
                    warn!("Could not determine the best model for {}", pair);
                    return Ok(());
                };
                self.save_simulation_inputs(pair, &x_clean, &y, &features)?;

                refit_on_all(&mut best, &x_clean, &y)?;
                let model_path = model_filepath(&paths.models_dir, &kind.file_prefix(), pair);
                SavedModel {
                    kind,
                    features: features.clone(),
                    model: best,
                }
                .save(&model_path)?;
                info!("Best model ({}) saved to {}", kind, model_path.display());
                kind
            }
        };

        if let Some(comparison) = compare_models(&x_clean, &y, &self.params, pair, &paths.analysis_dir)? {
            match comparison.result(trained) {
                Some(result) if comparison.best == trained => info!(
                    "[{}] Saved model {} also leads the comparison (mean CV MSE {:.4})",
                    pair, trained, result.cv_mean.mse
                ),
                Some(result) => info!(
                    "[{}] Saved model {} has mean CV MSE {:.4}, comparison best is {}",
                    pair, trained, result.cv_mean.mse, comparison.best
                ),
                None => warn!("[{}] Saved model {} is missing from the comparison", pair, trained),
            }
        }
        Ok(())
    }

    /// Preprocessed features with `close`, and the selected feature names,
    /// as read back by the profit simulation.
    fn save_simulation_inputs(&self, pair: &str, x: &Frame, y: &[f64], features: &[String]) -> Result<()> {
        let paths = &self.config.paths;
        let mut preprocessed = x.clone();
        preprocessed.insert_column("close", y.to_vec())?;
        let path = preprocessed_data_filepath(paths, pair);
        preprocessed.write_csv(&path)?;
        info!("Preprocessed data saved for simulation to {}", path.display());

        let features_path = features_filepath(&paths.models_dir, pair);
        fs::write(&features_path, serde_json::to_string(features)?)
            .with_context(|| format!("Failed to write {}", features_path.display()))?;
        Ok(())
    }

    fn run_profit(&self, featured_frames: &PairFrames) {
        if featured_frames.is_empty() {
            error!("No processed data available for the 'profit' action");
            return;
        }
        info!("Starting profit simulation");
        let initial = self.config.simulation.initial_investment;
        for (pair, _) in featured_frames {
            info!("Simulating profit for {}...", pair);
            match simulate_investment_and_profit(pair, &self.config.paths, initial) {
                Ok(report) => {
                    if let Some(best) = report.best() {
                        info!(
                            "[{}] Most profitable model: {} (${:.2})",
                            pair, best.kind, best.profit
                        );
                    }
                }
                Err(e) => warn!("Simulation skipped for {}: {}", pair, e),
            }
        }
    }

    fn run_stats(&self, raw_frames: &PairFrames) {
        if raw_frames.is_empty() {
            error!("No raw data available for the 'stats' action");
            return;
        }
        info!("Starting statistical tests");
        let stats = &self.config.stats;
        let dir = &self.config.paths.stats_reports_dir;
        for (pair, frame) in raw_frames {
            if let Err(e) = perform_hypothesis_test(frame, pair, stats.target_return_percent, dir, stats.alpha) {
                error!("Hypothesis test failed for {}: {}", pair, e);
            }
        }
        if let Err(e) = perform_anova_analysis(raw_frames, dir, stats.alpha) {
            error!("ANOVA analysis failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use chrono::{Duration, NaiveDate};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};
    use std::path::Path;

    fn test_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.paths = PathsConfig {
            raw_dir: root.join("raw"),
            output_dir: root.join("output"),
            processed_dir: root.join("processed"),
            models_dir: root.join("models"),
            plots_dir: root.join("plots"),
            analysis_dir: root.join("analysis"),
            profit_plots_dir: root.join("profit"),
            stats_reports_dir: root.join("stats"),
        };
        config.data.symbols = vec!["BTC".to_string(), "ETH".to_string(), "LTC".to_string()];
        config.training.kfolds = 3;
        config.training.n_estimators = 5;
        config.features.use_usd_brl = false;
        config
    }

    fn synthetic_raw(seed: u64, n: usize) -> Frame {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let noise = Normal::new(0.001, 0.02).unwrap();
        let start = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let mut close = Vec::with_capacity(n);
        let mut price = 100.0;
        for _ in 0..n {
            price *= 1.0 + noise.sample(&mut rng);
            close.push(price);
        }
        let open: Vec<f64> = close.iter().map(|c| c * 0.99).collect();
        let high: Vec<f64> = close.iter().map(|c| c * 1.02).collect();
        let low: Vec<f64> = close.iter().map(|c| c * 0.97).collect();
        let volume: Vec<f64> = (0..n).map(|i| 1000.0 + (i % 7) as f64 * 50.0).collect();
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

    fn seed_raw_files(config: &Config) {
        config.paths.ensure_all().unwrap();
        for (i, base) in config.data.symbols.iter().enumerate() {
            let path = raw_data_filepath(&config.paths, base, "USDT", "d");
            synthetic_raw(i as u64 + 1, 160).write_csv(path).unwrap();
        }
    }

    fn options(action: Action, config: &Config, model: Option<ModelKind>) -> RunOptions {
        RunOptions {
            action,
            symbols: config.data.symbols.clone(),
            model,
            force_download: false,
        }
    }

    #[test]
    fn test_action_stages() {
        assert!(Action::All.runs(&[Action::Train]));
        assert!(Action::Train.runs(&[Action::Train, Action::Profit]));
        assert!(!Action::Stats.runs(&[Action::Train]));
    }

    #[tokio::test]
    async fn test_offline_stages_produce_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        seed_raw_files(&config);
        let pipeline = Pipeline::new(config.clone()).unwrap();

        pipeline.run(&options(Action::Analyze, &config, None)).await.unwrap();
        assert!(config.paths.analysis_dir.join("analise_BTC_USDT.txt").exists());
        assert!(config.paths.plots_dir.join("BTC_USDT_chart.csv").exists());

        pipeline.run(&options(Action::Features, &config, None)).await.unwrap();
        let featured = processed_data_filepath(&config.paths, "BTC", "USDT");
        assert!(featured.exists());

        pipeline.run(&options(Action::Stats, &config, None)).await.unwrap();
        assert!(config
            .paths
            .stats_reports_dir
            .join("hypothesis_test_report_ETH_USDT.txt")
            .exists());
        assert!(config
            .paths
            .stats_reports_dir
            .join("anova_report_all_cryptos.txt")
            .exists());
    }

    #[tokio::test]
    async fn test_train_then_profit_with_fixed_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.data.symbols = vec!["BTC".to_string()];
        seed_raw_files(&config);
        let pipeline = Pipeline::new(config.clone()).unwrap();

        pipeline.run(&options(Action::Features, &config, None)).await.unwrap();
        let stale = model_filepath(&config.paths.models_dir, "mlp", "BTC_USDT");
        fs::write(&stale, "{}").unwrap();
        pipeline
            .run(&options(Action::Train, &config, Some(ModelKind::Linear)))
            .await
            .unwrap();

        let models = &config.paths.models_dir;
        assert!(model_filepath(models, "linear", "BTC_USDT").exists());
        assert!(features_filepath(models, "BTC_USDT").exists());
        for kind in [ModelKind::Mlp, ModelKind::Polynomial, ModelKind::RandomForest] {
            assert!(
                !model_filepath(models, &kind.file_prefix(), "BTC_USDT").exists(),
                "{kind} model written in single-model mode"
            );
        }
        assert!(config
            .paths
            .analysis_dir
            .join("model_comparison_BTC_USDT.csv")
            .exists());

        pipeline.run(&options(Action::Profit, &config, None)).await.unwrap();
        assert!(config
            .paths
            .profit_plots_dir
            .join("profit_evolution_BTC_USDT.csv")
            .exists());
    }
}
