use anyhow::{bail, Context, Result};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DataConfig {
    pub symbols: Vec<String>,
    pub quote: String,
    pub timeframe: String,
    pub exchange: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            symbols: ["BTC", "ETH", "LTC", "XRP", "BCH", "XMR", "DASH", "ETC", "ZRX", "EOS"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            quote: "USDT".to_string(),
            timeframe: "d".to_string(),
            exchange: "Poloniex".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub raw_dir: PathBuf,
    pub output_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub models_dir: PathBuf,
    pub plots_dir: PathBuf,
    pub analysis_dir: PathBuf,
    pub profit_plots_dir: PathBuf,
    pub stats_reports_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("data/raw"),
            output_dir: PathBuf::from("data/output"),
            processed_dir: PathBuf::from("data/processed"),
            models_dir: PathBuf::from("data/models"),
            plots_dir: PathBuf::from("grafico/plots"),
            analysis_dir: PathBuf::from("grafico/analysis"),
            profit_plots_dir: PathBuf::from("grafico/profit_plots"),
            stats_reports_dir: PathBuf::from("data/stats_reports"),
        }
    }
}

impl PathsConfig {
    /// Folders wiped at the start of a full run. The raw download cache is not among them.
    pub fn all_output_dirs(&self) -> Vec<&Path> {
        vec![
            self.output_dir.as_path(),
            self.processed_dir.as_path(),
            self.models_dir.as_path(),
            self.plots_dir.as_path(),
            self.analysis_dir.as_path(),
            self.profit_plots_dir.as_path(),
            self.stats_reports_dir.as_path(),
        ]
    }

    pub fn ensure_all(&self) -> Result<()> {
        for dir in std::iter::once(self.raw_dir.as_path()).chain(self.all_output_dirs()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub kfolds: usize,
    pub poly_degree: usize,
    pub n_estimators: usize,
    pub k_best: usize,
    pub validation_split: f64,
    pub vif_threshold: f64,
    pub random_state: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            kfolds: 5,
            poly_degree: 2,
            n_estimators: 100,
            k_best: 6,
            validation_split: 0.1,
            vif_threshold: 10.0,
            random_state: 42,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub moving_average_windows: Vec<usize>,
    pub candidates: Vec<String>,
    pub use_usd_brl: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        let candidates = [
            "high",
            "low",
            "sma_7",
            "sma_14",
            "sma_30",
            "close_lag5",
            "macd",
            "macd_signal",
            "macd_diff",
            "bb_upper",
            "bb_lower",
            "bb_mavg",
            "daily_return",
            "volume",
            "buytakeramount",
            "buytakerquantity",
            "std_7",
            "std_14",
            "std_30",
            "volatility_7d",
            "volatility_30d",
            "rsi",
            "obv",
        ];
        Self {
            moving_average_windows: vec![7, 14, 30],
            candidates: candidates.iter().map(|s| s.to_string()).collect(),
            use_usd_brl: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub initial_investment: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_investment: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsConfig {
    pub target_return_percent: f64,
    pub alpha: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            target_return_percent: 0.01,
            alpha: 0.05,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if it exists, then
    /// `CRYPTO_FORECAST_<SECTION>__<KEY>` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default())?;

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(
                File::from(Path::new(path))
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("CRYPTO_FORECAST")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("data.symbols")
                    .with_list_parse_key("features.candidates")
                    .with_list_parse_key("features.moving_average_windows"),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {path}"))?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        if t.kfolds < 2 {
            bail!("kfolds must be at least 2, got {}", t.kfolds);
        }
        if !(0.0..1.0).contains(&t.validation_split) {
            bail!("validation_split must be in [0, 1), got {}", t.validation_split);
        }
        if !(2..=10).contains(&t.poly_degree) {
            bail!("poly_degree must be between 2 and 10, got {}", t.poly_degree);
        }
        if t.n_estimators == 0 {
            bail!("n_estimators must be positive");
        }
        if self.data.symbols.is_empty() {
            bail!("at least one symbol must be configured");
        }
        if self.simulation.initial_investment <= 0.0 {
            bail!(
                "initial_investment must be positive, got {}",
                self.simulation.initial_investment
            );
        }
        Ok(())
    }

    /// Dump the effective configuration so a run can be reproduced.
    pub fn write_snapshot(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config snapshot to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.training.kfolds, 5);
        assert_eq!(config.data.symbols.len(), 10);
        assert_eq!(config.data.quote, "USDT");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.training.kfolds = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.validation_split = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.poly_degree = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[training]\nkfolds = 3\n\n[data]\nsymbols = [\"BTC\"]\n").unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.training.kfolds, 3);
        assert_eq!(config.training.n_estimators, 100);
        assert_eq!(config.data.symbols, vec!["BTC".to_string()]);
        assert_eq!(config.data.quote, "USDT");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load("definitely-not-here.toml").unwrap();
        assert_eq!(config.paths.models_dir, PathBuf::from("data/models"));
    }

    #[test]
    fn test_snapshot_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_config.toml");
        let config = Config::default();
        config.write_snapshot(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let restored: Config = toml::from_str(&content).unwrap();
        assert_eq!(restored.features.candidates, config.features.candidates);
    }
}
