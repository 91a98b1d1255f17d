use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, info_span, Instrument};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod data;
mod error;
mod features;
mod ml;
mod pipeline;
mod simulation;
mod stats;

use crate::config::Config;
use crate::ml::ModelKind;
use crate::pipeline::{Action, Pipeline, RunOptions};

#[derive(Parser)]
#[command(name = "crypto-forecast")]
#[command(about = "Cryptocurrency price analysis, regression modelling and profit simulation")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(long, value_enum, default_value_t = Action::All)]
    action: Action,

    /// Base symbol to process, e.g. BTC, or `all` for every configured symbol
    #[arg(long, default_value = "all")]
    crypto: String,

    /// Train only this model family instead of selecting the best one
    #[arg(long)]
    model: Option<ModelKind>,

    #[arg(long)]
    kfolds: Option<usize>,

    #[arg(long)]
    target_return_percent: Option<f64>,

    #[arg(long)]
    poly_degree: Option<usize>,

    /// Fraction of the most recent rows held out for final validation
    #[arg(long)]
    validation_split: Option<f64>,

    #[arg(long)]
    n_estimators: Option<usize>,

    #[arg(long)]
    force_download: bool,

    #[arg(long, conflicts_with = "no_usd_brl")]
    use_usd_brl: bool,

    #[arg(long)]
    no_usd_brl: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(kfolds) = self.kfolds {
            config.training.kfolds = kfolds;
        }
        if let Some(target) = self.target_return_percent {
            config.stats.target_return_percent = target;
        }
        if let Some(degree) = self.poly_degree {
            config.training.poly_degree = degree;
        }
        if let Some(split) = self.validation_split {
            config.training.validation_split = split;
        }
        if let Some(n) = self.n_estimators {
            config.training.n_estimators = n;
        }
        if self.use_usd_brl {
            config.features.use_usd_brl = true;
        }
        if self.no_usd_brl {
            config.features.use_usd_brl = false;
        }
    }

    fn symbols(&self, config: &Config) -> Vec<String> {
        if self.crypto.eq_ignore_ascii_case("all") {
            config.data.symbols.clone()
        } else {
            vec![self.crypto.to_uppercase()]
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    cli.apply_overrides(&mut config);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.validate()?;

    let run_id = Uuid::new_v4();
    let options = RunOptions {
        action: cli.action,
        symbols: cli.symbols(&config),
        model: cli.model,
        force_download: cli.force_download,
    };

    let span = info_span!("run", run_id = %run_id);
    async {
        info!("Starting crypto-forecast ({:?}) for {:?}", options.action, options.symbols);
        let pipeline = Pipeline::new(config)?;
        pipeline.run(&options).await
    }
    .instrument(span)
    .await
}
