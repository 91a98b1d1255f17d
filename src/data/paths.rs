//! File naming for every artifact the pipeline reads or writes.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::PathsConfig;

pub fn pair_key(base: &str, quote: &str) -> String {
    format!("{}_{}", base.to_uppercase(), quote.to_uppercase())
}

/// Cleaned exchange history (optionally with USD/BRL) for one pair.
pub fn raw_data_filepath(paths: &PathsConfig, base: &str, quote: &str, timeframe: &str) -> PathBuf {
    paths.output_dir.join(format!(
        "{}_{}_{}.csv",
        base.to_uppercase(),
        quote.to_uppercase(),
        timeframe
    ))
}

pub fn processed_data_filepath(paths: &PathsConfig, base: &str, quote: &str) -> PathBuf {
    paths.processed_dir.join(format!(
        "featured_{}_{}.csv",
        base.to_uppercase(),
        quote.to_uppercase()
    ))
}

pub fn preprocessed_data_filepath(paths: &PathsConfig, pair: &str) -> PathBuf {
    paths.processed_dir.join(format!("preprocessed_{pair}.csv"))
}

pub fn model_filepath(models_dir: &Path, kind_prefix: &str, pair: &str) -> PathBuf {
    models_dir.join(format!("{}_{}.json", kind_prefix.to_lowercase(), pair))
}

pub fn features_filepath(models_dir: &Path, pair: &str) -> PathBuf {
    models_dir.join(format!("features_{pair}.json"))
}

fn remove_files_recursively(dir: &Path, removed: &mut usize) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read {}: {}", dir.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            remove_files_recursively(&path, removed);
        } else if let Err(e) = fs::remove_file(&path) {
            warn!("Failed to remove {}: {}", path.display(), e);
        } else {
            *removed += 1;
        }
    }
}

/// Delete every file under the output folders, keeping the folder tree.
/// The raw download cache is not touched.
pub fn clean_output_folders(paths: &PathsConfig) -> usize {
    let dirs = paths.all_output_dirs();
    info!(
        "Cleaning files from: {}",
        dirs.iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut removed = 0;
    for dir in dirs {
        if dir.exists() {
            remove_files_recursively(dir, &mut removed);
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths_in(root: &Path) -> PathsConfig {
        PathsConfig {
            raw_dir: root.join("raw"),
            output_dir: root.join("output"),
            processed_dir: root.join("processed"),
            models_dir: root.join("models"),
            plots_dir: root.join("plots"),
            analysis_dir: root.join("analysis"),
            profit_plots_dir: root.join("profit"),
            stats_reports_dir: root.join("stats"),
        }
    }

    #[test]
    fn test_file_names() {
        let paths = PathsConfig::default();
        assert_eq!(pair_key("btc", "usdt"), "BTC_USDT");
        assert_eq!(
            raw_data_filepath(&paths, "btc", "usdt", "d"),
            PathBuf::from("data/output/BTC_USDT_d.csv")
        );
        assert_eq!(
            processed_data_filepath(&paths, "eth", "usdt"),
            PathBuf::from("data/processed/featured_ETH_USDT.csv")
        );
        assert_eq!(
            model_filepath(&paths.models_dir, "RandomForest", "BTC_USDT"),
            PathBuf::from("data/models/randomforest_BTC_USDT.json")
        );
        assert_eq!(
            features_filepath(&paths.models_dir, "BTC_USDT"),
            PathBuf::from("data/models/features_BTC_USDT.json")
        );
    }

    #[test]
    fn test_clean_output_folders_keeps_dirs_and_raw_cache() {
        let root = tempfile::tempdir().unwrap();
        let paths = paths_in(root.path());
        paths.ensure_all().unwrap();

        fs::write(paths.models_dir.join("mlp_BTC_USDT.json"), "{}").unwrap();
        fs::create_dir_all(paths.analysis_dir.join("nested")).unwrap();
        fs::write(paths.analysis_dir.join("nested/a.csv"), "x").unwrap();
        fs::write(paths.raw_dir.join("BTC_USDT_d.csv"), "x").unwrap();

        assert_eq!(clean_output_folders(&paths), 2);
        assert!(paths.models_dir.is_dir());
        assert!(paths.analysis_dir.join("nested").is_dir());
        assert!(paths.raw_dir.join("BTC_USDT_d.csv").exists());
    }
}
