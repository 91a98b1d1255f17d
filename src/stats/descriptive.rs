//! Descriptive statistics of closing prices and the per-asset text report.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::data::frame::Frame;
use crate::data::loader::{calculate_financial_indicators, crossover_signal};
use crate::error::StatsError;
use crate::features::indicators::rolling_mean;

const SHORT_WINDOW: usize = 10;
const LONG_WINDOW: usize = 30;
const INDICATOR_WINDOW: usize = 7;
const CHART_COLUMNS: [&str; 5] = ["close", "moving_average", "short_mavg", "long_mavg", "signal"];

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator). NaN below two values.
pub(crate) fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

/// Linear-interpolated quantile of an ascending slice.
pub(crate) fn quantile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = p * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
        }
    }
}

fn skewness(values: &[f64], m: f64) -> f64 {
    let n = values.len() as f64;
    if values.len() < 3 {
        return f64::NAN;
    }
    let m2: f64 = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
    let m3: f64 = values.iter().map(|v| (v - m).powi(3)).sum::<f64>() / n;
    if m2 == 0.0 {
        return 0.0;
    }
    (n * (n - 1.0)).sqrt() / (n - 2.0) * m3 / m2.powf(1.5)
}

/// Unbiased excess kurtosis.
fn kurtosis(values: &[f64], m: f64) -> f64 {
    let n = values.len() as f64;
    if values.len() < 4 {
        return f64::NAN;
    }
    let s2: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    let s4: f64 = values.iter().map(|v| (v - m).powi(4)).sum();
    if s2 == 0.0 {
        return 0.0;
    }
    let adj = 3.0 * (n - 1.0).powi(2) / ((n - 2.0) * (n - 3.0));
    n * (n + 1.0) * (n - 1.0) * s4 / ((n - 2.0) * (n - 3.0) * s2 * s2) - adj
}

/// Smallest of the most frequent values.
fn mode(sorted: &[f64]) -> Option<f64> {
    let mut best: Option<(f64, usize)> = None;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j < sorted.len() && sorted[j] == sorted[i] {
            j += 1;
        }
        if best.map_or(true, |(_, count)| j - i > count) {
            best = Some((sorted[i], j - i));
        }
        i = j;
    }
    best.map(|(value, _)| value)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Statistics {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub q25: f64,
    pub median: f64,
    pub q75: f64,
    pub max: f64,
    pub variance: f64,
    pub skewness: f64,
    pub kurtosis: f64,
}

impl Statistics {
    fn rows(&self) -> [(&'static str, f64); 11] {
        [
            ("count", self.count as f64),
            ("mean", self.mean),
            ("std", self.std),
            ("min", self.min),
            ("25%", self.q25),
            ("50%", self.median),
            ("75%", self.q75),
            ("max", self.max),
            ("variance", self.variance),
            ("skewness", self.skewness),
            ("kurtosis", self.kurtosis),
        ]
    }
}

fn valid_closes(frame: &Frame) -> Option<Vec<f64>> {
    if frame.is_empty() {
        return None;
    }
    let close = frame.column("close")?;
    Some(close.iter().copied().filter(|v| !v.is_nan()).collect())
}

/// Summary of the `close` column. `None` for an empty frame or one
/// without `close`.
pub fn calculate_statistics(frame: &Frame) -> Option<Statistics> {
    let Some(mut values) = valid_closes(frame).filter(|v| !v.is_empty()) else {
        warn!("Empty frame or no 'close' column, no statistics computed");
        return None;
    };
    let m = mean(&values);
    let std = sample_std(&values);
    let skewness = skewness(&values, m);
    let kurtosis = kurtosis(&values, m);
    values.sort_by(|a, b| a.total_cmp(b));

    Some(Statistics {
        count: values.len(),
        mean: m,
        std,
        min: values[0],
        q25: quantile(&values, 0.25),
        median: quantile(&values, 0.5),
        q75: quantile(&values, 0.75),
        max: values[values.len() - 1],
        variance: std * std,
        skewness,
        kurtosis,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variability {
    pub asset: String,
    pub mean_price: f64,
    pub std_dev: f64,
    pub cv_percent: f64,
}

/// Coefficient of variation per asset, highest first.
pub fn calculate_comparative_variability(assets: &[(String, Frame)]) -> Vec<Variability> {
    let mut results: Vec<Variability> = assets
        .iter()
        .filter_map(|(name, frame)| {
            let Some(values) = valid_closes(frame).filter(|v| !v.is_empty()) else {
                warn!("No usable 'close' data for {}, skipped in variability analysis", name);
                return None;
            };
            let mean_price = mean(&values);
            let std_dev = sample_std(&values);
            let cv_percent = if mean_price != 0.0 { std_dev / mean_price * 100.0 } else { 0.0 };
            Some(Variability {
                asset: name.replace('_', " "),
                mean_price,
                std_dev,
                cv_percent,
            })
        })
        .collect();

    if results.is_empty() {
        warn!("No valid data to compare variability");
    }
    results.sort_by(|a, b| b.cv_percent.total_cmp(&a.cv_percent));
    results
}

pub fn format_variability_table(rows: &[Variability]) -> String {
    let mut table = format!(
        "{:<14}{:>16}{:>16}{:>12}\n",
        "Asset", "Mean Price", "Std Dev", "CV (%)"
    );
    for r in rows {
        table.push_str(&format!(
            "{:<14}{:>16.4}{:>16.4}{:>12.2}\n",
            r.asset, r.mean_price, r.std_dev, r.cv_percent
        ));
    }
    table
}

/// Write `analise_{PAIR}.txt` with the close statistics, the central
/// measures and the moving-average crossover counts.
pub fn generate_analysis_report(
    frame: &Frame,
    pair: &str,
    dir: &Path,
) -> Result<Option<PathBuf>, StatsError> {
    let Some(stats) = calculate_statistics(frame) else {
        warn!("Data for '{}' is empty or lacks 'close', no report written", pair);
        return Ok(None);
    };
    info!("Writing analysis report for {}...", pair);

    let mut closes = valid_closes(frame).unwrap_or_default();
    let short = rolling_mean(&closes, SHORT_WINDOW);
    let long = rolling_mean(&closes, LONG_WINDOW);
    let signal = crossover_signal(&short, &long);
    let buys = signal.iter().filter(|&&s| s > 0.0).count();
    let sells = signal.iter().filter(|&&s| s < 0.0).count();
    let positive = closes.iter().all(|&c| c > 0.0);
    closes.sort_by(|a, b| a.total_cmp(b));

    let mut report = format!("Analysis of {pair}\n{}\n", "-".repeat(50));
    for (name, value) in stats.rows() {
        report.push_str(&format!("{name:<10} {value:>18.6}\n"));
    }
    report.push_str(&format!("\nMean price:   {:.2}\n", stats.mean));
    report.push_str(&format!("Median price: {:.2}\n", stats.median));
    match mode(&closes) {
        Some(m) => report.push_str(&format!("Mode price:   {m:.2}\n")),
        None => report.push_str("Mode price:   n/a\n"),
    }
    if !positive {
        warn!("Prices <= 0 found for '{}', log scale not applicable", pair);
    }
    report.push_str(&format!(
        "\nMoving-average crossover ({SHORT_WINDOW}/{LONG_WINDOW} days)\n"
    ));
    report.push_str(&format!("Buy signals:  {buys}\nSell signals: {sells}\n"));

    fs::create_dir_all(dir)?;
    let path = dir.join(format!("analise_{}.txt", pair.replace(['/', ' '], "_")));
    fs::write(&path, report)?;
    info!("Analysis report saved to {}", path.display());
    Ok(Some(path))
}

/// Price history with its moving averages and crossover signals, written
/// to `{PAIR}_chart.csv` for charting.
pub fn export_price_chart(frame: &Frame, pair: &str, dir: &Path) -> Result<Option<PathBuf>, StatsError> {
    if frame.is_empty() || !frame.has_column("close") {
        warn!("No 'close' data for {}, chart data not written", pair);
        return Ok(None);
    }
    let mut chart = frame.clone();
    calculate_financial_indicators(&mut chart, INDICATOR_WINDOW)?;
    let selected = chart.select(&CHART_COLUMNS)?;

    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}_chart.csv", pair.replace(' ', "_")));
    selected.write_csv(&path)?;
    info!("Chart data saved to {}", path.display());
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, NaiveDate};

    fn frame(close: Vec<f64>) -> Frame {
        let start = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let dates = (0..close.len()).map(|i| start + Duration::days(i as i64)).collect();
        Frame::from_columns(dates, vec![("close".to_string(), close)]).unwrap()
    }

    #[test]
    fn test_statistics_match_describe() {
        let stats = calculate_statistics(&frame(vec![1.0, 2.0, 3.0, 4.0, 10.0])).unwrap();
        assert_eq!(stats.count, 5);
        assert_relative_eq!(stats.mean, 4.0);
        assert_relative_eq!(stats.variance, 12.5);
        assert_relative_eq!(stats.q25, 2.0);
        assert_relative_eq!(stats.median, 3.0);
        assert_relative_eq!(stats.q75, 4.0);
        // Reference values from the bias-corrected estimators.
        assert_relative_eq!(stats.skewness, 1.2 * 2f64.sqrt(), epsilon = 1e-9);
        assert_relative_eq!(stats.kurtosis, 3.152, epsilon = 1e-9);
    }

    #[test]
    fn test_statistics_need_close() {
        assert!(calculate_statistics(&Frame::default()).is_none());
        let start = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let no_close = Frame::from_columns(vec![start], vec![("open".to_string(), vec![1.0])]).unwrap();
        assert!(calculate_statistics(&no_close).is_none());
    }

    #[test]
    fn test_quantile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_relative_eq!(quantile(&sorted, 0.33), 1.99);
        assert_relative_eq!(quantile(&sorted, 0.66), 2.98);
    }

    #[test]
    fn test_variability_sorted_by_cv() {
        let assets = vec![
            ("BTC_USDT".to_string(), frame(vec![100.0, 101.0, 99.0])),
            ("ETH_USDT".to_string(), frame(vec![10.0, 20.0, 30.0])),
            ("EMPTY".to_string(), Frame::default()),
        ];
        let rows = calculate_comparative_variability(&assets);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].asset, "ETH USDT");
        assert_relative_eq!(rows[0].cv_percent, 50.0);
    }

    #[test]
    fn test_mode_prefers_smallest() {
        assert_eq!(mode(&[1.0, 2.0, 2.0, 3.0, 3.0]), Some(2.0));
        assert_eq!(mode(&[]), None);
    }

    #[test]
    fn test_analysis_report_written() {
        let dir = tempfile::tempdir().unwrap();
        let closes: Vec<f64> = (0..60).map(|i| 50.0 + (i as f64 / 5.0).sin() * 10.0).collect();
        let path = generate_analysis_report(&frame(closes), "BTC_USDT", dir.path())
            .unwrap()
            .unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("kurtosis"));
        assert!(text.contains("Buy signals"));
    }

    #[test]
    fn test_price_chart_export() {
        let dir = tempfile::tempdir().unwrap();
        let closes: Vec<f64> = (0..45).map(|i| 20.0 + (i as f64 / 4.0).cos()).collect();
        let path = export_price_chart(&frame(closes), "ETH_USDT", dir.path())
            .unwrap()
            .unwrap();
        let chart = Frame::read_csv(path).unwrap();
        assert_eq!(chart.column_names(), CHART_COLUMNS.to_vec());
        assert_eq!(chart.len(), 45);
        assert!(export_price_chart(&Frame::default(), "X", dir.path()).unwrap().is_none());
    }
}
