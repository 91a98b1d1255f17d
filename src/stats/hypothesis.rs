//! One-sample t-test on daily returns, one-way ANOVA across assets and
//! volatility groups, and the Tukey HSD post-hoc comparison.

use csv::Writer;
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, FisherSnedecor, StudentsT};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::descriptive::{mean, quantile, sample_std};
use super::tukey::{ptukey, qtukey};
use crate::data::frame::Frame;
use crate::error::StatsError;
use crate::features::indicators::pct_change;

pub const ALL_ASSETS_REPORT: &str = "anova_report_all_cryptos.txt";
pub const VOLATILITY_REPORT: &str = "anova_report_volatility_groups.txt";

/// Percent change of `close` with the leading NaN removed. Empty when the
/// column is missing or has no values.
pub fn daily_returns(frame: &Frame) -> Vec<f64> {
    match frame.column("close") {
        Some(close) if close.iter().any(|v| !v.is_nan()) => {
            pct_change(close).into_iter().filter(|r| r.is_finite()).collect()
        }
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HypothesisResult {
    pub pair: String,
    pub sample_mean: f64,
    pub sample_std: f64,
    pub n: usize,
    pub target: f64,
    pub t_statistic: f64,
    pub p_value: f64,
    pub alpha: f64,
    pub reject_null: bool,
    #[serde(skip)]
    pub report_path: PathBuf,
}

/// Right-tailed one-sample t-test of H0: mean daily return <= `target`.
pub fn one_sample_t_test(returns: &[f64], target: f64) -> Result<(f64, f64), StatsError> {
    let n = returns.len();
    if n < 2 {
        return Err(StatsError::DegenerateGroup("returns".to_string()));
    }
    let t = (mean(returns) - target) / (sample_std(returns) / (n as f64).sqrt());
    let dist = StudentsT::new(0.0, 1.0, (n - 1) as f64)
        .map_err(|e| StatsError::Distribution(e.to_string()))?;
    let p = if t.is_nan() { f64::NAN } else { 1.0 - dist.cdf(t) };
    Ok((t, p))
}

/// Test whether the mean daily return of `pair` exceeds `target` and write
/// `hypothesis_test_report_{PAIR}.txt`. `None` when no returns exist.
pub fn perform_hypothesis_test(
    frame: &Frame,
    pair: &str,
    target: f64,
    dir: &Path,
    alpha: f64,
) -> Result<Option<HypothesisResult>, StatsError> {
    info!("Starting hypothesis test for {}...", pair);
    let returns = daily_returns(frame);
    if returns.len() < 2 {
        warn!("Could not compute daily returns for {}, hypothesis test cancelled", pair);
        return Ok(None);
    }

    let sample_mean = mean(&returns);
    let sample_std = sample_std(&returns);
    let (t_statistic, p_value) = one_sample_t_test(&returns, target)?;
    let reject_null = p_value < alpha;

    info!("  --- Hypothesis test results for {} ---", pair);
    info!("  Sample mean return: {:.6}", sample_mean);
    info!("  Target return (H0): {:.6}", target);
    info!("  t statistic: {:.4}", t_statistic);
    info!("  p-value: {:.4}", p_value);

    let verdict = if reject_null {
        "Reject the null hypothesis. There is statistical evidence that"
    } else {
        "Fail to reject the null hypothesis. There is no statistical evidence that"
    };
    let conclusion = format!(
        "{verdict} the mean daily return of {pair} is ABOVE {:.2}%.",
        target * 100.0
    );
    info!("  Conclusion: {}", conclusion);

    fs::create_dir_all(dir)?;
    let report_path = dir.join(format!("hypothesis_test_report_{pair}.txt"));
    let report = format!(
        "Hypothesis test report for {pair}\n{}\n\
         H0: mean daily return <= {:.2}%\n\
         H1: mean daily return > {:.2}%\n\
         Significance level (alpha): {alpha}\n\n\
         Sample mean return: {sample_mean:.6}\n\
         Sample standard deviation: {sample_std:.6}\n\
         Sample size (n): {}\n\
         t statistic: {t_statistic:.4}\n\
         p-value: {p_value:.4}\n\n\
         Conclusion: {conclusion}\n",
        "-".repeat(50),
        target * 100.0,
        target * 100.0,
        returns.len(),
    );
    fs::write(&report_path, report)?;
    info!("Report saved to {}", report_path.display());

    Ok(Some(HypothesisResult {
        pair: pair.to_string(),
        sample_mean,
        sample_std,
        n: returns.len(),
        target,
        t_statistic,
        p_value,
        alpha,
        reject_null,
        report_path,
    }))
}

#[derive(Debug, Clone, Copy)]
pub struct OneWayAnova {
    pub f_statistic: f64,
    pub p_value: f64,
    pub df_between: f64,
    pub df_within: f64,
    pub mse_within: f64,
}

pub fn one_way_anova(groups: &[(String, Vec<f64>)]) -> Result<OneWayAnova, StatsError> {
    if groups.len() < 2 {
        return Err(StatsError::NotEnoughGroups {
            needed: 2,
            available: groups.len(),
        });
    }
    if let Some((name, _)) = groups.iter().find(|(_, v)| v.is_empty()) {
        return Err(StatsError::DegenerateGroup(name.clone()));
    }

    let total: usize = groups.iter().map(|(_, v)| v.len()).sum();
    let grand_mean = groups.iter().flat_map(|(_, v)| v.iter()).sum::<f64>() / total as f64;
    let (mut ss_between, mut ss_within) = (0.0, 0.0);
    for (_, values) in groups {
        let m = mean(values);
        ss_between += values.len() as f64 * (m - grand_mean).powi(2);
        ss_within += values.iter().map(|v| (v - m).powi(2)).sum::<f64>();
    }

    let df_between = (groups.len() - 1) as f64;
    let df_within = (total - groups.len()) as f64;
    if df_within < 1.0 {
        return Err(StatsError::DegenerateGroup("all groups".to_string()));
    }
    let mse_within = ss_within / df_within;
    let f_statistic = (ss_between / df_between) / mse_within;
    let p_value = if f_statistic.is_nan() {
        f64::NAN
    } else if f_statistic.is_infinite() {
        0.0
    } else {
        let dist = FisherSnedecor::new(df_between, df_within)
            .map_err(|e| StatsError::Distribution(e.to_string()))?;
        1.0 - dist.cdf(f_statistic)
    };

    Ok(OneWayAnova {
        f_statistic,
        p_value,
        df_between,
        df_within,
        mse_within,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TukeyComparison {
    pub group1: String,
    pub group2: String,
    pub mean_diff: f64,
    pub p_adj: f64,
    pub lower: f64,
    pub upper: f64,
    pub reject: bool,
}

/// All pairwise comparisons with family-wise error rate `alpha`. Group
/// labels are compared in sorted order and `mean_diff` is `group2 - group1`.
pub fn tukey_hsd(groups: &[(String, Vec<f64>)], alpha: f64) -> Result<Vec<TukeyComparison>, StatsError> {
    let anova = one_way_anova(groups)?;
    let k = groups.len();
    let q_crit = qtukey(1.0 - alpha, k, anova.df_within);

    let mut sorted: Vec<&(String, Vec<f64>)> = groups.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut comparisons = Vec::with_capacity(k * (k - 1) / 2);
    for i in 0..k {
        for j in i + 1..k {
            let (name_i, a) = sorted[i];
            let (name_j, b) = sorted[j];
            let mean_diff = mean(b) - mean(a);
            let se = (anova.mse_within / 2.0 * (1.0 / a.len() as f64 + 1.0 / b.len() as f64)).sqrt();
            let q = mean_diff.abs() / se;
            let p_adj = (1.0 - ptukey(q, k, anova.df_within)).clamp(0.0, 1.0);
            let margin = q_crit * se;
            comparisons.push(TukeyComparison {
                group1: name_i.clone(),
                group2: name_j.clone(),
                mean_diff,
                p_adj,
                lower: mean_diff - margin,
                upper: mean_diff + margin,
                reject: mean_diff.abs() > margin,
            });
        }
    }
    Ok(comparisons)
}

pub fn format_tukey_table(rows: &[TukeyComparison], alpha: f64) -> String {
    let width = 66;
    let mut table = format!(
        "Multiple Comparison of Means - Tukey HSD, FWER={alpha:.2}\n{}\n",
        "=".repeat(width)
    );
    table.push_str(&format!(
        "{:<12}{:<12}{:>10}{:>8}{:>10}{:>10}{:>7}\n{}\n",
        "group1", "group2", "meandiff", "p-adj", "lower", "upper", "reject",
        "-".repeat(width)
    ));
    for r in rows {
        table.push_str(&format!(
            "{:<12}{:<12}{:>10.4}{:>8.4}{:>10.4}{:>10.4}{:>7}\n",
            r.group1, r.group2, r.mean_diff, r.p_adj, r.lower, r.upper, r.reject
        ));
    }
    table.push_str(&"-".repeat(width));
    table.push('\n');
    table
}

fn write_tukey_csv(path: &Path, rows: &[TukeyComparison]) -> Result<(), StatsError> {
    let mut writer = Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct AnovaResult {
    pub label: String,
    pub groups: Vec<String>,
    pub f_statistic: f64,
    pub p_value: f64,
    pub reject_null: bool,
    pub tukey: Option<Vec<TukeyComparison>>,
    #[serde(skip)]
    pub report_path: PathBuf,
}

/// ANOVA over `groups`, followed by Tukey HSD when the null is rejected.
/// The report goes to `dir/report_file`, the Tukey table also to a
/// `tukey_hsd_*.csv` next to it.
pub fn run_anova_and_tukey(
    groups: &[(String, Vec<f64>)],
    label: &str,
    report_file: &str,
    dir: &Path,
    alpha: f64,
) -> Result<AnovaResult, StatsError> {
    info!("Running ANOVA across '{}' groups...", label);
    let names: Vec<String> = groups.iter().map(|(n, _)| n.clone()).collect();
    let anova = one_way_anova(groups)?;
    let reject_null = anova.p_value < alpha;

    info!("  --- ANOVA across {}s ---", label);
    info!("  Groups: {:?}", names);
    info!("  F statistic: {:.4}", anova.f_statistic);
    info!("  p-value: {:.4}", anova.p_value);

    let conclusion = if reject_null {
        format!("Reject the null hypothesis. Mean returns differ significantly between {label}s.")
    } else {
        format!("Fail to reject the null hypothesis. No significant difference in mean returns between {label}s.")
    };
    info!("  Conclusion: {}", conclusion);

    fs::create_dir_all(dir)?;
    let tukey = if reject_null {
        let rows = tukey_hsd(groups, alpha)?;
        info!("Post-hoc results (Tukey HSD):\n{}", format_tukey_table(&rows, alpha));
        let stem = Path::new(report_file)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("anova_report");
        let csv_name = format!("{}.csv", stem.replacen("anova_report", "tukey_hsd", 1));
        let csv_path = dir.join(csv_name);
        write_tukey_csv(&csv_path, &rows)?;
        info!("Tukey HSD table saved to {}", csv_path.display());
        Some(rows)
    } else {
        None
    };

    let mut report = format!(
        "Analysis of Variance (ANOVA) report - {label}s\n{}\n\
         Groups: {}\n\
         H0: mean returns are equal across groups.\n\
         H1: at least one mean return differs.\n\
         Significance level (alpha): {alpha}\n\n\
         F statistic: {:.4}\n\
         p-value: {:.4}\n\n\
         Conclusion: {conclusion}\n",
        "-".repeat(70),
        names.join(", "),
        anova.f_statistic,
        anova.p_value,
    );
    if let Some(rows) = &tukey {
        report.push_str("\nPost-hoc results (Tukey HSD):\n");
        report.push_str(&format_tukey_table(rows, alpha));
    }
    let report_path = dir.join(report_file);
    fs::write(&report_path, report)?;
    info!("ANOVA report saved to {}", report_path.display());

    Ok(AnovaResult {
        label: label.to_string(),
        groups: names,
        f_statistic: anova.f_statistic,
        p_value: anova.p_value,
        reject_null,
        tukey,
        report_path,
    })
}

#[derive(Debug, Clone)]
pub struct AnovaSummary {
    pub by_asset: AnovaResult,
    pub by_volatility: Option<AnovaResult>,
}

/// Split assets into low, medium and high volatility around the 33rd and
/// 66th percentiles of their return standard deviations. Empty groups are
/// dropped and each group's returns are concatenated.
pub fn volatility_groups(returns: &[(String, Vec<f64>)]) -> Vec<(String, Vec<f64>)> {
    let vols: Vec<f64> = returns.iter().map(|(_, r)| sample_std(r)).collect();
    let mut sorted: Vec<f64> = vols.iter().copied().filter(|v| !v.is_nan()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let low = quantile(&sorted, 0.33);
    let high = quantile(&sorted, 0.66);

    let mut groups: Vec<(String, Vec<f64>)> = ["Low Volatility", "Medium Volatility", "High Volatility"]
        .iter()
        .map(|name| (name.to_string(), Vec::new()))
        .collect();
    for ((_, r), vol) in returns.iter().zip(&vols) {
        let bucket = if *vol <= low {
            0
        } else if *vol <= high {
            1
        } else if *vol > high {
            2
        } else {
            continue;
        };
        groups[bucket].1.extend_from_slice(r);
    }
    groups.retain(|(_, r)| !r.is_empty());
    groups
}

/// ANOVA of daily returns across assets, then across volatility groups.
/// Needs at least two assets with returns; the volatility grouping needs
/// three.
pub fn perform_anova_analysis(
    assets: &[(String, Frame)],
    dir: &Path,
    alpha: f64,
) -> Result<AnovaSummary, StatsError> {
    info!("Starting ANOVA analysis...");
    fs::create_dir_all(dir)?;

    let mut returns = Vec::new();
    for (name, frame) in assets {
        let r = daily_returns(frame);
        if r.is_empty() {
            warn!("Skipping {} in ANOVA, no valid returns", name);
        } else {
            returns.push((name.replace("_USDT", ""), r));
        }
    }
    if returns.len() < 2 {
        error!("At least two assets with valid data are needed for ANOVA");
        return Err(StatsError::NotEnoughGroups {
            needed: 2,
            available: returns.len(),
        });
    }

    let by_asset = run_anova_and_tukey(&returns, "Cryptocurrency", ALL_ASSETS_REPORT, dir, alpha)?;

    info!("Running ANOVA across volatility groups...");
    if returns.len() < 3 {
        warn!("Not enough assets to group by volatility, at least 3 are needed");
        return Ok(AnovaSummary {
            by_asset,
            by_volatility: None,
        });
    }
    let groups = volatility_groups(&returns);
    if groups.len() < 2 {
        warn!("Fewer than 2 volatility groups formed, group ANOVA cancelled");
        return Ok(AnovaSummary {
            by_asset,
            by_volatility: None,
        });
    }
    let by_volatility = run_anova_and_tukey(&groups, "Volatility Group", VOLATILITY_REPORT, dir, alpha)?;

    Ok(AnovaSummary {
        by_asset,
        by_volatility: Some(by_volatility),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, NaiveDate};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    fn price_frame(returns: &[f64], start_price: f64) -> Frame {
        let start = NaiveDate::from_ymd_opt(2022, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let mut close = vec![start_price];
        for r in returns {
            let last = close[close.len() - 1];
            close.push(last * (1.0 + r));
        }
        let dates = (0..close.len()).map(|i| start + Duration::days(i as i64)).collect();
        Frame::from_columns(dates, vec![("close".to_string(), close)]).unwrap()
    }

    fn normal_returns(seed: u64, mean: f64, std: f64, n: usize) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let dist = Normal::new(mean, std).unwrap();
        (0..n).map(|_| dist.sample(&mut rng)).collect()
    }

    #[test]
    fn test_daily_returns_drop_leading_nan() {
        let frame = price_frame(&[0.1, -0.5], 100.0);
        let r = daily_returns(&frame);
        assert_eq!(r.len(), 2);
        assert_relative_eq!(r[0], 0.1, epsilon = 1e-12);
        assert!(daily_returns(&Frame::default()).is_empty());
    }

    #[test]
    fn test_t_test_known_values() {
        // mean 3, sd 1.5811, n 5 against 2: t = 1.4142.
        let (t, p) = one_sample_t_test(&[1.0, 2.0, 3.0, 4.0, 5.0], 2.0).unwrap();
        assert_relative_eq!(t, 2f64.sqrt(), epsilon = 1e-9);
        let dist = StudentsT::new(0.0, 1.0, 4.0).unwrap();
        assert_relative_eq!(p, 1.0 - dist.cdf(2f64.sqrt()), epsilon = 1e-12);
        assert!(p > 0.05 && p < 0.2);
    }

    #[test]
    fn test_hypothesis_report() {
        let dir = tempfile::tempdir().unwrap();
        let frame = price_frame(&normal_returns(1, 0.02, 0.01, 200), 100.0);
        let result = perform_hypothesis_test(&frame, "BTC_USDT", 0.01, dir.path(), 0.05)
            .unwrap()
            .unwrap();
        assert!(result.reject_null);
        assert_eq!(result.n, 200);
        assert!(result.report_path.ends_with("hypothesis_test_report_BTC_USDT.txt"));
        assert!(result.report_path.exists());
    }

    #[test]
    fn test_anova_matches_hand_computation() {
        let groups = vec![
            ("a".to_string(), vec![1.0, 2.0, 3.0]),
            ("b".to_string(), vec![4.0, 5.0, 6.0]),
        ];
        let anova = one_way_anova(&groups).unwrap();
        // SSB = 13.5, SSW = 4, F = 13.5 / (4 / 4).
        assert_relative_eq!(anova.f_statistic, 13.5, epsilon = 1e-12);
        assert!(anova.p_value < 0.05);
    }

    #[test]
    fn test_tukey_two_groups() {
        let groups = vec![
            ("b".to_string(), vec![4.0, 5.0, 6.0]),
            ("a".to_string(), vec![1.0, 2.0, 3.0]),
        ];
        let rows = tukey_hsd(&groups, 0.05).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group1, "a");
        assert_relative_eq!(rows[0].mean_diff, 3.0);
        // With two groups the HSD p-value equals the ANOVA p-value.
        let anova = one_way_anova(&groups).unwrap();
        assert!((rows[0].p_adj - anova.p_value).abs() < 1e-4);
        assert!(rows[0].reject);
        assert!(rows[0].lower > 0.0);
    }

    #[test]
    fn test_volatility_groups() {
        let returns = vec![
            ("A".to_string(), vec![0.0, 0.01, -0.01]),
            ("B".to_string(), vec![0.0, 0.05, -0.05]),
            ("C".to_string(), vec![0.0, 0.10, -0.10]),
        ];
        let groups = volatility_groups(&returns);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].0, "Low Volatility");
        assert_eq!(groups[2].1.len(), 3);
    }

    #[test]
    fn test_anova_analysis_writes_reports() {
        let dir = tempfile::tempdir().unwrap();
        let assets = vec![
            ("BTC_USDT".to_string(), price_frame(&normal_returns(1, 0.03, 0.01, 150), 100.0)),
            ("ETH_USDT".to_string(), price_frame(&normal_returns(2, 0.0, 0.02, 150), 50.0)),
            ("LTC_USDT".to_string(), price_frame(&normal_returns(3, -0.03, 0.03, 150), 10.0)),
            ("EMPTY_USDT".to_string(), Frame::default()),
        ];
        let summary = perform_anova_analysis(&assets, dir.path(), 0.05).unwrap();
        assert_eq!(summary.by_asset.groups, vec!["BTC", "ETH", "LTC"]);
        assert!(summary.by_asset.reject_null);
        assert_eq!(summary.by_asset.tukey.as_ref().unwrap().len(), 3);
        assert!(dir.path().join(ALL_ASSETS_REPORT).exists());
        assert!(dir.path().join("tukey_hsd_all_cryptos.csv").exists());
        assert!(summary.by_volatility.is_some());
    }

    #[test]
    fn test_anova_needs_two_assets() {
        let dir = tempfile::tempdir().unwrap();
        let assets = vec![("BTC_USDT".to_string(), price_frame(&[0.01, 0.02], 1.0))];
        assert!(matches!(
            perform_anova_analysis(&assets, dir.path(), 0.05),
            Err(StatsError::NotEnoughGroups { .. })
        ));
    }
}
