//! Raw exchange CSV parsing and the basic indicator set computed on load.

use tracing::debug;

use super::frame::Frame;
use crate::error::DataError;
use crate::features::indicators::{pct_change, rolling_mean, rolling_std};

const DROPPED_COLUMNS: [&str; 3] = ["unix", "symbol", "tradecount"];

fn normalize_header(header: &str) -> String {
    header
        .split(',')
        .map(|h| h.trim().trim_matches('"').to_lowercase().replace(' ', "_"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a CryptoDataDownload export. Those files carry a banner line with
/// the source URL above the real header, which is skipped.
pub fn parse_raw_csv(text: &str) -> Result<Frame, DataError> {
    let text = text.trim_start_matches('\u{feff}');
    let mut lines = text.lines();
    let mut header = lines
        .next()
        .ok_or_else(|| DataError::Malformed("empty file".to_string()))?;
    if !header.trim().to_lowercase().starts_with("date") {
        debug!("Skipping banner line: {}", header);
        header = lines
            .next()
            .ok_or_else(|| DataError::Malformed("no header after banner".to_string()))?;
    }

    let mut normalized = normalize_header(header);
    normalized.push('\n');
    for line in lines {
        normalized.push_str(line);
        normalized.push('\n');
    }

    let mut frame = Frame::from_reader(normalized.as_bytes())?;
    for name in DROPPED_COLUMNS {
        frame.drop_column(name);
    }
    frame.sort_by_date();
    Ok(frame)
}

/// Adds `daily_return`, `moving_average`, `volatility`, `cumulative_return`,
/// `short_mavg`, `long_mavg` and the crossover `signal`.
pub fn calculate_financial_indicators(frame: &mut Frame, window: usize) -> Result<(), DataError> {
    frame.drop_na_in("close")?;
    let close = frame.require("close")?.to_vec();

    let daily_return = pct_change(&close);
    let moving_average = rolling_mean(&close, window);
    let volatility = rolling_std(&daily_return, window);

    let mut cumulative = Vec::with_capacity(close.len());
    let mut acc = 1.0;
    for r in &daily_return {
        acc *= 1.0 + if r.is_nan() { 0.0 } else { *r };
        cumulative.push(acc);
    }

    let short_mavg = rolling_mean(&close, 10);
    let long_mavg = rolling_mean(&close, 30);
    let signal = crossover_signal(&short_mavg, &long_mavg);

    frame.insert_column("daily_return", daily_return)?;
    frame.insert_column("moving_average", moving_average)?;
    frame.insert_column("volatility", volatility)?;
    frame.insert_column("cumulative_return", cumulative)?;
    frame.insert_column("short_mavg", short_mavg)?;
    frame.insert_column("long_mavg", long_mavg)?;
    frame.insert_column("signal", signal)?;
    Ok(())
}

/// +1 when the short average crosses above the long one, -1 when it crosses
/// below, 0 otherwise (including warm-up rows).
pub fn crossover_signal(short: &[f64], long: &[f64]) -> Vec<f64> {
    let mut signal = vec![0.0; short.len()];
    for i in 1..short.len() {
        let (s, l, ps, pl) = (short[i], long[i], short[i - 1], long[i - 1]);
        if s > l && ps <= pl {
            signal[i] = 1.0;
        } else if s < l && ps >= pl {
            signal[i] = -1.0;
        }
    }
    signal
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "https://www.CryptoDataDownload.com\n\
Unix,Date,Symbol,Open,High,Low,Close,Volume BTC,Volume USDT,tradecount\n\
1704153600,2024-01-02 00:00:00,BTC/USDT,101,103,100,102,10,1020,5\n\
1704067200,2024-01-01 00:00:00,BTC/USDT,100,102,99,101,12,1212,6\n\
1703980800,bad-date,BTC/USDT,1,1,1,1,1,1,1\n";

    #[test]
    fn test_parse_raw_csv_skips_banner_and_normalizes() {
        let frame = parse_raw_csv(RAW).unwrap();
        assert_eq!(frame.len(), 2);
        assert_eq!(
            frame.column_names(),
            vec!["open", "high", "low", "close", "volume_btc", "volume_usdt"]
        );
        assert_eq!(frame.column("close").unwrap(), &[101.0, 102.0]);
    }

    #[test]
    fn test_parse_raw_csv_requires_date() {
        let err = parse_raw_csv("open,close\n1,2\n").unwrap_err();
        assert!(matches!(err, DataError::MissingColumn(_)));
    }

    #[test]
    fn test_crossover_signal() {
        let short = [f64::NAN, 1.0, 3.0, 3.0, 1.0];
        let long = [f64::NAN, 2.0, 2.0, 2.0, 2.0];
        assert_eq!(crossover_signal(&short, &long), vec![0.0, 0.0, 1.0, 0.0, -1.0]);
    }

    #[test]
    fn test_financial_indicators_columns() {
        let mut frame = parse_raw_csv(RAW).unwrap();
        calculate_financial_indicators(&mut frame, 20).unwrap();
        let cumulative = frame.column("cumulative_return").unwrap();
        assert_eq!(cumulative[0], 1.0);
        assert!((cumulative[1] - 102.0 / 101.0).abs() < 1e-12);
        assert!(frame.column("moving_average").unwrap()[1].is_nan());
    }
}
