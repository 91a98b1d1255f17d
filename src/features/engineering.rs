use tracing::{debug, warn};

use super::indicators::{
    bollinger, macd, obv, pct_change, rolling_mean, rolling_std, rsi, shift, Macd,
};
use crate::data::frame::Frame;
use crate::error::DataError;

const PRICE_COLUMNS: [&str; 4] = ["open", "high", "low", "close"];
const VOLUME_CANDIDATES: [&str; 3] = ["volume", "volume_eth", "volume_usdt"];

const RSI_WINDOW: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const BOLLINGER_WINDOW: usize = 20;
const BOLLINGER_WIDTH: f64 = 2.0;

/// `sma_{w}` and `std_{w}` of `close` for each window.
pub fn create_moving_average_features(frame: &mut Frame, windows: &[usize]) -> Result<(), DataError> {
    let close = frame.require("close")?.to_vec();
    for &window in windows {
        let (sma, std) = if close.len() >= window {
            (rolling_mean(&close, window), rolling_std(&close, window))
        } else {
            warn!(
                "Frame too short ({} rows) for SMA/STD with window {}, filling with NaN",
                close.len(),
                window
            );
            (vec![f64::NAN; close.len()], vec![f64::NAN; close.len()])
        };
        frame.insert_column(&format!("sma_{window}"), sma)?;
        frame.insert_column(&format!("std_{window}"), std)?;
    }
    Ok(())
}

fn scaled_volatility(returns: &[f64], window: usize) -> Vec<f64> {
    if returns.len() < window {
        warn!("Frame too short for volatility_{}d", window);
        return vec![f64::NAN; returns.len()];
    }
    let factor = (window as f64).sqrt();
    rolling_std(returns, window).into_iter().map(|s| s * factor).collect()
}

fn nan_unless(len: usize, min_rows: usize, series: impl FnOnce() -> Vec<f64>) -> Vec<f64> {
    if len >= min_rows {
        series()
    } else {
        vec![f64::NAN; len]
    }
}

/// Full feature set used for training. Rows left with any NaN are dropped.
pub fn create_technical_features(frame: &Frame, windows: &[usize]) -> Result<Frame, DataError> {
    let mut featured = frame.clone();
    create_moving_average_features(&mut featured, windows)?;

    let close = featured.require("close")?.to_vec();
    let n = close.len();
    let daily_return = pct_change(&close);

    featured.insert_column("volatility_7d", scaled_volatility(&daily_return, 7))?;
    featured.insert_column("volatility_30d", scaled_volatility(&daily_return, 30))?;
    featured.insert_column("daily_return", daily_return)?;
    featured.insert_column("close_lag1", shift(&close, 1))?;
    featured.insert_column("close_lag5", shift(&close, 5))?;

    let missing: Vec<&str> = PRICE_COLUMNS
        .iter()
        .copied()
        .filter(|c| !featured.has_column(c))
        .collect();
    let volume_col = VOLUME_CANDIDATES.iter().copied().find(|c| featured.has_column(c));

    match volume_col {
        Some(volume_col) if missing.is_empty() => {
            if n < RSI_WINDOW {
                warn!("Frame too short for RSI");
            }
            featured.insert_column("rsi", nan_unless(n, RSI_WINDOW, || rsi(&close, RSI_WINDOW)))?;

            let m = if n >= MACD_SLOW {
                macd(&close, MACD_FAST, MACD_SLOW, MACD_SIGNAL)
            } else {
                let empty = vec![f64::NAN; n];
                Macd {
                    line: empty.clone(),
                    signal: empty.clone(),
                    diff: empty,
                }
            };
            featured.insert_column("macd", m.line)?;
            featured.insert_column("macd_signal", m.signal)?;
            featured.insert_column("macd_diff", m.diff)?;

            let bands = bollinger(&close, BOLLINGER_WINDOW, BOLLINGER_WIDTH);
            featured.insert_column("bb_upper", bands.upper)?;
            featured.insert_column("bb_lower", bands.lower)?;
            featured.insert_column("bb_mavg", bands.mavg)?;

            let volume = featured.require(volume_col)?.to_vec();
            featured.insert_column("obv", obv(&close, &volume))?;
        }
        _ => {
            let volume_like: Vec<&str> = featured
                .column_names()
                .into_iter()
                .filter(|c| c.contains("volume"))
                .collect();
            warn!(
                "Missing columns for technical indicators: {:?}. Volume columns available: {:?}. Columns: {:?}",
                missing,
                volume_like,
                featured.column_names()
            );
        }
    }

    let before = featured.len();
    featured.drop_na();
    debug!("Dropped {} warm-up rows, {} remain", before - featured.len(), featured.len());
    Ok(featured)
}
