//! Technical indicators over plain price slices.
//!
//! Every function returns a vector as long as its input, with NaN for rows
//! that are still inside the warm-up window.

/// Fractional change from the previous row.
pub fn pct_change(values: &[f64]) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    for i in 1..values.len() {
        out[i] = values[i] / values[i - 1] - 1.0;
    }
    out
}

/// Shift values down by `lag` rows, padding the top with NaN.
pub fn shift(values: &[f64], lag: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    for i in lag..values.len() {
        out[i] = values[i - lag];
    }
    out
}

fn rolling<F>(values: &[f64], window: usize, stat: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 || values.len() < window {
        return out;
    }
    for end in window..=values.len() {
        let slice = &values[end - window..end];
        if slice.iter().all(|v| !v.is_nan()) {
            out[end - 1] = stat(slice);
        }
    }
    out
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64], ddof: usize) -> f64 {
    if values.len() <= ddof {
        return f64::NAN;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - ddof) as f64
}

pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    rolling(values, window, mean)
}

/// Sample standard deviation (ddof = 1) over a trailing window.
pub fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    rolling(values, window, |s| variance(s, 1).sqrt())
}

/// Population standard deviation (ddof = 0) over a trailing window.
pub fn rolling_std_pop(values: &[f64], window: usize) -> Vec<f64> {
    rolling(values, window, |s| variance(s, 0).sqrt())
}

/// Recursive exponential average `y_t = (1 - a) * y_{t-1} + a * x_t`,
/// seeded with the first non-NaN value. Rows before `min_periods`
/// observations have been seen stay NaN.
pub fn ewm(values: &[f64], alpha: f64, min_periods: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    let mut state: Option<f64> = None;
    let mut seen = 0usize;
    for (i, &x) in values.iter().enumerate() {
        if !x.is_nan() {
            seen += 1;
            state = Some(match state {
                Some(prev) => (1.0 - alpha) * prev + alpha * x,
                None => x,
            });
        }
        if seen >= min_periods.max(1) {
            out[i] = state.unwrap_or(f64::NAN);
        }
    }
    out
}

/// Exponential moving average with `alpha = 2 / (span + 1)`.
pub fn ema(values: &[f64], span: usize) -> Vec<f64> {
    ewm(values, 2.0 / (span as f64 + 1.0), span)
}

/// Relative Strength Index with Wilder smoothing.
pub fn rsi(close: &[f64], window: usize) -> Vec<f64> {
    let diff: Vec<f64> = (0..close.len())
        .map(|i| if i == 0 { f64::NAN } else { close[i] - close[i - 1] })
        .collect();
    // NaN compares false, so the first row counts as a zero move.
    let up: Vec<f64> = diff.iter().map(|&d| if d > 0.0 { d } else { 0.0 }).collect();
    let down: Vec<f64> = diff.iter().map(|&d| if d < 0.0 { -d } else { 0.0 }).collect();

    let alpha = 1.0 / window as f64;
    let ema_up = ewm(&up, alpha, window);
    let ema_down = ewm(&down, alpha, window);

    ema_up
        .iter()
        .zip(ema_down.iter())
        .map(|(&u, &d)| {
            if d == 0.0 {
                100.0
            } else {
                100.0 - 100.0 / (1.0 + u / d)
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Macd {
    pub line: Vec<f64>,
    pub signal: Vec<f64>,
    pub diff: Vec<f64>,
}

pub fn macd(close: &[f64], fast: usize, slow: usize, signal_span: usize) -> Macd {
    let ema_fast = ema(close, fast);
    let ema_slow = ema(close, slow);
    let line: Vec<f64> = ema_fast
        .iter()
        .zip(ema_slow.iter())
        .map(|(f, s)| f - s)
        .collect();
    let signal = ema(&line, signal_span);
    let diff = line.iter().zip(signal.iter()).map(|(l, s)| l - s).collect();
    Macd { line, signal, diff }
}

#[derive(Debug, Clone)]
pub struct Bollinger {
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
    pub mavg: Vec<f64>,
}

pub fn bollinger(close: &[f64], window: usize, width: f64) -> Bollinger {
    let mavg = rolling_mean(close, window);
    let std = rolling_std_pop(close, window);
    let upper = mavg.iter().zip(&std).map(|(m, s)| m + width * s).collect();
    let lower = mavg.iter().zip(&std).map(|(m, s)| m - width * s).collect();
    Bollinger { upper, lower, mavg }
}

/// On-balance volume: running sum of volume signed by the close direction.
pub fn obv(close: &[f64], volume: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(close.len());
    let mut acc = 0.0;
    for i in 0..close.len() {
        let down = i > 0 && close[i] < close[i - 1];
        acc += if down { -volume[i] } else { volume[i] };
        out.push(acc);
    }
    out
}
