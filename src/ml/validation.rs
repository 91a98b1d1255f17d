//! Time-ordered splitting. Nothing here shuffles rows.

use nalgebra::{DMatrix, DVector};
use std::ops::Range;

use crate::error::ModelError;

/// Pair features of day T-1 with the target of day T. The result is one
/// row shorter than the input.
pub fn apply_lag(x: &DMatrix<f64>, y: &DVector<f64>) -> (DMatrix<f64>, DVector<f64>) {
    let n = x.nrows();
    if n < 2 {
        return (DMatrix::zeros(0, x.ncols()), DVector::zeros(0));
    }
    (x.rows(0, n - 1).into_owned(), y.rows(1, n - 1).into_owned())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldoutSplit {
    pub train: Range<usize>,
    pub validation: Option<Range<usize>>,
}

/// Chronological hold-out: the first `floor(n * (1 - test_size))` rows train.
pub fn holdout_split(n: usize, test_size: f64) -> HoldoutSplit {
    if test_size <= 0.0 {
        return HoldoutSplit {
            train: 0..n,
            validation: None,
        };
    }
    let split = ((n as f64) * (1.0 - test_size)).floor() as usize;
    HoldoutSplit {
        train: 0..split,
        validation: Some(split..n),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Range<usize>,
    pub test: Range<usize>,
}

/// Expanding-window folds: each fold tests the next `n / (k + 1)` rows
/// and trains on everything before them.
pub fn time_series_split(n: usize, k: usize) -> Result<Vec<Fold>, ModelError> {
    if k < 2 {
        return Err(ModelError::TrainingError(format!(
            "number of splits must be at least 2, got {k}"
        )));
    }
    if n < k + 1 {
        return Err(ModelError::InsufficientData {
            needed: k + 1,
            available: n,
        });
    }
    let test_size = n / (k + 1);
    Ok((0..k)
        .map(|i| {
            let test_start = n - (k - i) * test_size;
            Fold {
                train: 0..test_start,
                test: test_start..test_start + test_size,
            }
        })
        .collect())
}

pub fn take_rows(x: &DMatrix<f64>, rows: &Range<usize>) -> DMatrix<f64> {
    x.rows(rows.start, rows.len()).into_owned()
}

pub fn take_values(y: &DVector<f64>, rows: &Range<usize>) -> DVector<f64> {
    y.rows(rows.start, rows.len()).into_owned()
}
