//! Column-oriented table of dated `f64` series.
//!
//! Missing values are NaN, so every column has one value per date.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use csv::{ReaderBuilder, Writer};
use nalgebra::DMatrix;
use std::collections::HashMap;
use std::io::Read;
use std::ops::Range;
use std::path::Path;

use crate::error::DataError;

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
];
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y"];

/// Parse the date formats seen in exchange exports and BACEN responses.
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(d.and_time(NaiveTime::MIN));
        }
    }
    None
}

fn parse_value(raw: &str) -> f64 {
    raw.trim().parse::<f64>().unwrap_or(f64::NAN)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    dates: Vec<NaiveDateTime>,
    columns: Vec<(String, Vec<f64>)>,
}

impl Frame {
    pub fn new(dates: Vec<NaiveDateTime>) -> Self {
        Self {
            dates,
            columns: Vec::new(),
        }
    }

    pub fn from_columns(
        dates: Vec<NaiveDateTime>,
        columns: Vec<(String, Vec<f64>)>,
    ) -> Result<Self, DataError> {
        let mut frame = Self::new(dates);
        for (name, values) in columns {
            frame.insert_column(&name, values)?;
        }
        Ok(frame)
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDateTime] {
        &self.dates
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn require(&self, name: &str) -> Result<&[f64], DataError> {
        self.column(name)
            .ok_or_else(|| DataError::MissingColumn(name.to_string()))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Adds a column, or replaces it in place when the name already exists.
    pub fn insert_column(&mut self, name: &str, values: Vec<f64>) -> Result<(), DataError> {
        if values.len() != self.dates.len() {
            return Err(DataError::LengthMismatch {
                name: name.to_string(),
                expected: self.dates.len(),
                actual: values.len(),
            });
        }
        match self.columns.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = values,
            None => self.columns.push((name.to_string(), values)),
        }
        Ok(())
    }

    pub fn drop_column(&mut self, name: &str) -> Option<Vec<f64>> {
        let idx = self.columns.iter().position(|(n, _)| n == name)?;
        Some(self.columns.remove(idx).1)
    }

    /// New frame holding only `names`, in the given order.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Frame, DataError> {
        let mut out = Frame::new(self.dates.clone());
        for name in names {
            let name = name.as_ref();
            out.columns
                .push((name.to_string(), self.require(name)?.to_vec()));
        }
        Ok(out)
    }

    pub fn retain_rows(&mut self, keep: &[bool]) {
        let mut flags = keep.iter();
        self.dates.retain(|_| *flags.next().unwrap_or(&false));
        for (_, values) in &mut self.columns {
            let mut flags = keep.iter();
            values.retain(|_| *flags.next().unwrap_or(&false));
        }
    }

    /// Drop every row holding a NaN in any column.
    pub fn drop_na(&mut self) {
        let keep: Vec<bool> = (0..self.len())
            .map(|i| self.columns.iter().all(|(_, v)| !v[i].is_nan()))
            .collect();
        self.retain_rows(&keep);
    }

    /// Drop rows where the named column is NaN.
    pub fn drop_na_in(&mut self, name: &str) -> Result<(), DataError> {
        let keep: Vec<bool> = self.require(name)?.iter().map(|v| !v.is_nan()).collect();
        self.retain_rows(&keep);
        Ok(())
    }

    pub fn slice(&self, range: Range<usize>) -> Frame {
        let range = range.start.min(self.len())..range.end.min(self.len());
        Frame {
            dates: self.dates[range.clone()].to_vec(),
            columns: self
                .columns
                .iter()
                .map(|(n, v)| (n.clone(), v[range.clone()].to_vec()))
                .collect(),
        }
    }

    pub fn sort_by_date(&mut self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by_key(|&i| self.dates[i]);
        self.dates = order.iter().map(|&i| self.dates[i]).collect();
        for (_, values) in &mut self.columns {
            *values = order.iter().map(|&i| values[i]).collect();
        }
    }

    /// Row-major design matrix of every column.
    pub fn to_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.len(), self.columns.len(), |r, c| self.columns[c].1[r])
    }

    /// Attach an external daily series by calendar date; unmatched rows get NaN.
    pub fn left_join_on_date(&mut self, name: &str, series: &[(NaiveDate, f64)]) {
        let lookup: HashMap<NaiveDate, f64> = series.iter().copied().collect();
        let values: Vec<f64> = self
            .dates
            .iter()
            .map(|d| lookup.get(&d.date()).copied().unwrap_or(f64::NAN))
            .collect();
        // Lengths match by construction.
        let _ = self.insert_column(name, values);
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Frame, DataError> {
        let mut rdr = ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.to_string()).collect();
        let date_idx = headers
            .iter()
            .position(|h| h == "date")
            .ok_or_else(|| DataError::MissingColumn("date".to_string()))?;

        let mut dates = Vec::new();
        let mut raw_columns: Vec<Vec<f64>> = vec![Vec::new(); headers.len()];
        let mut numeric_seen = vec![false; headers.len()];

        for record in rdr.records() {
            let record = record?;
            let Some(date) = record.get(date_idx).and_then(parse_datetime) else {
                continue;
            };
            dates.push(date);
            for (i, column) in raw_columns.iter_mut().enumerate() {
                if i == date_idx {
                    continue;
                }
                let value = record.get(i).map(parse_value).unwrap_or(f64::NAN);
                numeric_seen[i] |= !value.is_nan();
                column.push(value);
            }
        }

        let mut frame = Frame::new(dates);
        for (i, (name, values)) in headers.into_iter().zip(raw_columns).enumerate() {
            // Text columns (symbol and the like) carry nothing a model can use.
            if i == date_idx || !numeric_seen[i] {
                continue;
            }
            frame.insert_column(&name, values)?;
        }
        Ok(frame)
    }

    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Frame, DataError> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_reader(file)
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), DataError> {
        let mut writer = Writer::from_path(path.as_ref())?;
        let mut header = vec!["date".to_string()];
        header.extend(self.columns.iter().map(|(n, _)| n.clone()));
        writer.write_record(&header)?;

        for (row, date) in self.dates.iter().enumerate() {
            let mut record = Vec::with_capacity(header.len());
            record.push(date.format("%Y-%m-%d %H:%M:%S").to_string());
            for (_, values) in &self.columns {
                let v = values[row];
                record.push(if v.is_nan() { String::new() } else { v.to_string() });
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_time(NaiveTime::MIN)
    }

    fn sample() -> Frame {
        Frame::from_columns(
            vec![day(3), day(1), day(2)],
            vec![
                ("close".to_string(), vec![3.0, 1.0, f64::NAN]),
                ("volume".to_string(), vec![30.0, 10.0, 20.0]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_parse_datetime_formats() {
        assert_eq!(parse_datetime("2024-01-02"), Some(day(2)));
        assert_eq!(parse_datetime("2024-01-02 00:00:00"), Some(day(2)));
        assert_eq!(parse_datetime("02/01/2024"), Some(day(2)));
        assert!(parse_datetime("not a date").is_none());
    }

    #[test]
    fn test_insert_rejects_wrong_length() {
        let mut frame = sample();
        assert!(frame.insert_column("bad", vec![1.0]).is_err());
    }

    #[test]
    fn test_insert_replaces_existing_column() {
        let mut frame = sample();
        frame.insert_column("close", vec![0.0, 0.0, 0.0]).unwrap();
        assert_eq!(frame.n_columns(), 2);
        assert_eq!(frame.column("close").unwrap(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_sort_and_drop_na() {
        let mut frame = sample();
        frame.sort_by_date();
        assert_eq!(frame.dates()[0], day(1));
        assert_eq!(frame.column("volume").unwrap(), &[10.0, 20.0, 30.0]);

        frame.drop_na();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.column("close").unwrap(), &[1.0, 3.0]);
    }

    #[test]
    fn test_select_and_matrix() {
        let frame = sample();
        let selected = frame.select(&["volume"]).unwrap();
        assert_eq!(selected.column_names(), vec!["volume"]);
        let m = frame.to_matrix();
        assert_eq!(m.shape(), (3, 2));
        assert_eq!(m[(0, 1)], 30.0);
        assert!(frame.select(&["missing"]).is_err());
    }

    #[test]
    fn test_left_join_on_date() {
        let mut frame = sample();
        let series = vec![(day(1).date(), 5.1), (day(3).date(), 5.3)];
        frame.left_join_on_date("usd_brl", &series);
        let joined = frame.column("usd_brl").unwrap();
        assert_eq!(joined[0], 5.3);
        assert_eq!(joined[1], 5.1);
        assert!(joined[2].is_nan());
    }

    #[test]
    fn test_csv_round_trip_keeps_nan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.csv");
        let frame = sample();
        frame.write_csv(&path).unwrap();

        let loaded = Frame::read_csv(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.column_names(), vec!["close", "volume"]);
        assert!(loaded.column("close").unwrap()[2].is_nan());
    }

    #[test]
    fn test_text_columns_are_skipped() {
        let csv = "date,symbol,close\n2024-01-01,BTC/USDT,1.5\n2024-01-02,BTC/USDT,2.5\n";
        let frame = Frame::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(frame.column_names(), vec!["close"]);
    }
}
