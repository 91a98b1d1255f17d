//! USD/BRL exchange rate from the Brazilian central bank (BACEN SGS series 1).

use chrono::{Duration, NaiveDate};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use tracing::{info, warn};

use super::client::{build_http_client, fetch_text};
use super::frame::Frame;
use crate::error::DataError;

const BACEN_SERIES_URL: &str = "https://api.bcb.gov.br/dados/serie/bcdata.sgs.1/dados";
/// The SGS API refuses ranges longer than ten years.
const MAX_BLOCK_DAYS: i64 = 3652;

#[derive(Debug, Deserialize)]
struct SgsRow {
    data: String,
    valor: String,
}

/// Rows of one SGS response. Values use a comma as decimal separator.
pub fn parse_sgs_payload(body: &str) -> Result<Vec<(NaiveDate, f64)>, DataError> {
    let rows: Vec<SgsRow> =
        serde_json::from_str(body).map_err(|e| DataError::Malformed(e.to_string()))?;
    rows.into_iter()
        .map(|row| {
            let date = NaiveDate::parse_from_str(row.data.trim(), "%d/%m/%Y")
                .map_err(|e| DataError::Malformed(format!("date '{}': {}", row.data, e)))?;
            let value = row
                .valor
                .trim()
                .replace(',', ".")
                .parse::<f64>()
                .map_err(|e| DataError::Malformed(format!("value '{}': {}", row.valor, e)))?;
            Ok((date, value))
        })
        .collect()
}

/// Split `[start, end]` into consecutive inclusive blocks of at most
/// `MAX_BLOCK_DAYS` days.
pub fn request_blocks(start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let mut blocks = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let block_end = (cursor + Duration::days(MAX_BLOCK_DAYS)).min(end);
        blocks.push((cursor, block_end));
        cursor = block_end + Duration::days(1);
    }
    blocks
}

pub fn sgs_url(start: NaiveDate, end: NaiveDate) -> String {
    format!(
        "{}?formato=json&dataInicial={}&dataFinal={}",
        BACEN_SERIES_URL,
        start.format("%d/%m/%Y"),
        end.format("%d/%m/%Y")
    )
}

#[derive(Clone)]
pub struct ExternalDataClient {
    http_client: HttpClient,
}

impl ExternalDataClient {
    pub fn new() -> Result<Self, DataError> {
        Ok(Self {
            http_client: build_http_client()?,
        })
    }

    async fn try_fetch_usd_brl(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<(NaiveDate, f64)>, DataError> {
        let mut series = Vec::new();
        for (block_start, block_end) in request_blocks(start, end) {
            let body = fetch_text(&self.http_client, &sgs_url(block_start, block_end), "application/json").await?;
            series.extend(parse_sgs_payload(&body)?);
        }
        series.sort_by_key(|(d, _)| *d);
        Ok(series)
    }

    /// Daily USD/BRL selling rate between `start` and `end`. Failures are
    /// logged and yield an empty series.
    pub async fn fetch_usd_brl(&self, start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, f64)> {
        match self.try_fetch_usd_brl(start, end).await {
            Ok(series) if series.is_empty() => {
                warn!("No USD/BRL quotes found between {} and {}", start, end);
                series
            }
            Ok(series) => {
                info!("Fetched {} USD/BRL quotes", series.len());
                series
            }
            Err(e) => {
                warn!("Failed to fetch USD/BRL from BACEN: {}", e);
                Vec::new()
            }
        }
    }
}

/// Left-join `usd_brl` onto the frame by calendar date.
pub fn enrich_with_external_features(frame: &mut Frame, usd_brl: &[(NaiveDate, f64)]) {
    if usd_brl.is_empty() {
        warn!("USD/BRL quote not added (data unavailable)");
        return;
    }
    frame.left_join_on_date("usd_brl", usd_brl);
}

/// Date span of a frame, used as the external request range.
pub fn frame_date_range(frame: &Frame) -> Option<(NaiveDate, NaiveDate)> {
    let first = frame.dates().iter().min()?.date();
    let last = frame.dates().iter().max()?.date();
    Some((first, last))
}
