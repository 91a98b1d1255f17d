use reqwest::{header::ACCEPT, Client as HttpClient, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use super::frame::Frame;
use super::loader::parse_raw_csv;
use crate::error::DataError;

const CDD_BASE_URL: &str = "https://www.cryptodatadownload.com/cdd";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_http_client() -> Result<HttpClient, DataError> {
    HttpClient::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| DataError::DownloadError {
            url: String::new(),
            message: e.to_string(),
        })
}

/// GET `url` and return the body, treating any non-2xx status as an error.
pub async fn fetch_text(http: &HttpClient, url: &str, accept: &'static str) -> Result<String, DataError> {
    let download_error = |message: String| DataError::DownloadError {
        url: url.to_string(),
        message,
    };

    let response = http
        .get(url)
        .header(ACCEPT, accept)
        .send()
        .await
        .map_err(|e| download_error(e.to_string()))?;

    let status = response.status();
    if status != StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        return Err(download_error(format!("HTTP {}: {}", status.as_u16(), body.trim())));
    }

    response.text().await.map_err(|e| download_error(e.to_string()))
}

/// Downloads exchange history from CryptoDataDownload and caches it under
/// the raw data folder.
#[derive(Clone)]
pub struct MarketDataClient {
    http_client: HttpClient,
    raw_dir: PathBuf,
    exchange: String,
}

impl MarketDataClient {
    pub fn new(raw_dir: PathBuf, exchange: &str) -> Result<Self, DataError> {
        let http_client = build_http_client()?;
        info!("Market data client ready (exchange {}, cache {})", exchange, raw_dir.display());
        Ok(Self {
            http_client,
            raw_dir,
            exchange: exchange.to_string(),
        })
    }

    pub fn cache_path(&self, base: &str, quote: &str, timeframe: &str) -> PathBuf {
        self.raw_dir.join(format!(
            "{}_{}_{}.csv",
            base.to_uppercase(),
            quote.to_uppercase(),
            timeframe
        ))
    }

    pub fn remote_url(&self, base: &str, quote: &str, timeframe: &str) -> String {
        format!(
            "{}/{}_{}{}_{}.csv",
            CDD_BASE_URL,
            self.exchange,
            base.to_uppercase(),
            quote.to_uppercase(),
            timeframe
        )
    }

    /// Returns `Ok(None)` when the pair cannot be downloaded. A cached file
    /// that fails to parse is an error.
    pub async fn load_crypto_data(
        &self,
        base: &str,
        quote: &str,
        timeframe: &str,
        force_download: bool,
    ) -> Result<Option<Frame>, DataError> {
        let path = self.cache_path(base, quote, timeframe);

        if force_download || !fs::try_exists(&path).await.unwrap_or(false) {
            let url = self.remote_url(base, quote, timeframe);
            info!("Downloading {}", url);
            match fetch_text(&self.http_client, &url, "text/csv").await {
                Ok(body) => {
                    fs::create_dir_all(&self.raw_dir).await?;
                    fs::write(&path, body.as_bytes()).await?;
                }
                Err(e) => {
                    warn!("Could not download {}{}: {}", base, quote, e);
                    return Ok(None);
                }
            }
        }

        let text = fs::read_to_string(&path).await?;
        let frame = parse_raw_csv(&text)?;
        info!("Loaded {} rows for {}_{}", frame.len(), base, quote);
        Ok(Some(frame))
    }
}
