use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::core::config::SourceConfig;
use crate::core::rate::RateReading;
use crate::core::source::{FetchError, RateSource};

const QUOTE_ENDPOINT: &str = "/v1/cryptocurrency/quotes/latest?symbol=BTC&convert=USD";
const API_KEY_HEADER: &str = "X-CMC_PRO_API_KEY";
const PRICE_POINTER: &str = "/data/BTC/quote/USD/price";

/// BTC/USD quotes from the CoinMarketCap pro API.
///
/// The price is read from `data.BTC.quote.USD.price`.
pub struct CoinMarketCapSource {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl CoinMarketCapSource {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("btcrate/0.1")
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(CoinMarketCapSource {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    pub fn from_config(config: &SourceConfig) -> anyhow::Result<Self> {
        Self::new(&config.base_url, config.api_key.clone(), config.timeout())
    }
}

fn extract_price(body: &str) -> Result<f64, FetchError> {
    let data: Value = serde_json::from_str(body)
        .map_err(|e| FetchError::MalformedResponse(format!("invalid JSON: {e}")))?;

    let field = data
        .pointer(PRICE_POINTER)
        .ok_or_else(|| FetchError::MalformedResponse(format!("missing field {PRICE_POINTER}")))?;

    let price = field.as_f64().ok_or_else(|| {
        FetchError::MalformedResponse(format!("non-numeric price at {PRICE_POINTER}: {field}"))
    })?;

    if !price.is_finite() || price <= 0.0 {
        return Err(FetchError::MalformedResponse(format!(
            "non-positive price: {price}"
        )));
    }
    Ok(price)
}

#[async_trait]
impl RateSource for CoinMarketCapSource {
    #[instrument(name = "CoinMarketCapFetch", skip(self))]
    async fn fetch(&self) -> Result<RateReading, FetchError> {
        let url = format!("{}{}", self.base_url, QUOTE_ENDPOINT);
        debug!("Requesting BTC quote from {}", url);

        let mut request = self.client.get(&url).header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() != 200 {
            return Err(FetchError::BadStatus(status.as_u16()));
        }

        let body = response.text().await?;
        let price = extract_price(&body).inspect_err(|e| {
            warn!(error = %e, "Unexpected quote payload, upstream API may have changed");
        })?;

        debug!(price, "Received BTC quote");
        Ok(RateReading::new(price, Utc::now()))
    }
}
