// =============================================================================
// REST gap-fill client
// =============================================================================
//
// GET {base}/api/v1/candle?symbol=&interval=&startTime=&endTime=&count=
// Response body: JSON array of 10-field candle tuples.  Malformed tuples are
// skipped; a non-2xx status fails the whole request.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::market_data::Candle;
use crate::types::IntervalSpec;
use crate::upstream::{GapFill, GapFillQuery};

#[derive(Clone)]
pub struct RestGapFill {
    base_url: String,
    client: reqwest::Client,
}

impl RestGapFill {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, timeout_secs, "RestGapFill initialised");

        Ok(Self { base_url, client })
    }

    #[cfg(test)]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Query parameters for one request, in a stable order.
    fn query_params(
        symbol: &str,
        spec: IntervalSpec,
        query: GapFillQuery,
    ) -> Vec<(&'static str, String)> {
        let mut params = vec![("symbol", symbol.to_string()), ("interval", spec.to_string())];
        if let Some(s) = query.start_time {
            params.push(("startTime", s.to_string()));
        }
        if let Some(e) = query.end_time {
            params.push(("endTime", e.to_string()));
        }
        if let Some(c) = query.count {
            params.push(("count", c.to_string()));
        }
        params
    }

    /// Check the status before touching the body, then decode it.
    fn decode_response(status: reqwest::StatusCode, text: &str) -> Result<Vec<Candle>> {
        if !status.is_success() {
            let snippet: String = text.chars().take(200).collect();
            anyhow::bail!("upstream GET /api/v1/candle returned {}: {}", status, snippet);
        }
        let body: serde_json::Value =
            serde_json::from_str(text).context("failed to parse candle response")?;
        Self::parse_body(&body)
    }

    /// Decode a response body, skipping entries that are not valid tuples.
    fn parse_body(body: &serde_json::Value) -> Result<Vec<Candle>> {
        let raw = body.as_array().context("candle response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            match Candle::from_wire(entry) {
                Ok(c) => candles.push(c),
                Err(e) => warn!(error = %e, "skipping malformed candle tuple"),
            }
        }
        Ok(candles)
    }
}

#[async_trait]
impl GapFill for RestGapFill {
    #[instrument(skip(self), name = "upstream::request")]
    async fn request(
        &self,
        symbol: &str,
        spec: IntervalSpec,
        query: GapFillQuery,
    ) -> Result<Vec<Candle>> {
        let url = format!("{}/api/v1/candle", self.base_url);

        let resp = self
            .client
            .get(&url)
            .query(&Self::query_params(symbol, spec, query))
            .send()
            .await
            .context("GET /api/v1/candle request failed")?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .context("failed to read candle response body")?;

        let candles = Self::decode_response(status, &text)?;
        debug!(symbol, interval = %spec, count = candles.len(), "gap-fill candles fetched");
        Ok(candles)
    }
}

impl std::fmt::Debug for RestGapFill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestGapFill")
            .field("base_url", &self.base_url)
            .finish()
    }
}
