//! HTTP client for the time-series feed service (no authentication required)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tracing::debug;

use crate::features::{FeatureField, FeatureSnapshot};
use crate::reader::TimeSeriesReader;
use crate::types::{ts_from_secs, PricePoint};
use crate::{EngineError, EngineResult};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";

/// Feed service client; implements [`TimeSeriesReader`]
#[derive(Clone)]
pub struct FeedClient {
    client: Client,
    base_url: String,
}

/// Raw price row from the feed
#[derive(Debug, Deserialize)]
struct RawPrice {
    timestamp: i64,
    price: String,
}

/// Raw per-minute feature row: minute offset plus named values
#[derive(Debug, Deserialize)]
struct RawFeatureMinute {
    minute_offset: u32,
    values: std::collections::HashMap<String, String>,
}

impl Default for FeedClient {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl FeedClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("Failed to build HTTP client"),
            base_url: base_url.into(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> EngineResult<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::Feed(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Feed(format!("feed error {status}: {body}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| EngineError::Feed(format!("malformed feed response: {e}")))
    }
}

#[async_trait]
impl TimeSeriesReader for FeedClient {
    async fn latest_price(&self, token: &str) -> EngineResult<Option<PricePoint>> {
        let url = format!("{}/prices/{}/latest", self.base_url, token);
        let raw: Option<RawPrice> = self.get_json(&url).await?;

        Ok(raw.and_then(|r| {
            Some(PricePoint {
                timestamp: ts_from_secs(r.timestamp),
                price: Decimal::from_str(&r.price).ok()?,
            })
        }))
    }

    async fn price_history(
        &self,
        token: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<Vec<PricePoint>> {
        let url = format!(
            "{}/prices/{}?from={}&to={}",
            self.base_url,
            token,
            from.timestamp(),
            to.timestamp()
        );

        debug!(token, "Fetching price history from feed");
        let raw: Vec<RawPrice> = self.get_json(&url).await?;

        // Rows with unparseable prices are dropped, not fatal
        let mut points: Vec<PricePoint> = raw
            .into_iter()
            .filter_map(|r| {
                Some(PricePoint {
                    timestamp: ts_from_secs(r.timestamp),
                    price: Decimal::from_str(&r.price).ok()?,
                })
            })
            .collect();
        points.sort_by_key(|p| p.timestamp);

        Ok(points)
    }

    async fn feature_snapshot(
        &self,
        token: &str,
        reference: DateTime<Utc>,
        minutes_back: u32,
    ) -> EngineResult<FeatureSnapshot> {
        let url = format!(
            "{}/features/{}?reference={}&minutes={}",
            self.base_url,
            token,
            reference.timestamp(),
            minutes_back
        );

        debug!(token, minutes_back, "Fetching feature snapshot from feed");
        let raw: Vec<RawFeatureMinute> = self.get_json(&url).await?;

        // Boundary validation: only fields in the closed enum survive
        let mut snapshot = FeatureSnapshot::new(reference);
        for minute in raw {
            if minute.minute_offset >= minutes_back {
                continue;
            }
            for (name, value) in minute.values {
                let Some(field) = FeatureField::parse(&name) else {
                    debug!(field = %name, "Ignoring unknown feature field from feed");
                    continue;
                };
                if let Ok(value) = Decimal::from_str(&value) {
                    snapshot.insert(minute.minute_offset, field, value);
                }
            }
        }

        Ok(snapshot)
    }
}
