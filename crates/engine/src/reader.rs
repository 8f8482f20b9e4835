//! Time-series reader seam
//!
//! The feed is an external collaborator; the pipeline only depends on this
//! trait. Both methods tolerate gaps — partial or empty results, never errors
//! for missing data. `MemoryReader` backs tests and offline replay.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::features::{FeatureField, FeatureSnapshot};
use crate::types::PricePoint;
use crate::{EngineError, EngineResult};

/// Read access to price ticks and per-minute feature snapshots
#[async_trait]
pub trait TimeSeriesReader: Send + Sync {
    /// Most recent price for a token, None when the feed has nothing yet
    async fn latest_price(&self, token: &str) -> EngineResult<Option<PricePoint>>;

    /// Prices in `[from, to]`, oldest first; partial on gaps
    async fn price_history(
        &self,
        token: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<Vec<PricePoint>>;

    /// Feature vectors for minute offsets `0..minutes_back` before `reference`;
    /// minutes the feed never produced are simply absent
    async fn feature_snapshot(
        &self,
        token: &str,
        reference: DateTime<Utc>,
        minutes_back: u32,
    ) -> EngineResult<FeatureSnapshot>;
}

#[derive(Default)]
struct MemoryStore {
    prices: Vec<PricePoint>,
    /// (minute epoch, field) -> value
    features: HashMap<(i64, FeatureField), Decimal>,
}

/// In-memory reader for tests and replay runs
#[derive(Default)]
pub struct MemoryReader {
    store: RwLock<MemoryStore>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_price(&self, timestamp: DateTime<Utc>, price: Decimal) {
        let mut store = self.store.write().unwrap();
        store.prices.push(PricePoint { timestamp, price });
        store.prices.sort_by_key(|p| p.timestamp);
    }

    pub fn set_feature(&self, minute: DateTime<Utc>, field: FeatureField, value: Decimal) {
        let key = (minute.timestamp() / 60, field);
        self.store.write().unwrap().features.insert(key, value);
    }
}

#[async_trait]
impl TimeSeriesReader for MemoryReader {
    async fn latest_price(&self, _token: &str) -> EngineResult<Option<PricePoint>> {
        Ok(self.store.read().unwrap().prices.last().copied())
    }

    async fn price_history(
        &self,
        _token: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<Vec<PricePoint>> {
        if to < from {
            return Err(EngineError::InvalidState(format!(
                "price_history: to {to} before from {from}"
            )));
        }
        let store = self.store.read().unwrap();
        Ok(store
            .prices
            .iter()
            .filter(|p| p.timestamp >= from && p.timestamp <= to)
            .copied()
            .collect())
    }

    async fn feature_snapshot(
        &self,
        _token: &str,
        reference: DateTime<Utc>,
        minutes_back: u32,
    ) -> EngineResult<FeatureSnapshot> {
        let store = self.store.read().unwrap();
        let mut snapshot = FeatureSnapshot::new(reference);

        for offset in 0..minutes_back {
            let minute = reference - Duration::minutes(offset as i64);
            let minute_key = minute.timestamp() / 60;
            for field in FeatureField::all() {
                if let Some(value) = store.features.get(&(minute_key, *field)) {
                    snapshot.insert(offset, *field, *value);
                }
            }
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_history_is_ordered_and_bounded() {
        let reader = MemoryReader::new();
        let base = Utc::now();
        reader.push_price(base + Duration::seconds(20), dec!(102));
        reader.push_price(base, dec!(100));
        reader.push_price(base + Duration::seconds(10), dec!(101));

        let history = reader
            .price_history("SOL", base, base + Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].price, dec!(100));
        assert_eq!(history[1].price, dec!(101));

        let latest = reader.latest_price("SOL").await.unwrap().unwrap();
        assert_eq!(latest.price, dec!(102));
    }

    #[tokio::test]
    async fn test_snapshot_tolerates_gaps() {
        let reader = MemoryReader::new();
        let reference = Utc::now();
        reader.set_feature(reference, FeatureField::ObImbalance, dec!(0.7));
        // Minute offset 1 never gets data

        let snap = reader.feature_snapshot("SOL", reference, 3).await.unwrap();
        assert_eq!(snap.value(FeatureField::ObImbalance, 0), Some(dec!(0.7)));
        assert_eq!(snap.value(FeatureField::ObImbalance, 1), None);
    }
}
