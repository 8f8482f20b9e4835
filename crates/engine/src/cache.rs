//! Read-optimized outcome cache for the optimizer
//!
//! The optimizer scores hundreds of candidate filters against the same closed
//! positions on every run; hitting the relational store per scenario would be
//! far too slow. This cache holds sold positions joined with their
//! entry-time feature snapshots in memory and syncs incrementally: only
//! positions with an id above the high-water mark are fetched. Writes always
//! go to the store; the cache is strictly a read-only derivative.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::features::FeatureSnapshot;
use crate::reader::TimeSeriesReader;
use crate::types::Position;
use crate::EngineResult;
use persistence::repository::PositionRepository;
use persistence::SqlitePool;

/// One closed position with the features observed at entry
#[derive(Debug, Clone)]
pub struct OutcomeRow {
    pub position_id: i64,
    pub entry_time: DateTime<Utc>,
    /// Realized gain fraction (0.05 = +5%)
    pub gain: Decimal,
    pub snapshot: FeatureSnapshot,
}

/// Incrementally synced snapshot of sold positions + entry features
pub struct OutcomeCache {
    rows: Vec<OutcomeRow>,
    last_seen_id: i64,
    snapshot_minutes: u32,
}

impl OutcomeCache {
    pub fn new(snapshot_minutes: u32) -> Self {
        Self {
            rows: Vec::new(),
            last_seen_id: 0,
            snapshot_minutes,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Pull positions sold since the last refresh and join their snapshots.
    /// Returns how many rows were appended.
    pub async fn refresh(
        &mut self,
        pool: &SqlitePool,
        reader: &dyn TimeSeriesReader,
        token: &str,
    ) -> EngineResult<usize> {
        let repo = PositionRepository::new(pool);
        let records = repo.list_sold_after(self.last_seen_id).await?;

        let mut appended = 0;
        for record in &records {
            let position = Position::from_record(record);

            let Some(gain) = position.realized_gain() else {
                warn!(
                    position_id = position.id,
                    "Sold position without a usable exit price, skipping in cache"
                );
                // Skipped for good, never retried
                self.last_seen_id = self.last_seen_id.max(position.id);
                continue;
            };

            let snapshot = reader
                .feature_snapshot(token, position.entry_time, self.snapshot_minutes)
                .await?;

            self.rows.push(OutcomeRow {
                position_id: position.id,
                entry_time: position.entry_time,
                gain,
                snapshot,
            });
            appended += 1;
            // Advance only after the row is cached; a transient reader
            // failure above leaves the mark behind so the next refresh
            // picks the position up again
            self.last_seen_id = self.last_seen_id.max(position.id);
        }

        if appended > 0 {
            debug!(
                appended,
                total = self.rows.len(),
                high_water = self.last_seen_id,
                "Outcome cache refreshed"
            );
        }
        Ok(appended)
    }

    /// Rows whose entry falls inside the lookback window ending at `now`
    pub fn rows_within(&self, now: DateTime<Utc>, lookback_hours: i64) -> Vec<&OutcomeRow> {
        let cutoff = now - Duration::hours(lookback_hours);
        self.rows
            .iter()
            .filter(|r| r.entry_time >= cutoff)
            .collect()
    }

    /// Drop rows older than the retention window so the cache stays bounded
    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        self.rows.retain(|r| r.entry_time >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureField;
    use crate::reader::MemoryReader;
    use crate::types::PricePoint;
    use crate::EngineError;
    use async_trait::async_trait;
    use persistence::repository::positions::PositionRecord;
    use persistence::Database;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reader whose snapshot endpoint fails a set number of times, then heals
    struct FlakyReader {
        inner: MemoryReader,
        snapshot_failures_left: AtomicU32,
    }

    #[async_trait]
    impl TimeSeriesReader for FlakyReader {
        async fn latest_price(&self, token: &str) -> crate::EngineResult<Option<PricePoint>> {
            self.inner.latest_price(token).await
        }

        async fn price_history(
            &self,
            token: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> crate::EngineResult<Vec<PricePoint>> {
            self.inner.price_history(token, from, to).await
        }

        async fn feature_snapshot(
            &self,
            token: &str,
            reference: DateTime<Utc>,
            minutes_back: u32,
        ) -> crate::EngineResult<FeatureSnapshot> {
            if self.snapshot_failures_left.load(Ordering::SeqCst) > 0 {
                self.snapshot_failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::Feed("snapshot endpoint unavailable".into()));
            }
            self.inner.feature_snapshot(token, reference, minutes_back).await
        }
    }

    async fn sold_position(db: &Database, source: &str, entry_time: i64, exit_price: &str) -> i64 {
        let repo = PositionRepository::new(db.pool());
        let id = repo
            .create(&PositionRecord {
                id: None,
                source_id: source.to_string(),
                entry_time,
                entry_price: "100".to_string(),
                cycle_id: None,
                status: "pending".to_string(),
                highest_price_since_entry: "100".to_string(),
                exit_time: None,
                exit_price: None,
                exit_reason: None,
                validation_log: "{}".to_string(),
            })
            .await
            .unwrap();
        repo.mark_sold(id, entry_time + 600, exit_price, "trailing_stop")
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_incremental_refresh_only_fetches_new_rows() {
        let db = Database::in_memory().await.unwrap();
        let reader = MemoryReader::new();
        let mut cache = OutcomeCache::new(5);

        let now = Utc::now().timestamp();
        sold_position(&db, "a", now, "105").await;

        assert_eq!(cache.refresh(db.pool(), &reader, "SOL").await.unwrap(), 1);
        assert_eq!(cache.refresh(db.pool(), &reader, "SOL").await.unwrap(), 0);

        sold_position(&db, "b", now, "95").await;
        assert_eq!(cache.refresh(db.pool(), &reader, "SOL").await.unwrap(), 1);
        assert_eq!(cache.len(), 2);

        let gains: Vec<Decimal> = cache
            .rows_within(Utc::now(), 24)
            .iter()
            .map(|r| r.gain)
            .collect();
        assert_eq!(gains, vec![dec!(0.05), dec!(-0.05)]);
    }

    #[tokio::test]
    async fn test_rows_carry_entry_snapshot() {
        let db = Database::in_memory().await.unwrap();
        let reader = MemoryReader::new();
        let mut cache = OutcomeCache::new(3);

        let entry = Utc::now();
        reader.set_feature(entry, FeatureField::ObImbalance, dec!(0.65));
        sold_position(&db, "a", entry.timestamp(), "110").await;

        cache.refresh(db.pool(), &reader, "SOL").await.unwrap();
        let rows = cache.rows_within(Utc::now(), 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].snapshot.value(FeatureField::ObImbalance, 0),
            Some(dec!(0.65))
        );
    }

    #[tokio::test]
    async fn test_transient_reader_failure_does_not_lose_rows() {
        let db = Database::in_memory().await.unwrap();
        let reader = FlakyReader {
            inner: MemoryReader::new(),
            snapshot_failures_left: AtomicU32::new(1),
        };
        let mut cache = OutcomeCache::new(2);

        sold_position(&db, "a", Utc::now().timestamp(), "105").await;

        // First refresh fails mid-join; the high-water mark must not
        // advance past the unprocessed position
        assert!(cache.refresh(db.pool(), &reader, "SOL").await.is_err());
        assert_eq!(cache.len(), 0);

        // Reader recovered: the same position is picked up, not lost
        assert_eq!(cache.refresh(db.pool(), &reader, "SOL").await.unwrap(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_lookback_window_and_eviction() {
        let db = Database::in_memory().await.unwrap();
        let reader = MemoryReader::new();
        let mut cache = OutcomeCache::new(1);

        let now = Utc::now();
        sold_position(&db, "old", (now - Duration::hours(48)).timestamp(), "105").await;
        sold_position(&db, "new", now.timestamp(), "105").await;
        cache.refresh(db.pool(), &reader, "SOL").await.unwrap();

        assert_eq!(cache.rows_within(now, 24).len(), 1);
        assert_eq!(cache.rows_within(now, 72).len(), 2);

        cache.evict_before(now - Duration::hours(24));
        assert_eq!(cache.len(), 1);
    }
}
