//! Price cycle repository — one OPEN cycle per drawdown threshold

use crate::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

pub const STATUS_OPEN: &str = "open";
pub const STATUS_CLOSED: &str = "closed";

/// A price cycle row. Prices/percentages are TEXT-encoded Decimals,
/// timestamps are epoch seconds.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PriceCycleRecord {
    pub id: Option<i64>,
    pub threshold_pct: String,
    pub start_time: i64,
    pub start_price: String,
    pub highest_price: String,
    pub lowest_price: String,
    pub end_time: Option<i64>,
    pub status: String,
}

const CYCLE_COLUMNS: &str =
    "id, threshold_pct, start_time, start_price, highest_price, lowest_price, end_time, status";

/// Repository for price cycles
pub struct CycleRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> CycleRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the OPEN cycle for a threshold, if any
    pub async fn get_open(&self, threshold_pct: &str) -> DbResult<Option<PriceCycleRecord>> {
        let record = sqlx::query_as::<_, PriceCycleRecord>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM price_cycles WHERE threshold_pct = ? AND status = 'open'"
        ))
        .bind(threshold_pct)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Get a cycle by id
    pub async fn get(&self, id: i64) -> DbResult<Option<PriceCycleRecord>> {
        let record = sqlx::query_as::<_, PriceCycleRecord>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM price_cycles WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Open a fresh cycle for a threshold (start = highest = lowest = price)
    pub async fn open_cycle(
        &self,
        threshold_pct: &str,
        start_time: i64,
        price: &str,
    ) -> DbResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO price_cycles
                (threshold_pct, start_time, start_price, highest_price, lowest_price, status)
            VALUES (?, ?, ?, ?, ?, 'open')
            "#,
        )
        .bind(threshold_pct)
        .bind(start_time)
        .bind(price)
        .bind(price)
        .bind(price)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Update running extremes of an open cycle
    pub async fn update_extremes(&self, id: i64, highest: &str, lowest: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE price_cycles SET highest_price = ?, lowest_price = ? WHERE id = ? AND status = 'open'",
        )
        .bind(highest)
        .bind(lowest)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Close a cycle and open its successor in a single transaction.
    ///
    /// Rejects a close that would set `end_time < start_time` (out-of-order
    /// tick) without touching the row. The transaction guarantees no reader
    /// ever observes zero or two OPEN cycles for the threshold.
    pub async fn close_and_reopen(
        &self,
        id: i64,
        threshold_pct: &str,
        end_time: i64,
        reopen_price: &str,
    ) -> DbResult<i64> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64,)> =
            sqlx::query_as("SELECT start_time FROM price_cycles WHERE id = ? AND status = 'open'")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let start_time = match row {
            Some((t,)) => t,
            None => {
                return Err(DbError::Query(format!("cycle {id} is not open")));
            }
        };

        if end_time < start_time {
            return Err(DbError::Corrupt(format!(
                "cycle {id}: end_time {end_time} before start_time {start_time}"
            )));
        }

        sqlx::query("UPDATE price_cycles SET status = 'closed', end_time = ? WHERE id = ?")
            .bind(end_time)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO price_cycles
                (threshold_pct, start_time, start_price, highest_price, lowest_price, status)
            VALUES (?, ?, ?, ?, ?, 'open')
            "#,
        )
        .bind(threshold_pct)
        .bind(end_time)
        .bind(reopen_price)
        .bind(reopen_price)
        .bind(reopen_price)
        .execute(&mut *tx)
        .await?;

        let new_id = result.last_insert_rowid();
        tx.commit().await?;

        Ok(new_id)
    }

    /// Count OPEN cycles for a threshold (invariant checks and tests)
    pub async fn count_open(&self, threshold_pct: &str) -> DbResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM price_cycles WHERE threshold_pct = ? AND status = 'open'",
        )
        .bind(threshold_pct)
        .fetch_one(self.pool)
        .await?;

        Ok(count)
    }

    /// Recent cycles, newest first (dashboard)
    pub async fn list_recent(&self, limit: i64) -> DbResult<Vec<PriceCycleRecord>> {
        let records = sqlx::query_as::<_, PriceCycleRecord>(&format!(
            "SELECT {CYCLE_COLUMNS} FROM price_cycles ORDER BY start_time DESC, id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_open_close_reopen_keeps_exactly_one_open() {
        let db = Database::in_memory().await.unwrap();
        let repo = CycleRepository::new(db.pool());

        let id = repo.open_cycle("0.05", 1000, "100").await.unwrap();
        assert_eq!(repo.count_open("0.05").await.unwrap(), 1);

        let new_id = repo.close_and_reopen(id, "0.05", 1100, "95").await.unwrap();
        assert_ne!(id, new_id);
        assert_eq!(repo.count_open("0.05").await.unwrap(), 1);

        let closed = repo.get(id).await.unwrap().unwrap();
        assert_eq!(closed.status, STATUS_CLOSED);
        assert_eq!(closed.end_time, Some(1100));
    }

    #[tokio::test]
    async fn test_close_before_start_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        let repo = CycleRepository::new(db.pool());

        let id = repo.open_cycle("0.05", 1000, "100").await.unwrap();
        let err = repo.close_and_reopen(id, "0.05", 900, "95").await;
        assert!(matches!(err, Err(DbError::Corrupt(_))));

        // Original cycle untouched
        let cycle = repo.get(id).await.unwrap().unwrap();
        assert_eq!(cycle.status, STATUS_OPEN);
        assert_eq!(cycle.end_time, None);
        assert_eq!(repo.count_open("0.05").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unique_open_index_rejects_duplicate() {
        let db = Database::in_memory().await.unwrap();
        let repo = CycleRepository::new(db.pool());

        repo.open_cycle("0.03", 1000, "100").await.unwrap();
        let dup = repo.open_cycle("0.03", 1001, "101").await;
        assert!(dup.is_err());
    }
}
