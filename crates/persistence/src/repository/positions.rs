//! Position repository — trades and their audit trails
//!
//! A position row is always inserted together with its validation log, so a
//! concurrent reader can never observe a position without the log that
//! explains it. Terminal status updates are guarded on `status = 'pending'`,
//! which makes sells idempotent at the store boundary.

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_NO_GO: &str = "no_go";
pub const STATUS_SOLD: &str = "sold";
pub const STATUS_ERROR: &str = "error";

/// A position row. Prices are TEXT-encoded Decimals, timestamps epoch seconds,
/// `validation_log` is the JSON-serialized structured log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub id: Option<i64>,
    pub source_id: String,
    pub entry_time: i64,
    pub entry_price: String,
    pub cycle_id: Option<i64>,
    pub status: String,
    pub highest_price_since_entry: String,
    pub exit_time: Option<i64>,
    pub exit_price: Option<String>,
    pub exit_reason: Option<String>,
    pub validation_log: String,
}

/// One row of the exit-manager audit trail
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PriceCheckRecord {
    pub id: Option<i64>,
    pub position_id: i64,
    pub checked_at: i64,
    pub price: String,
    pub gain_pct: String,
    pub drawdown_pct: String,
    pub rule_basis: String,
    pub allowed_drawdown_pct: String,
    pub decision: String,
}

const POSITION_COLUMNS: &str = "id, source_id, entry_time, entry_price, cycle_id, status, \
     highest_price_since_entry, exit_time, exit_price, exit_reason, validation_log";

/// Repository for positions and price checks
pub struct PositionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> PositionRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a position together with its validation log
    pub async fn create(&self, record: &PositionRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO positions
                (source_id, entry_time, entry_price, cycle_id, status,
                 highest_price_since_entry, validation_log)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.source_id)
        .bind(record.entry_time)
        .bind(&record.entry_price)
        .bind(record.cycle_id)
        .bind(&record.status)
        .bind(&record.highest_price_since_entry)
        .bind(&record.validation_log)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Get a position by id
    pub async fn get(&self, id: i64) -> DbResult<Option<PositionRecord>> {
        let record = sqlx::query_as::<_, PositionRecord>(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// All PENDING positions, oldest entry first
    pub async fn list_pending(&self) -> DbResult<Vec<PositionRecord>> {
        let records = sqlx::query_as::<_, PositionRecord>(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE status = 'pending' ORDER BY entry_time ASC"
        ))
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Update the running high of a pending position
    pub async fn update_highest(&self, id: i64, highest: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE positions SET highest_price_since_entry = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(highest)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Transition PENDING -> SOLD. Returns false if the position was not
    /// pending (already terminal), making repeated sells harmless.
    pub async fn mark_sold(
        &self,
        id: i64,
        exit_time: i64,
        exit_price: &str,
        exit_reason: &str,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE positions
            SET status = 'sold', exit_time = ?, exit_price = ?, exit_reason = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(exit_time)
        .bind(exit_price)
        .bind(exit_reason)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Transition PENDING -> ERROR (processing failure)
    pub async fn mark_error(&self, id: i64, reason: &str) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE positions SET status = 'error', exit_reason = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(reason)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// SOLD positions with id greater than `after_id` (incremental cache sync)
    pub async fn list_sold_after(&self, after_id: i64) -> DbResult<Vec<PositionRecord>> {
        let records = sqlx::query_as::<_, PositionRecord>(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE status = 'sold' AND id > ? ORDER BY id ASC"
        ))
        .bind(after_id)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Recent positions, newest first, optionally filtered by status (dashboard)
    pub async fn list_recent(
        &self,
        limit: i64,
        status: Option<&str>,
    ) -> DbResult<Vec<PositionRecord>> {
        let records = match status {
            Some(s) => {
                sqlx::query_as::<_, PositionRecord>(&format!(
                    "SELECT {POSITION_COLUMNS} FROM positions WHERE status = ? ORDER BY entry_time DESC LIMIT ?"
                ))
                .bind(s)
                .bind(limit)
                .fetch_all(self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, PositionRecord>(&format!(
                    "SELECT {POSITION_COLUMNS} FROM positions ORDER BY entry_time DESC LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(self.pool)
                .await?
            }
        };

        Ok(records)
    }

    /// Append one exit-check audit row
    pub async fn record_price_check(&self, check: &PriceCheckRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO price_checks
                (position_id, checked_at, price, gain_pct, drawdown_pct,
                 rule_basis, allowed_drawdown_pct, decision)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(check.position_id)
        .bind(check.checked_at)
        .bind(&check.price)
        .bind(&check.gain_pct)
        .bind(&check.drawdown_pct)
        .bind(&check.rule_basis)
        .bind(&check.allowed_drawdown_pct)
        .bind(&check.decision)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Audit trail for one position, oldest first
    pub async fn list_price_checks(&self, position_id: i64) -> DbResult<Vec<PriceCheckRecord>> {
        let records = sqlx::query_as::<_, PriceCheckRecord>(
            r#"
            SELECT id, position_id, checked_at, price, gain_pct, drawdown_pct,
                   rule_basis, allowed_drawdown_pct, decision
            FROM price_checks
            WHERE position_id = ?
            ORDER BY checked_at ASC, id ASC
            "#,
        )
        .bind(position_id)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn pending_record(source: &str) -> PositionRecord {
        PositionRecord {
            id: None,
            source_id: source.to_string(),
            entry_time: 1000,
            entry_price: "100".to_string(),
            cycle_id: None,
            status: STATUS_PENDING.to_string(),
            highest_price_since_entry: "100".to_string(),
            exit_time: None,
            exit_price: None,
            exit_reason: None,
            validation_log: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_position_inserted_with_log() {
        let db = Database::in_memory().await.unwrap();
        let repo = PositionRepository::new(db.pool());

        let id = repo.create(&pending_record("w1")).await.unwrap();
        let fetched = repo.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.validation_log, "{}");
        assert_eq!(fetched.status, STATUS_PENDING);
    }

    #[tokio::test]
    async fn test_mark_sold_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let repo = PositionRepository::new(db.pool());

        let id = repo.create(&pending_record("w1")).await.unwrap();
        assert!(repo.mark_sold(id, 2000, "110", "trailing_stop").await.unwrap());
        // Second sell is a no-op
        assert!(!repo.mark_sold(id, 3000, "90", "trailing_stop").await.unwrap());

        let fetched = repo.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, STATUS_SOLD);
        assert_eq!(fetched.exit_price.as_deref(), Some("110"));
        assert_eq!(fetched.exit_time, Some(2000));
    }

    #[tokio::test]
    async fn test_terminal_positions_never_transition() {
        let db = Database::in_memory().await.unwrap();
        let repo = PositionRepository::new(db.pool());

        let id = repo.create(&pending_record("w1")).await.unwrap();
        repo.mark_error(id, "feature unavailable").await.unwrap();

        assert!(!repo.mark_sold(id, 2000, "110", "trailing_stop").await.unwrap());
        assert!(!repo.mark_error(id, "again").await.unwrap());

        let fetched = repo.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, STATUS_ERROR);
    }

    #[tokio::test]
    async fn test_list_pending_excludes_terminal() {
        let db = Database::in_memory().await.unwrap();
        let repo = PositionRepository::new(db.pool());

        let a = repo.create(&pending_record("a")).await.unwrap();
        let _b = repo.create(&pending_record("b")).await.unwrap();
        repo.mark_sold(a, 2000, "110", "trailing_stop").await.unwrap();

        let pending = repo.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].source_id, "b");
    }

    #[tokio::test]
    async fn test_price_check_audit_trail() {
        let db = Database::in_memory().await.unwrap();
        let repo = PositionRepository::new(db.pool());

        let id = repo.create(&pending_record("w1")).await.unwrap();
        repo.record_price_check(&PriceCheckRecord {
            id: None,
            position_id: id,
            checked_at: 1500,
            price: "105".to_string(),
            gain_pct: "0.05".to_string(),
            drawdown_pct: "0.01".to_string(),
            rule_basis: "from_high".to_string(),
            allowed_drawdown_pct: "0.03".to_string(),
            decision: "hold".to_string(),
        })
        .await
        .unwrap();

        let checks = repo.list_price_checks(id).await.unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].decision, "hold");
    }
}
