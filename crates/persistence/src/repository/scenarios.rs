//! Optimizer scenario results repository
//!
//! Every scenario of every optimizer run is persisted for transparency;
//! exactly one row per run is marked selected. `params_hash` deduplicates
//! re-submissions of an identical scenario within the same run.

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A persisted optimizer scenario result
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScenarioRecord {
    pub id: Option<i64>,
    pub run_id: String,
    pub params_hash: String,
    /// JSON-serialized hyperparameter tuple
    pub params: String,
    pub score: Option<String>,
    pub good_kept_pct: Option<String>,
    pub bad_removed_pct: Option<String>,
    /// JSON-serialized best filter combination, if the scenario was feasible
    pub filters: Option<String>,
    pub feasible: i64,
    pub selected: i64,
}

const SCENARIO_COLUMNS: &str = "id, run_id, params_hash, params, score, good_kept_pct, \
     bad_removed_pct, filters, feasible, selected";

/// Repository for optimizer scenario results
pub struct ScenarioRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ScenarioRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Save a scenario result (INSERT OR IGNORE — skips if params_hash already exists)
    pub async fn save(&self, record: &ScenarioRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO filter_scenarios
                (run_id, params_hash, params, score, good_kept_pct,
                 bad_removed_pct, filters, feasible, selected)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.run_id)
        .bind(&record.params_hash)
        .bind(&record.params)
        .bind(&record.score)
        .bind(&record.good_kept_pct)
        .bind(&record.bad_removed_pct)
        .bind(&record.filters)
        .bind(record.feasible)
        .bind(record.selected)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Mark one scenario of a run as selected (clears any other selection in the run)
    pub async fn mark_selected(&self, run_id: &str, params_hash: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE filter_scenarios SET selected = 0 WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE filter_scenarios SET selected = 1 WHERE run_id = ? AND params_hash = ?")
            .bind(run_id)
            .bind(params_hash)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// All scenarios of a run, best score first
    pub async fn list_for_run(&self, run_id: &str) -> DbResult<Vec<ScenarioRecord>> {
        let records = sqlx::query_as::<_, ScenarioRecord>(&format!(
            r#"
            SELECT {SCENARIO_COLUMNS}
            FROM filter_scenarios
            WHERE run_id = ?
            ORDER BY CAST(score AS REAL) DESC
            "#
        ))
        .bind(run_id)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Recent scenarios across runs, newest first (dashboard)
    pub async fn list_recent(&self, limit: i64) -> DbResult<Vec<ScenarioRecord>> {
        let records = sqlx::query_as::<_, ScenarioRecord>(&format!(
            "SELECT {SCENARIO_COLUMNS} FROM filter_scenarios ORDER BY id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// The currently selected scenario of the most recent run, if any
    pub async fn latest_selected(&self) -> DbResult<Option<ScenarioRecord>> {
        let record = sqlx::query_as::<_, ScenarioRecord>(&format!(
            "SELECT {SCENARIO_COLUMNS} FROM filter_scenarios WHERE selected = 1 ORDER BY id DESC LIMIT 1"
        ))
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }
}
