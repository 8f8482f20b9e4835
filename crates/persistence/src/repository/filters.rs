//! Filter definition repository — the active entry-filter set
//!
//! Reads of the active set always reflect the latest committed write; the
//! optimizer swaps a project's set inside one transaction so the validator
//! never sees a half-replaced set.

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A named group of filter definitions
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FilterProjectRecord {
    pub id: Option<i64>,
    pub name: String,
    pub auto_managed: i64,
}

/// One acceptable feature range at one minute offset
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FilterDefinitionRecord {
    pub id: Option<i64>,
    pub project_id: i64,
    pub field: String,
    pub minute_offset: i64,
    pub from_value: String,
    pub to_value: String,
    pub is_ratio: i64,
    pub active: i64,
}

/// Repository for filter projects and definitions
pub struct FilterRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> FilterRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get or create a project by name
    pub async fn ensure_project(&self, name: &str, auto_managed: bool) -> DbResult<i64> {
        sqlx::query("INSERT OR IGNORE INTO filter_projects (name, auto_managed) VALUES (?, ?)")
            .bind(name)
            .bind(auto_managed as i64)
            .execute(self.pool)
            .await?;

        let (id,): (i64,) = sqlx::query_as("SELECT id FROM filter_projects WHERE name = ?")
            .bind(name)
            .fetch_one(self.pool)
            .await?;

        Ok(id)
    }

    /// Project ids flagged for automatic filter management
    pub async fn auto_managed_projects(&self) -> DbResult<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM filter_projects WHERE auto_managed = 1")
                .fetch_all(self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Active filter definitions for the given projects
    pub async fn active_for_projects(
        &self,
        project_ids: &[i64],
    ) -> DbResult<Vec<FilterDefinitionRecord>> {
        if project_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; project_ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT id, project_id, field, minute_offset, from_value, to_value, is_ratio, active
            FROM filter_definitions
            WHERE active = 1 AND project_id IN ({placeholders})
            ORDER BY field, minute_offset
            "#
        );

        let mut query = sqlx::query_as::<_, FilterDefinitionRecord>(&sql);
        for id in project_ids {
            query = query.bind(id);
        }

        let records = query.fetch_all(self.pool).await?;
        Ok(records)
    }

    /// Atomically replace the active set for the given projects.
    ///
    /// Old rows are deactivated (kept for audit), new rows inserted active, all
    /// in one transaction. Each new definition is inserted once per project.
    pub async fn replace_active_set(
        &self,
        project_ids: &[i64],
        definitions: &[FilterDefinitionRecord],
    ) -> DbResult<usize> {
        let mut tx = self.pool.begin().await?;

        for project_id in project_ids {
            sqlx::query("UPDATE filter_definitions SET active = 0 WHERE project_id = ?")
                .bind(project_id)
                .execute(&mut *tx)
                .await?;

            for def in definitions {
                sqlx::query(
                    r#"
                    INSERT INTO filter_definitions
                        (project_id, field, minute_offset, from_value, to_value, is_ratio, active)
                    VALUES (?, ?, ?, ?, ?, ?, 1)
                    "#,
                )
                .bind(project_id)
                .bind(&def.field)
                .bind(def.minute_offset)
                .bind(&def.from_value)
                .bind(&def.to_value)
                .bind(def.is_ratio)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(project_ids.len() * definitions.len())
    }
}
