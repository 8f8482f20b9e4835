//! Price cycle tracker — per-threshold state machine over the tick stream
//!
//! Each configured drawdown threshold runs its own cycle over the same price
//! stream. A cycle closes when price retraces the threshold fraction from its
//! running high; close and reopen happen in one store transaction so no reader
//! ever sees zero or two OPEN cycles for a threshold.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::CycleConfig;
use crate::types::PriceCycle;
use crate::EngineResult;
use persistence::repository::CycleRepository;
use persistence::{DbError, SqlitePool};

/// What one tick did across all thresholds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub opened: u32,
    pub closed: u32,
    pub updated: u32,
}

/// Tracks one OPEN cycle per configured threshold
pub struct CycleTracker {
    pool: SqlitePool,
    config: CycleConfig,
    last_tick: RwLock<Option<DateTime<Utc>>>,
}

impl CycleTracker {
    pub fn new(pool: SqlitePool, config: CycleConfig) -> Self {
        Self {
            pool,
            config,
            last_tick: RwLock::new(None),
        }
    }

    /// Feed one price tick through every threshold's state machine
    pub async fn on_tick(
        &self,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> EngineResult<TickOutcome> {
        let mut outcome = TickOutcome::default();

        for threshold in self.config.thresholds.clone() {
            self.update_threshold(threshold, price, timestamp, &mut outcome)
                .await?;
        }

        *self.last_tick.write().unwrap() = Some(timestamp);
        Ok(outcome)
    }

    async fn update_threshold(
        &self,
        threshold: Decimal,
        price: Decimal,
        timestamp: DateTime<Utc>,
        outcome: &mut TickOutcome,
    ) -> EngineResult<()> {
        let repo = CycleRepository::new(&self.pool);
        let threshold_key = threshold.to_string();

        let Some(record) = repo.get_open(&threshold_key).await? else {
            let id = repo
                .open_cycle(&threshold_key, timestamp.timestamp(), &price.to_string())
                .await?;
            info!(cycle_id = id, threshold = %threshold, price = %price, "Opened cycle");
            outcome.opened += 1;
            return Ok(());
        };

        let cycle = PriceCycle::from_record(&record);
        let highest = cycle.highest_price.max(price);
        let lowest = cycle.lowest_price.min(price);

        let retrace = if highest > Decimal::ZERO {
            (highest - price) / highest
        } else {
            Decimal::ZERO
        };

        if retrace >= threshold {
            match repo
                .close_and_reopen(
                    cycle.id,
                    &threshold_key,
                    timestamp.timestamp(),
                    &price.to_string(),
                )
                .await
            {
                Ok(new_id) => {
                    info!(
                        closed_id = cycle.id,
                        new_id,
                        threshold = %threshold,
                        high = %highest,
                        price = %price,
                        "Cycle closed on retrace, successor opened"
                    );
                    outcome.closed += 1;
                    outcome.opened += 1;
                }
                // Out-of-order tick would corrupt the cycle; skip, do not persist
                Err(DbError::Corrupt(msg)) => {
                    warn!(cycle_id = cycle.id, %msg, "Rejected out-of-order cycle close");
                }
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }

        if highest != cycle.highest_price || lowest != cycle.lowest_price {
            repo.update_extremes(cycle.id, &highest.to_string(), &lowest.to_string())
                .await?;
            debug!(cycle_id = cycle.id, high = %highest, low = %lowest, "Updated cycle extremes");
            outcome.updated += 1;
        }

        Ok(())
    }

    /// True when no tick has arrived within the staleness window. Downstream
    /// consumers suppress new entries while stale; exits keep serving from
    /// cached state.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match *self.last_tick.read().unwrap() {
            Some(last) => (now - last).num_seconds() > self.config.staleness_window_secs,
            None => true,
        }
    }

    /// The running high of a threshold's open cycle, if one exists
    pub async fn open_cycle(&self, threshold: Decimal) -> EngineResult<Option<PriceCycle>> {
        let repo = CycleRepository::new(&self.pool);
        let record = repo.get_open(&threshold.to_string()).await?;
        Ok(record.as_ref().map(PriceCycle::from_record))
    }
}
