//! Trailing-stop exit manager
//!
//! Once per scheduling tick every PENDING position is checked against the
//! gain-bucketed tolerance ladder. The per-position decision is a pure
//! function; the sweep owns store access and the audit trail. Selling is
//! idempotent — terminal positions are excluded from the sweep and the
//! terminal update is status-guarded in the store.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::ExitConfig;
use crate::reader::TimeSeriesReader;
use crate::types::{Position, ToleranceBasis, ToleranceRule};
use crate::EngineResult;
use persistence::repository::cycles::PriceCycleRecord;
use persistence::repository::positions::PriceCheckRecord;
use persistence::repository::{CycleRepository, PositionRepository};
use persistence::SqlitePool;

/// Outcome of one position check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    Hold,
    Sell,
}

impl ExitDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitDecision::Hold => "hold",
            ExitDecision::Sell => "sell",
        }
    }
}

/// The numbers behind one check, for the audit trail
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckMetrics {
    pub gain_from_entry: Decimal,
    pub drawdown: Decimal,
    pub basis: ToleranceBasis,
    pub allowed_drawdown_pct: Decimal,
}

/// Select the tolerance rule whose bucket contains the gain
/// (`lower <= gain < upper`)
pub fn select_rule(rules: &[ToleranceRule], gain: Decimal) -> Option<&ToleranceRule> {
    rules
        .iter()
        .find(|r| r.bucket_lower <= gain && gain < r.bucket_upper)
}

/// Pure trailing-stop decision for one position.
///
/// `highest` must already include `current` (the caller raises the running
/// high first). Returns Hold with no metrics when no bucket matches.
pub fn check_position(
    entry_price: Decimal,
    highest: Decimal,
    current: Decimal,
    rules: &[ToleranceRule],
) -> (ExitDecision, Option<CheckMetrics>) {
    if entry_price.is_zero() || highest.is_zero() {
        return (ExitDecision::Hold, None);
    }

    let gain_from_entry = (current - entry_price) / entry_price;

    let Some(rule) = select_rule(rules, gain_from_entry) else {
        return (ExitDecision::Hold, None);
    };

    let drawdown = match rule.basis {
        ToleranceBasis::FromHigh => (highest - current) / highest,
        ToleranceBasis::FromEntry => (entry_price - current) / entry_price,
    };

    let decision = if drawdown >= rule.allowed_drawdown_pct {
        ExitDecision::Sell
    } else {
        ExitDecision::Hold
    };

    (
        decision,
        Some(CheckMetrics {
            gain_from_entry,
            drawdown,
            basis: rule.basis,
            allowed_drawdown_pct: rule.allowed_drawdown_pct,
        }),
    )
}

/// Per-sweep counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub checked: u32,
    pub sold: u32,
    pub held: u32,
    pub errors: u32,
}

/// Runs the trailing-stop sweep over all pending positions
pub struct ExitManager {
    pool: SqlitePool,
    reader: Arc<dyn TimeSeriesReader>,
    config: ExitConfig,
    token: String,
}

impl ExitManager {
    pub fn new(
        pool: SqlitePool,
        reader: Arc<dyn TimeSeriesReader>,
        config: ExitConfig,
        token: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            reader,
            config,
            token: token.into(),
        }
    }

    /// Check every pending position once. One position's failure never stops
    /// the sweep.
    pub async fn run_sweep(&self) -> EngineResult<SweepStats> {
        let mut stats = SweepStats::default();

        let Some(tick) = self.reader.latest_price(&self.token).await? else {
            debug!("Exit sweep skipped: no price available");
            return Ok(stats);
        };

        let repo = PositionRepository::new(&self.pool);
        let pending = repo.list_pending().await?;

        for record in pending {
            stats.checked += 1;
            match self.check_one(&record, tick.price).await {
                Ok(ExitDecision::Sell) => stats.sold += 1,
                Ok(ExitDecision::Hold) => stats.held += 1,
                Err(e) => {
                    stats.errors += 1;
                    error!(
                        position_id = record.id.unwrap_or(0),
                        error = %e,
                        "Exit check failed, will retry next sweep"
                    );
                }
            }
        }

        if stats.sold > 0 {
            info!(
                checked = stats.checked,
                sold = stats.sold,
                "Exit sweep complete"
            );
        }
        Ok(stats)
    }

    async fn check_one(
        &self,
        record: &persistence::repository::positions::PositionRecord,
        current: Decimal,
    ) -> EngineResult<ExitDecision> {
        let position = Position::from_record(record);
        let id = position.id;
        let repo = PositionRepository::new(&self.pool);

        // A cycle that opened before the entry may carry a peak the position
        // never saw; only a high from a cycle started at or after entry is
        // usable. Gone/closed/older cycles fall back to the cached high.
        let cycle_high = match position.cycle_id {
            Some(cycle_id) => {
                self.cycle_high_since(cycle_id, position.entry_time.timestamp())
                    .await?
            }
            None => None,
        };

        let mut highest = position.highest_price_since_entry;
        if let Some(h) = cycle_high {
            highest = highest.max(h);
        }
        if current > highest {
            highest = current;
        }
        if highest > position.highest_price_since_entry {
            repo.update_highest(id, &highest.to_string()).await?;
        }

        let (decision, metrics) =
            check_position(position.entry_price, highest, current, &self.config.rules);

        if metrics.is_none() {
            warn!(
                position_id = id,
                "No tolerance bucket matched, holding by default"
            );
        }

        if self.config.record_checks {
            if let Some(m) = metrics {
                repo.record_price_check(&PriceCheckRecord {
                    id: None,
                    position_id: id,
                    checked_at: Utc::now().timestamp(),
                    price: current.to_string(),
                    gain_pct: m.gain_from_entry.to_string(),
                    drawdown_pct: m.drawdown.to_string(),
                    rule_basis: m.basis.as_str().to_string(),
                    allowed_drawdown_pct: m.allowed_drawdown_pct.to_string(),
                    decision: decision.as_str().to_string(),
                })
                .await?;
            }
        }

        if decision == ExitDecision::Sell {
            let exit_time = Utc::now().timestamp();
            let exit_price = current.to_string();
            // Selling is the one write worth retrying through lock contention
            let updated = persistence::with_retry("mark_sold", || {
                repo.mark_sold(id, exit_time, &exit_price, "trailing_stop")
            })
            .await?;
            if updated {
                info!(
                    position_id = id,
                    entry = %position.entry_price,
                    exit = %current,
                    high = %highest,
                    "Position sold by trailing stop"
                );
            }
        }

        Ok(decision)
    }

    async fn cycle_high_since(&self, cycle_id: i64, entry_ts: i64) -> EngineResult<Option<Decimal>> {
        let repo = CycleRepository::new(&self.pool);
        let record: Option<PriceCycleRecord> = repo.get(cycle_id).await?;
        Ok(record
            .filter(|c| c.status == "open" && c.start_time >= entry_ts)
            .map(|c| crate::types::parse_dec(&c.highest_price)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemoryReader;
    use persistence::repository::positions::PositionRecord;
    use persistence::Database;
    use rust_decimal_macros::dec;

    fn from_high_rule(allowed: Decimal) -> Vec<ToleranceRule> {
        vec![ToleranceRule {
            bucket_lower: dec!(-1),
            bucket_upper: dec!(1000),
            basis: ToleranceBasis::FromHigh,
            allowed_drawdown_pct: allowed,
        }]
    }

    #[test]
    fn test_from_high_sell_boundary() {
        let rules = from_high_rule(dec!(0.03));

        // entry 100, high 110, 3% tolerance: sell exactly at 106.7 and below
        let (decision, _) = check_position(dec!(100), dec!(110), dec!(106.7), &rules);
        assert_eq!(decision, ExitDecision::Sell);

        let (decision, metrics) = check_position(dec!(100), dec!(110), dec!(106.71), &rules);
        assert_eq!(decision, ExitDecision::Hold);
        assert!(metrics.unwrap().drawdown < dec!(0.03));

        let (decision, _) = check_position(dec!(100), dec!(110), dec!(105), &rules);
        assert_eq!(decision, ExitDecision::Sell);
    }

    #[test]
    fn test_from_entry_basis() {
        let rules = vec![ToleranceRule {
            bucket_lower: dec!(-1),
            bucket_upper: dec!(0),
            basis: ToleranceBasis::FromEntry,
            allowed_drawdown_pct: dec!(0.05),
        }];

        // 4% under entry: hold
        let (decision, _) = check_position(dec!(100), dec!(100), dec!(96), &rules);
        assert_eq!(decision, ExitDecision::Hold);
        // 5% under entry: sell
        let (decision, metrics) = check_position(dec!(100), dec!(100), dec!(95), &rules);
        assert_eq!(decision, ExitDecision::Sell);
        assert_eq!(metrics.unwrap().drawdown, dec!(0.05));
    }

    #[test]
    fn test_bucket_selection() {
        let rules = crate::config::ExitConfig::default().rules;
        assert_eq!(
            select_rule(&rules, dec!(-0.02)).unwrap().basis,
            ToleranceBasis::FromEntry
        );
        assert_eq!(
            select_rule(&rules, dec!(0.03)).unwrap().allowed_drawdown_pct,
            dec!(0.03)
        );
        assert_eq!(
            select_rule(&rules, dec!(0.20)).unwrap().allowed_drawdown_pct,
            dec!(0.08)
        );
        // Bucket bounds are half-open: gain 0.05 falls in the next bucket up
        assert_eq!(
            select_rule(&rules, dec!(0.05)).unwrap().allowed_drawdown_pct,
            dec!(0.05)
        );
    }

    fn pending(entry: &str, high: &str) -> PositionRecord {
        PositionRecord {
            id: None,
            source_id: "w".to_string(),
            entry_time: 1000,
            entry_price: entry.to_string(),
            cycle_id: None,
            status: "pending".to_string(),
            highest_price_since_entry: high.to_string(),
            exit_time: None,
            exit_price: None,
            exit_reason: None,
            validation_log: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_sweep_sells_and_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let reader = Arc::new(MemoryReader::new());
        reader.push_price(Utc::now(), dec!(106.7));

        let manager = ExitManager::new(
            db.pool_clone(),
            reader.clone(),
            ExitConfig {
                rules: from_high_rule(dec!(0.03)),
                record_checks: true,
            },
            "SOL",
        );

        let repo = PositionRepository::new(db.pool());
        let id = repo.create(&pending("100", "110")).await.unwrap();

        let stats = manager.run_sweep().await.unwrap();
        assert_eq!(stats.sold, 1);

        let sold = repo.get(id).await.unwrap().unwrap();
        assert_eq!(sold.status, "sold");
        assert_eq!(sold.exit_price.as_deref(), Some("106.7"));
        assert_eq!(sold.exit_reason.as_deref(), Some("trailing_stop"));

        // Second sweep sees no pending positions
        let stats = manager.run_sweep().await.unwrap();
        assert_eq!(stats.checked, 0);
        let still_sold = repo.get(id).await.unwrap().unwrap();
        assert_eq!(still_sold.exit_price.as_deref(), Some("106.7"));
    }

    #[tokio::test]
    async fn test_sweep_updates_running_high_and_records_checks() {
        let db = Database::in_memory().await.unwrap();
        let reader = Arc::new(MemoryReader::new());
        reader.push_price(Utc::now(), dec!(109));

        let manager = ExitManager::new(
            db.pool_clone(),
            reader.clone(),
            ExitConfig {
                rules: from_high_rule(dec!(0.05)),
                record_checks: true,
            },
            "SOL",
        );

        let repo = PositionRepository::new(db.pool());
        let id = repo.create(&pending("100", "100")).await.unwrap();

        let stats = manager.run_sweep().await.unwrap();
        assert_eq!(stats.held, 1);

        let record = repo.get(id).await.unwrap().unwrap();
        assert_eq!(record.highest_price_since_entry, "109");

        let checks = repo.list_price_checks(id).await.unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].decision, "hold");
        assert_eq!(checks[0].rule_basis, "from_high");
    }

    #[tokio::test]
    async fn test_pre_entry_cycle_peak_is_not_imported() {
        let db = Database::in_memory().await.unwrap();
        let reader = Arc::new(MemoryReader::new());
        reader.push_price(Utc::now(), dec!(105));

        let manager = ExitManager::new(
            db.pool_clone(),
            reader.clone(),
            ExitConfig {
                rules: from_high_rule(dec!(0.03)),
                record_checks: false,
            },
            "SOL",
        );

        // The cycle peaked at 120 before this position entered at 100.
        // That peak is not a drawdown the position ever experienced.
        let cycles = CycleRepository::new(db.pool());
        let cycle_id = cycles.open_cycle("0.05", 500, "100").await.unwrap();
        cycles.update_extremes(cycle_id, "120", "90").await.unwrap();

        let repo = PositionRepository::new(db.pool());
        let mut record = pending("100", "100");
        record.cycle_id = Some(cycle_id);
        let id = repo.create(&record).await.unwrap();

        let stats = manager.run_sweep().await.unwrap();
        assert_eq!(stats.held, 1);
        assert_eq!(stats.sold, 0);

        let held = repo.get(id).await.unwrap().unwrap();
        assert_eq!(held.status, "pending");
        // Running high comes from observed prices, not the stale peak
        assert_eq!(held.highest_price_since_entry, "105");
    }

    #[tokio::test]
    async fn test_post_entry_cycle_high_drives_drawdown() {
        let db = Database::in_memory().await.unwrap();
        let reader = Arc::new(MemoryReader::new());
        reader.push_price(Utc::now(), dec!(106));

        let manager = ExitManager::new(
            db.pool_clone(),
            reader.clone(),
            ExitConfig {
                rules: from_high_rule(dec!(0.03)),
                record_checks: false,
            },
            "SOL",
        );

        // Cycle started after entry, so its 110 high postdates the position
        let cycles = CycleRepository::new(db.pool());
        let cycle_id = cycles.open_cycle("0.05", 2000, "106").await.unwrap();
        cycles.update_extremes(cycle_id, "110", "100").await.unwrap();

        let repo = PositionRepository::new(db.pool());
        let mut record = pending("100", "100");
        record.cycle_id = Some(cycle_id);
        let id = repo.create(&record).await.unwrap();

        // Drawdown from imported high 110: (110-106)/110 = 3.6% >= 3% -> sell
        let stats = manager.run_sweep().await.unwrap();
        assert_eq!(stats.sold, 1);
        assert_eq!(repo.get(id).await.unwrap().unwrap().status, "sold");
    }

    #[tokio::test]
    async fn test_missing_cycle_falls_back_to_cached_high() {
        let db = Database::in_memory().await.unwrap();
        let reader = Arc::new(MemoryReader::new());
        reader.push_price(Utc::now(), dec!(106));

        let manager = ExitManager::new(
            db.pool_clone(),
            reader.clone(),
            ExitConfig {
                rules: from_high_rule(dec!(0.03)),
                record_checks: false,
            },
            "SOL",
        );

        let repo = PositionRepository::new(db.pool());
        // cycle_id points at a cycle that was archived away
        let mut record = pending("100", "110");
        record.cycle_id = Some(9999);
        let id = repo.create(&record).await.unwrap();

        // Drawdown from cached high 110: (110-106)/110 = 3.6% >= 3% -> sell
        let stats = manager.run_sweep().await.unwrap();
        assert_eq!(stats.sold, 1);
        assert_eq!(
            repo.get(id).await.unwrap().unwrap().status,
            "sold"
        );
    }
}
