//! Auto-filter optimizer
//!
//! Periodic batch job that mines recent closed positions for the filter set
//! best separating profitable entries from unprofitable ones. Each scenario is
//! one hyperparameter tuple; every scenario's result is persisted for
//! transparency, the global winner is marked selected and atomically swapped
//! in as the active filter set for auto-managed projects. An infeasible run
//! (no scenario meets its minimums) leaves the previous set untouched — an
//! empty filter set would accept everything.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, RwLock,
};
use tracing::{debug, info, warn};

use crate::cache::{OutcomeCache, OutcomeRow};
use crate::config::OptimizerConfig;
use crate::features::FeatureField;
use crate::EngineResult;
use persistence::repository::filters::FilterDefinitionRecord;
use persistence::repository::scenarios::ScenarioRecord;
use persistence::repository::{FilterRepository, ScenarioRepository};
use persistence::SqlitePool;

/// Candidates considered per greedy combination search
const CANDIDATE_POOL: usize = 40;

// ============================================================================
// Scenarios
// ============================================================================

/// One optimizer hyperparameter tuple
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioParams {
    pub lookback_hours: i64,
    /// Closed positions with gain at or above this fraction are labeled GOOD
    pub good_gain_threshold: Decimal,
    pub min_filters: usize,
    pub max_filters: usize,
    /// Minimum acceptable good_kept_pct / bad_removed_pct (percent points)
    pub min_good_kept_pct: f64,
    pub min_bad_removed_pct: f64,
    /// Default percentile bounds for candidate intervals over the GOOD
    /// distribution; variants around these are tested per config
    pub lower_percentile: f64,
    pub upper_percentile: f64,
}

impl ScenarioParams {
    /// Deduplication hash over the serialized tuple
    pub fn params_hash(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let hash = Sha256::digest(json.as_bytes());
        format!("{:x}", hash)
    }
}

/// Default scenario grid: lookback windows x percentile bounds x combination
/// sizes
pub fn default_scenarios() -> Vec<ScenarioParams> {
    let lookbacks: &[i64] = &[24, 72, 168];
    let percentiles: &[(f64, f64)] = &[(10.0, 90.0), (20.0, 80.0), (25.0, 75.0)];
    let max_filters: &[usize] = &[2, 3];

    let mut scenarios = Vec::with_capacity(lookbacks.len() * percentiles.len() * max_filters.len());
    for &lookback_hours in lookbacks {
        for &(lower_percentile, upper_percentile) in percentiles {
            for &max in max_filters {
                scenarios.push(ScenarioParams {
                    lookback_hours,
                    good_gain_threshold: dec!(0.02),
                    min_filters: 1,
                    max_filters: max,
                    min_good_kept_pct: 60.0,
                    min_bad_removed_pct: 50.0,
                    lower_percentile,
                    upper_percentile,
                });
            }
        }
    }
    scenarios
}

// ============================================================================
// Candidates and combinations
// ============================================================================

/// One candidate interval with its standalone separation stats
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateInterval {
    pub field: FeatureField,
    pub minute_offset: u32,
    pub from: f64,
    pub to: f64,
    pub good_kept_pct: f64,
    pub bad_removed_pct: f64,
}

/// A scored filter combination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterCombination {
    pub filters: Vec<CandidateInterval>,
    pub good_kept_pct: f64,
    pub bad_removed_pct: f64,
    pub score: f64,
}

/// The winning combination of a run
#[derive(Debug, Clone)]
pub struct SelectedFilterSet {
    pub run_id: String,
    pub combination: FilterCombination,
}

/// Linear-interpolated percentile of an ascending-sorted slice
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let p = p.clamp(0.0, 100.0);
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

/// A row passes an interval when the value exists and lies inside it.
/// Missing values count as outside, matching the validator's fail-closed
/// default.
fn row_passes(row: &OutcomeRow, field: FeatureField, minute_offset: u32, from: f64, to: f64) -> bool {
    match row.snapshot.value(field, minute_offset).and_then(|v| v.to_f64()) {
        Some(v) => v >= from && v <= to,
        None => false,
    }
}

/// good_kept_pct / bad_removed_pct for a set of intervals applied jointly
fn combination_stats(
    good: &[&OutcomeRow],
    bad: &[&OutcomeRow],
    intervals: &[&CandidateInterval],
) -> (f64, f64) {
    let passes_all = |row: &OutcomeRow| {
        intervals
            .iter()
            .all(|c| row_passes(row, c.field, c.minute_offset, c.from, c.to))
    };

    let good_kept = good.iter().filter(|r| passes_all(r)).count();
    let bad_kept = bad.iter().filter(|r| passes_all(r)).count();

    let good_kept_pct = if good.is_empty() {
        0.0
    } else {
        good_kept as f64 / good.len() as f64 * 100.0
    };
    let bad_removed_pct = if bad.is_empty() {
        0.0
    } else {
        (bad.len() - bad_kept) as f64 / bad.len() as f64 * 100.0
    };
    (good_kept_pct, bad_removed_pct)
}

fn dec_from_f64(v: f64) -> Decimal {
    Decimal::from_f64_retain(v).unwrap_or(Decimal::ZERO)
}

fn candidate_to_definition(c: &CandidateInterval) -> FilterDefinitionRecord {
    FilterDefinitionRecord {
        id: None,
        // Rewritten per target project on insert
        project_id: 0,
        field: c.field.as_str().to_string(),
        minute_offset: c.minute_offset as i64,
        from_value: dec_from_f64(c.from).to_string(),
        to_value: dec_from_f64(c.to).to_string(),
        is_ratio: c.field.is_ratio() as i64,
        active: 1,
    }
}

// ============================================================================
// Progress tracking
// ============================================================================

/// Optimization run status
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeStatus {
    Idle,
    Running,
    Complete,
    Error,
}

/// Shared progress tracker between API handler and background task
pub struct OptimizeProgress {
    pub status: RwLock<OptimizeStatus>,
    pub total_scenarios: AtomicU32,
    pub completed: AtomicU32,
    pub cancelled: AtomicBool,
    pub last_run_id: RwLock<Option<String>>,
    pub error_message: RwLock<Option<String>>,
}

impl OptimizeProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(OptimizeStatus::Idle),
            total_scenarios: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            last_run_id: RwLock::new(None),
            error_message: RwLock::new(None),
        }
    }

    /// Reset for a new run
    pub fn reset(&self, run_id: &str, total: u32) {
        *self.status.write().unwrap() = OptimizeStatus::Running;
        self.total_scenarios.store(total, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        *self.last_run_id.write().unwrap() = Some(run_id.to_string());
        *self.error_message.write().unwrap() = None;
    }

    /// Request cancellation between scenarios
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Get progress as percentage
    pub fn progress_pct(&self) -> f32 {
        let total = self.total_scenarios.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.status.read().unwrap(), OptimizeStatus::Running)
    }
}

impl Default for OptimizeProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Optimizer
// ============================================================================

/// Periodic filter-set optimizer
pub struct Optimizer {
    pool: SqlitePool,
    config: OptimizerConfig,
    /// Minute offsets 0..N considered for candidate intervals
    snapshot_minutes: u32,
    progress: Arc<OptimizeProgress>,
}

impl Optimizer {
    pub fn new(
        pool: SqlitePool,
        config: OptimizerConfig,
        snapshot_minutes: u32,
        progress: Arc<OptimizeProgress>,
    ) -> Self {
        Self {
            pool,
            config,
            snapshot_minutes,
            progress,
        }
    }

    /// Run every scenario against the outcome cache, persist all results, and
    /// install the winning filter set. Returns None when no scenario was
    /// feasible (previous active set stays in place).
    pub async fn run(
        &self,
        cache: &OutcomeCache,
        scenarios: &[ScenarioParams],
        now: DateTime<Utc>,
    ) -> EngineResult<Option<SelectedFilterSet>> {
        let run_id = format!("run-{}", now.timestamp());
        self.progress.reset(&run_id, scenarios.len() as u32);

        match self.run_inner(cache, scenarios, now, &run_id).await {
            Ok(selected) => {
                *self.progress.status.write().unwrap() = OptimizeStatus::Complete;
                Ok(selected)
            }
            Err(e) => {
                *self.progress.status.write().unwrap() = OptimizeStatus::Error;
                *self.progress.error_message.write().unwrap() = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        cache: &OutcomeCache,
        scenarios: &[ScenarioParams],
        now: DateTime<Utc>,
        run_id: &str,
    ) -> EngineResult<Option<SelectedFilterSet>> {
        let repo = ScenarioRepository::new(&self.pool);
        let mut best: Option<(String, FilterCombination)> = None;

        info!(
            run_id,
            scenarios = scenarios.len(),
            cached_outcomes = cache.len(),
            "Optimizer run started"
        );

        for (i, params) in scenarios.iter().enumerate() {
            if self.progress.cancelled.load(Ordering::Relaxed) {
                warn!(run_id, completed = i, "Optimizer run cancelled");
                break;
            }

            let outcome = self.evaluate_scenario(cache, params, now);
            let hash = params.params_hash();

            let record = match &outcome {
                Some(combo) => ScenarioRecord {
                    id: None,
                    run_id: run_id.to_string(),
                    params_hash: hash.clone(),
                    params: serde_json::to_string(params)?,
                    score: Some(format!("{:.4}", combo.score)),
                    good_kept_pct: Some(format!("{:.2}", combo.good_kept_pct)),
                    bad_removed_pct: Some(format!("{:.2}", combo.bad_removed_pct)),
                    filters: Some(serde_json::to_string(&combo.filters)?),
                    feasible: 1,
                    selected: 0,
                },
                None => ScenarioRecord {
                    id: None,
                    run_id: run_id.to_string(),
                    params_hash: hash.clone(),
                    params: serde_json::to_string(params)?,
                    score: None,
                    good_kept_pct: None,
                    bad_removed_pct: None,
                    filters: None,
                    feasible: 0,
                    selected: 0,
                },
            };
            repo.save(&record).await?;

            if let Some(combo) = outcome {
                let better = match &best {
                    Some((_, current)) => combo.score > current.score,
                    None => true,
                };
                if better {
                    best = Some((hash, combo));
                }
            }

            self.progress.completed.store((i + 1) as u32, Ordering::Relaxed);
            tokio::task::yield_now().await;
        }

        let Some((winner_hash, combo)) = best else {
            warn!(run_id, "No feasible scenario, keeping previous filter set");
            return Ok(None);
        };

        repo.mark_selected(run_id, &winner_hash).await?;
        self.install_active_set(&combo).await?;

        info!(
            run_id,
            filters = combo.filters.len(),
            score = combo.score,
            good_kept_pct = combo.good_kept_pct,
            bad_removed_pct = combo.bad_removed_pct,
            "Optimizer selected new filter set"
        );

        Ok(Some(SelectedFilterSet {
            run_id: run_id.to_string(),
            combination: combo,
        }))
    }

    /// Swap the winning set in for every auto-managed project, atomically
    async fn install_active_set(&self, combo: &FilterCombination) -> EngineResult<()> {
        let repo = FilterRepository::new(&self.pool);
        let projects = repo.auto_managed_projects().await?;
        if projects.is_empty() {
            debug!("No auto-managed projects, selection recorded only");
            return Ok(());
        }

        let definitions: Vec<FilterDefinitionRecord> =
            combo.filters.iter().map(candidate_to_definition).collect();
        repo.replace_active_set(&projects, &definitions).await?;
        Ok(())
    }

    /// Pure, CPU-bound scenario evaluation against the cached outcomes
    fn evaluate_scenario(
        &self,
        cache: &OutcomeCache,
        params: &ScenarioParams,
        now: DateTime<Utc>,
    ) -> Option<FilterCombination> {
        let rows = cache.rows_within(now, params.lookback_hours);
        let (good, bad): (Vec<&OutcomeRow>, Vec<&OutcomeRow>) = rows
            .into_iter()
            .partition(|r| r.gain >= params.good_gain_threshold);

        if good.len() < self.config.min_good_samples || bad.len() < self.config.min_bad_samples {
            debug!(
                good = good.len(),
                bad = bad.len(),
                lookback_hours = params.lookback_hours,
                "Scenario skipped, not enough labeled samples"
            );
            return None;
        }

        let candidates = self.generate_candidates(&good, &bad, params);
        if candidates.is_empty() {
            return None;
        }

        self.greedy_search(&good, &bad, candidates, params)
    }

    /// Candidate intervals per (field, minute offset) from percentile bounds
    /// of the GOOD distribution, with the configured bound variants
    fn generate_candidates(
        &self,
        good: &[&OutcomeRow],
        bad: &[&OutcomeRow],
        params: &ScenarioParams,
    ) -> Vec<CandidateInterval> {
        let mut candidates = Vec::new();

        for &field in FeatureField::all() {
            for minute_offset in 0..self.snapshot_minutes {
                let mut values: Vec<f64> = good
                    .iter()
                    .filter_map(|r| r.snapshot.value(field, minute_offset))
                    .filter_map(|v| v.to_f64())
                    .collect();
                if values.len() < self.config.min_good_samples {
                    continue;
                }
                values.sort_by(|a, b| a.total_cmp(b));

                for &delta in &self.config.percentile_deltas {
                    let lower_p = (params.lower_percentile + delta).clamp(0.0, 100.0);
                    let upper_p = (params.upper_percentile - delta).clamp(0.0, 100.0);
                    if lower_p >= upper_p {
                        continue;
                    }

                    let from = percentile(&values, lower_p);
                    let to = percentile(&values, upper_p);
                    if from > to {
                        continue;
                    }

                    let candidate_ref = CandidateInterval {
                        field,
                        minute_offset,
                        from,
                        to,
                        good_kept_pct: 0.0,
                        bad_removed_pct: 0.0,
                    };
                    let (good_kept_pct, bad_removed_pct) =
                        combination_stats(good, bad, &[&candidate_ref]);

                    candidates.push(CandidateInterval {
                        good_kept_pct,
                        bad_removed_pct,
                        ..candidate_ref
                    });
                }
            }
        }

        candidates
    }

    /// Greedy expansion from the best single filters up to max_filters,
    /// keeping the best combination that honors the scenario minimums
    fn greedy_search(
        &self,
        good: &[&OutcomeRow],
        bad: &[&OutcomeRow],
        mut candidates: Vec<CandidateInterval>,
        params: &ScenarioParams,
    ) -> Option<FilterCombination> {
        candidates.sort_by(|a, b| {
            self.score(b.good_kept_pct, b.bad_removed_pct)
                .total_cmp(&self.score(a.good_kept_pct, a.bad_removed_pct))
        });
        candidates.truncate(CANDIDATE_POOL);

        let mut chosen: Vec<usize> = Vec::new();
        let mut best: Option<FilterCombination> = None;

        while chosen.len() < params.max_filters {
            let mut step_best: Option<(usize, f64, f64, f64)> = None;

            for (idx, _) in candidates.iter().enumerate() {
                if chosen.contains(&idx) {
                    continue;
                }
                let trial: Vec<&CandidateInterval> = chosen
                    .iter()
                    .chain(std::iter::once(&idx))
                    .map(|&i| &candidates[i])
                    .collect();
                let (good_kept, bad_removed) = combination_stats(good, bad, &trial);
                let score = self.score(good_kept, bad_removed);

                let improves = match &step_best {
                    Some((_, _, _, s)) => score > *s,
                    None => true,
                };
                if improves {
                    step_best = Some((idx, good_kept, bad_removed, score));
                }
            }

            let Some((idx, good_kept, bad_removed, score)) = step_best else {
                break;
            };
            chosen.push(idx);

            let qualifies = chosen.len() >= params.min_filters
                && good_kept >= params.min_good_kept_pct
                && bad_removed >= params.min_bad_removed_pct;
            let better = match &best {
                Some(b) => score > b.score,
                None => true,
            };
            if qualifies && better {
                best = Some(FilterCombination {
                    filters: chosen.iter().map(|&i| candidates[i].clone()).collect(),
                    good_kept_pct: good_kept,
                    bad_removed_pct: bad_removed,
                    score,
                });
            }
        }

        best
    }

    fn score(&self, good_kept_pct: f64, bad_removed_pct: f64) -> f64 {
        score(&self.config, good_kept_pct, bad_removed_pct)
    }
}

/// `bad_removed * w_bad + good_kept * w_good`, penalized under the
/// bad-removal floor. The weighting deliberately rejects bad trades harder
/// than it retains good ones.
fn score(config: &OptimizerConfig, good_kept_pct: f64, bad_removed_pct: f64) -> f64 {
    let w_bad = config.w_bad.to_f64().unwrap_or(0.7);
    let w_good = config.w_good.to_f64().unwrap_or(0.3);
    let floor = config.bad_removed_floor.to_f64().unwrap_or(50.0);
    let penalty = config.floor_penalty.to_f64().unwrap_or(0.5);

    let raw = bad_removed_pct * w_bad + good_kept_pct * w_good;
    if bad_removed_pct < floor {
        raw * penalty
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureSnapshot;
    use crate::reader::MemoryReader;
    use chrono::Duration;
    use persistence::repository::positions::PositionRecord;
    use persistence::repository::PositionRepository;
    use persistence::Database;

    fn scenario(lookback_hours: i64, lower: f64, upper: f64) -> ScenarioParams {
        ScenarioParams {
            lookback_hours,
            good_gain_threshold: dec!(0.02),
            min_filters: 1,
            max_filters: 2,
            min_good_kept_pct: 90.0,
            min_bad_removed_pct: 90.0,
            lower_percentile: lower,
            upper_percentile: upper,
        }
    }

    fn outcome_row(id: i64, gain: Decimal, x: f64) -> OutcomeRow {
        let entry_time = Utc::now();
        let mut snapshot = FeatureSnapshot::new(entry_time);
        snapshot.insert(0, FeatureField::ObImbalance, dec_from_f64(x));
        OutcomeRow {
            position_id: id,
            entry_time,
            gain,
            snapshot,
        }
    }

    #[test]
    fn test_percentile_interpolation() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 100.0), 5.0);
        assert_eq!(percentile(&values, 50.0), 3.0);
        assert_eq!(percentile(&values, 25.0), 2.0);
        assert_eq!(percentile(&values, 12.5), 1.5);
    }

    #[test]
    fn test_combination_stats_treat_missing_as_outside() {
        let good: Vec<OutcomeRow> = vec![
            outcome_row(1, dec!(0.05), 15.0),
            outcome_row(2, dec!(0.05), 18.0),
        ];
        let mut no_value = outcome_row(3, dec!(0.05), 0.0);
        no_value.snapshot = FeatureSnapshot::new(no_value.entry_time);
        let good_refs: Vec<&OutcomeRow> = good.iter().chain(std::iter::once(&no_value)).collect();

        let bad = [outcome_row(4, dec!(-0.05), 30.0)];
        let bad_refs: Vec<&OutcomeRow> = bad.iter().collect();

        let interval = CandidateInterval {
            field: FeatureField::ObImbalance,
            minute_offset: 0,
            from: 10.0,
            to: 20.0,
            good_kept_pct: 0.0,
            bad_removed_pct: 0.0,
        };
        let (good_kept, bad_removed) = combination_stats(&good_refs, &bad_refs, &[&interval]);
        // 2 of 3 good inside (the snapshot-less row counts as outside)
        assert!((good_kept - 66.66).abs() < 0.1);
        assert_eq!(bad_removed, 100.0);
    }

    #[test]
    fn test_params_hash_is_stable_and_distinct() {
        let a = scenario(24, 10.0, 90.0);
        assert_eq!(a.params_hash(), a.params_hash());
        assert_ne!(a.params_hash(), scenario(72, 10.0, 90.0).params_hash());
    }

    async fn seed_sold_position(
        db: &Database,
        reader: &MemoryReader,
        entry: DateTime<Utc>,
        x: f64,
        exit_price: &str,
    ) {
        reader.set_feature(entry, FeatureField::ObImbalance, dec_from_f64(x));
        let repo = PositionRepository::new(db.pool());
        let id = repo
            .create(&PositionRecord {
                id: None,
                source_id: "w".to_string(),
                entry_time: entry.timestamp(),
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
        repo.mark_sold(id, entry.timestamp() + 600, exit_price, "trailing_stop")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recovers_perfectly_separating_interval() {
        let db = Database::in_memory().await.unwrap();
        let reader = MemoryReader::new();
        let now = Utc::now();

        // Previous active set that should be replaced
        let filters = FilterRepository::new(db.pool());
        let project = filters.ensure_project("auto", true).await.unwrap();
        filters
            .replace_active_set(
                &[project],
                &[FilterDefinitionRecord {
                    id: None,
                    project_id: 0,
                    field: "tx_pressure".to_string(),
                    minute_offset: 0,
                    from_value: "0".to_string(),
                    to_value: "1".to_string(),
                    is_ratio: 1,
                    active: 1,
                }],
            )
            .await
            .unwrap();

        // GOOD trades have X in [10, 19.5], BAD trades are outside [10, 20]
        for i in 0..20i64 {
            let entry = now - Duration::minutes(i + 1);
            seed_sold_position(&db, &reader, entry, 10.0 + i as f64 * 0.5, "105").await;
        }
        for i in 0..20i64 {
            let entry = now - Duration::minutes(100 + i);
            let x = if i % 2 == 0 {
                25.0 + i as f64
            } else {
                2.0 + i as f64 * 0.1
            };
            seed_sold_position(&db, &reader, entry, x, "95").await;
        }

        let mut cache = OutcomeCache::new(1);
        cache.refresh(db.pool(), &reader, "SOL").await.unwrap();
        assert_eq!(cache.len(), 40);

        let config = OptimizerConfig {
            percentile_deltas: vec![0.0],
            ..OptimizerConfig::default()
        };
        let optimizer = Optimizer::new(
            db.pool_clone(),
            config,
            1,
            Arc::new(OptimizeProgress::new()),
        );

        // Full-range percentiles recover the exact GOOD interval
        let selected = optimizer
            .run(&cache, &[scenario(24, 0.0, 100.0)], now)
            .await
            .unwrap()
            .expect("scenario should be feasible");

        let combo = &selected.combination;
        assert_eq!(combo.good_kept_pct, 100.0);
        assert_eq!(combo.bad_removed_pct, 100.0);
        let filter = &combo.filters[0];
        assert_eq!(filter.field, FeatureField::ObImbalance);
        assert!(filter.from <= 10.0 && filter.from > 5.0);
        assert!(filter.to >= 19.5 && filter.to < 25.0);

        // Winner installed as the active set for the auto-managed project
        let active = filters.active_for_projects(&[project]).await.unwrap();
        assert!(active.iter().any(|d| d.field == "ob_imbalance"));
        assert!(active.iter().all(|d| d.field != "tx_pressure"));

        // Winner recorded as selected
        let scenarios = ScenarioRepository::new(db.pool());
        let winner = scenarios.latest_selected().await.unwrap().unwrap();
        assert_eq!(winner.feasible, 1);
        assert_eq!(winner.run_id, selected.run_id);
    }

    #[tokio::test]
    async fn test_infeasible_run_keeps_previous_set() {
        let db = Database::in_memory().await.unwrap();
        let now = Utc::now();

        let filters = FilterRepository::new(db.pool());
        let project = filters.ensure_project("auto", true).await.unwrap();
        filters
            .replace_active_set(
                &[project],
                &[FilterDefinitionRecord {
                    id: None,
                    project_id: 0,
                    field: "whale_net_flow".to_string(),
                    minute_offset: 0,
                    from_value: "-5".to_string(),
                    to_value: "100".to_string(),
                    is_ratio: 0,
                    active: 1,
                }],
            )
            .await
            .unwrap();

        let progress = Arc::new(OptimizeProgress::new());
        let optimizer = Optimizer::new(
            db.pool_clone(),
            OptimizerConfig::default(),
            1,
            progress.clone(),
        );

        // Empty cache: no scenario can meet the sample minimums
        let cache = OutcomeCache::new(1);
        let selected = optimizer
            .run(&cache, &[scenario(24, 10.0, 90.0)], now)
            .await
            .unwrap();
        assert!(selected.is_none());

        let active = filters.active_for_projects(&[project]).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].field, "whale_net_flow");

        // Infeasible scenario is still persisted for transparency
        let scenarios = ScenarioRepository::new(db.pool());
        let recent = scenarios.list_recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].feasible, 0);
        assert_eq!(recent[0].selected, 0);

        assert!(!progress.is_running());
        assert_eq!(progress.progress_pct(), 100.0);
    }

    #[test]
    fn test_score_applies_floor_penalty() {
        let config = OptimizerConfig::default();
        // Above the floor: plain weighted sum
        assert!((score(&config, 80.0, 90.0) - (90.0 * 0.7 + 80.0 * 0.3)).abs() < 1e-9);
        // Below the 50% bad-removal floor: halved
        assert!((score(&config, 100.0, 40.0) - (40.0 * 0.7 + 100.0 * 0.3) * 0.5).abs() < 1e-9);
    }
}
