//! Filter validator and signal pipeline
//!
//! A candidate entry passes only if every active filter of its projects
//! accepts the feature snapshot. Every decision, GO or NO_GO, leaves a
//! structured log sufficient to replay it later. Evaluation failures fail
//! closed: the outcome is ERROR, never a silent GO.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{EngineConfig, ValidatorConfig};
use crate::cycles::CycleTracker;
use crate::features::FeatureSnapshot;
use crate::momentum::{self, GateDecision};
use crate::reader::TimeSeriesReader;
use crate::types::{
    CandidateSignal, Decision, FilterDefinition, PerFilterResult, PositionStatus, ValidationLog,
    Verdict,
};
use crate::EngineResult;
use persistence::repository::positions::PositionRecord;
use persistence::repository::{FilterRepository, PositionRepository};
use persistence::SqlitePool;

/// Evaluate a snapshot against a filter set. Pure and deterministic: identical
/// inputs always produce an identical decision and log.
pub fn evaluate(
    snapshot: &FeatureSnapshot,
    filters: &[FilterDefinition],
    config: &ValidatorConfig,
) -> Decision {
    let mut log = ValidationLog::new();

    if config.missing_value_passes {
        // Fail-open override is never silent
        log.push_stage(
            "missing_value_policy",
            true,
            "override active: absent feature values pass",
        );
    }

    for filter in filters {
        let actual = snapshot.value(filter.field, filter.minute_offset);
        let passed = match actual {
            Some(value) => filter.from_value <= value && value <= filter.to_value,
            None => config.missing_value_passes,
        };

        log.push_filter(PerFilterResult {
            filter_id: filter.id,
            field: filter.field,
            minute_offset: filter.minute_offset,
            from_value: filter.from_value,
            to_value: filter.to_value,
            actual,
            passed,
        });
    }

    let verdict = if log.all_filters_passed() {
        Verdict::Go
    } else {
        Verdict::NoGo
    };

    Decision { verdict, log }
}

/// Validates candidate entries against the active filter set
pub struct FilterValidator {
    pool: SqlitePool,
    reader: Arc<dyn TimeSeriesReader>,
    config: ValidatorConfig,
    token: String,
}

impl FilterValidator {
    pub fn new(
        pool: SqlitePool,
        reader: Arc<dyn TimeSeriesReader>,
        config: ValidatorConfig,
        token: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            reader,
            config,
            token: token.into(),
        }
    }

    /// Build the snapshot, load the active filters and evaluate
    pub async fn validate(
        &self,
        signal: &CandidateSignal,
        project_ids: &[i64],
    ) -> EngineResult<Decision> {
        let snapshot = self
            .reader
            .feature_snapshot(&self.token, signal.timestamp, self.config.snapshot_minutes)
            .await?;

        let repo = FilterRepository::new(&self.pool);
        let records = repo.active_for_projects(project_ids).await?;
        let filters: Vec<FilterDefinition> = records
            .iter()
            .filter_map(FilterDefinition::from_record)
            .collect();

        if filters.len() < records.len() {
            warn!(
                dropped = records.len() - filters.len(),
                "Ignoring stored filters with unknown feature fields"
            );
        }

        Ok(evaluate(&snapshot, &filters, &self.config))
    }
}

/// Final disposition of a handled signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Position opened, now owned by the exit manager
    Entered { position_id: i64 },
    /// Rejected by the gate or the filters, recorded for audit
    Rejected { position_id: i64 },
    /// Evaluation failed, recorded with status ERROR
    Errored { position_id: i64 },
    /// Entry suppressed before evaluation (stale feed)
    Suppressed,
}

/// Full entry pipeline: staleness guard, momentum gate, filter validation,
/// position creation. The position row and its validation log are written in
/// one insert so readers never see one without the other.
pub struct SignalPipeline {
    pool: SqlitePool,
    reader: Arc<dyn TimeSeriesReader>,
    tracker: Arc<CycleTracker>,
    config: EngineConfig,
}

impl SignalPipeline {
    pub fn new(
        pool: SqlitePool,
        reader: Arc<dyn TimeSeriesReader>,
        tracker: Arc<CycleTracker>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pool,
            reader,
            tracker,
            config,
        }
    }

    pub async fn handle_signal(
        &self,
        signal: &CandidateSignal,
        project_ids: &[i64],
    ) -> EngineResult<PipelineOutcome> {
        // Stale feed: suppress new entries, exits keep running elsewhere
        if self.tracker.is_stale(Utc::now()) {
            warn!(source = %signal.source_id, "Feed stale, suppressing entry decision");
            return Ok(PipelineOutcome::Suppressed);
        }

        let mut log = ValidationLog::new();

        // Momentum gate runs before any filter work. A gate failure still
        // leaves an audit trail: the candidate is recorded with status ERROR
        let gate = match momentum::check(
            self.reader.as_ref(),
            &self.config.token,
            &self.config.momentum,
            signal,
        )
        .await
        {
            Ok(gate) => gate,
            Err(e) => {
                log.push_stage("momentum_gate", false, format!("gate evaluation failed: {e}"));
                let id = self
                    .persist(signal, PositionStatus::Error, &log)
                    .await?;
                warn!(position_id = id, error = %e, "Momentum gate evaluation failed");
                return Ok(PipelineOutcome::Errored { position_id: id });
            }
        };
        self.log_gate(&mut log, &gate);

        if !gate.allowed {
            let id = self
                .persist(signal, PositionStatus::NoGo, &log)
                .await?;
            info!(position_id = id, reason = gate.reason.as_str(), "Entry rejected by momentum gate");
            return Ok(PipelineOutcome::Rejected { position_id: id });
        }

        let validator = FilterValidator::new(
            self.pool.clone(),
            self.reader.clone(),
            self.config.validator.clone(),
            self.config.token.clone(),
        );

        let decision = match validator.validate(signal, project_ids).await {
            Ok(decision) => decision,
            Err(e) => {
                // Fail closed: record the failure, outcome is ERROR not GO
                log.push_stage("filter_validation", false, format!("evaluation failed: {e}"));
                let id = self
                    .persist(signal, PositionStatus::Error, &log)
                    .await?;
                warn!(position_id = id, error = %e, "Entry evaluation failed");
                return Ok(PipelineOutcome::Errored { position_id: id });
            }
        };

        log.entries.extend(decision.log.entries);

        match decision.verdict {
            Verdict::Go => {
                let id = self
                    .persist(signal, PositionStatus::Pending, &log)
                    .await?;
                info!(position_id = id, source = %signal.source_id, price = %signal.price, "Position opened");
                Ok(PipelineOutcome::Entered { position_id: id })
            }
            Verdict::NoGo => {
                let id = self
                    .persist(signal, PositionStatus::NoGo, &log)
                    .await?;
                info!(position_id = id, source = %signal.source_id, "Entry rejected by filters");
                Ok(PipelineOutcome::Rejected { position_id: id })
            }
        }
    }

    fn log_gate(&self, log: &mut ValidationLog, gate: &GateDecision) {
        log.push_stage(
            "momentum_gate",
            gate.allowed,
            format!(
                "{}: change {}% over {}m (min {}%)",
                gate.reason.as_str(),
                gate.change_pct,
                self.config.momentum.lookback_minutes,
                self.config.momentum.min_change_pct
            ),
        );
    }

    async fn persist(
        &self,
        signal: &CandidateSignal,
        status: PositionStatus,
        log: &ValidationLog,
    ) -> EngineResult<i64> {
        let cycle_id = self
            .tracker
            .open_cycle(signal.threshold_pct)
            .await?
            .map(|c| c.id);

        let repo = PositionRepository::new(&self.pool);
        let id = repo
            .create(&PositionRecord {
                id: None,
                source_id: signal.source_id.clone(),
                entry_time: signal.timestamp.timestamp(),
                entry_price: signal.price.to_string(),
                cycle_id,
                status: status.as_str().to_string(),
                highest_price_since_entry: signal.price.to_string(),
                exit_time: None,
                exit_price: None,
                exit_reason: None,
                validation_log: log.to_json(),
            })
            .await?;

        Ok(id)
    }
}
