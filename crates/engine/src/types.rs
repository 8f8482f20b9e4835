//! Core domain types for the trading decision pipeline

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::features::FeatureField;
use persistence::repository::cycles::PriceCycleRecord;
use persistence::repository::filters::FilterDefinitionRecord;
use persistence::repository::positions::PositionRecord;

/// Bumped whenever the validation-log layout changes, so replay tooling can
/// dispatch on it
pub const VALIDATION_LOG_SCHEMA_VERSION: u32 = 1;

/// Parse a TEXT-encoded Decimal column, zero on malformed input
pub fn parse_dec(s: &str) -> Decimal {
    Decimal::from_str_exact(s).unwrap_or(Decimal::ZERO)
}

/// Epoch seconds -> DateTime<Utc>, epoch on out-of-range input
pub fn ts_from_secs(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// A single observed price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
}

/// Cycle lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Open,
    Closed,
}

/// A directional price excursion bounded by a drawdown threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceCycle {
    pub id: i64,
    pub threshold_pct: Decimal,
    pub start_time: DateTime<Utc>,
    pub start_price: Decimal,
    pub highest_price: Decimal,
    pub lowest_price: Decimal,
    pub end_time: Option<DateTime<Utc>>,
    pub status: CycleStatus,
}

impl PriceCycle {
    pub fn from_record(record: &PriceCycleRecord) -> Self {
        Self {
            id: record.id.unwrap_or(0),
            threshold_pct: parse_dec(&record.threshold_pct),
            start_time: ts_from_secs(record.start_time),
            start_price: parse_dec(&record.start_price),
            highest_price: parse_dec(&record.highest_price),
            lowest_price: parse_dec(&record.lowest_price),
            end_time: record.end_time.map(ts_from_secs),
            status: if record.status == "open" {
                CycleStatus::Open
            } else {
                CycleStatus::Closed
            },
        }
    }
}

/// A candidate entry produced by an external signal source, consumed once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSignal {
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    pub threshold_pct: Decimal,
}

/// Position lifecycle state. NoGo/Sold/Error are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Pending,
    NoGo,
    Sold,
    Error,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "pending",
            PositionStatus::NoGo => "no_go",
            PositionStatus::Sold => "sold",
            PositionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<PositionStatus> {
        match s {
            "pending" => Some(PositionStatus::Pending),
            "no_go" => Some(PositionStatus::NoGo),
            "sold" => Some(PositionStatus::Sold),
            "error" => Some(PositionStatus::Error),
            _ => None,
        }
    }
}

/// An entered (or rejected) trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub source_id: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub cycle_id: Option<i64>,
    pub status: PositionStatus,
    pub highest_price_since_entry: Decimal,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub exit_reason: Option<String>,
}

impl Position {
    pub fn from_record(record: &PositionRecord) -> Self {
        Self {
            id: record.id.unwrap_or(0),
            source_id: record.source_id.clone(),
            entry_time: ts_from_secs(record.entry_time),
            entry_price: parse_dec(&record.entry_price),
            cycle_id: record.cycle_id,
            status: PositionStatus::parse(&record.status).unwrap_or(PositionStatus::Error),
            highest_price_since_entry: parse_dec(&record.highest_price_since_entry),
            exit_time: record.exit_time.map(ts_from_secs),
            exit_price: record.exit_price.as_deref().map(parse_dec),
            exit_reason: record.exit_reason.clone(),
        }
    }

    /// Realized gain fraction for a sold position (e.g. 0.05 = +5%)
    pub fn realized_gain(&self) -> Option<Decimal> {
        let exit = self.exit_price?;
        if self.entry_price.is_zero() {
            return None;
        }
        Some((exit - self.entry_price) / self.entry_price)
    }
}

/// Which reference price a tolerance rule measures drawdown against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceBasis {
    FromHigh,
    FromEntry,
}

impl ToleranceBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToleranceBasis::FromHigh => "from_high",
            ToleranceBasis::FromEntry => "from_entry",
        }
    }
}

/// Exit tolerance for one unrealized-gain bucket. Bounds and drawdown are
/// fractions (0.03 = 3%); a bucket contains `lower <= gain < upper`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToleranceRule {
    pub bucket_lower: Decimal,
    pub bucket_upper: Decimal,
    pub basis: ToleranceBasis,
    pub allowed_drawdown_pct: Decimal,
}

/// An acceptable closed interval for one feature at one minute offset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDefinition {
    pub id: Option<i64>,
    pub project_id: i64,
    pub field: FeatureField,
    pub minute_offset: u32,
    pub from_value: Decimal,
    pub to_value: Decimal,
    pub is_ratio: bool,
}

impl FilterDefinition {
    /// None when the stored field name is outside the closed enum
    pub fn from_record(record: &FilterDefinitionRecord) -> Option<Self> {
        Some(Self {
            id: record.id,
            project_id: record.project_id,
            field: FeatureField::parse(&record.field)?,
            minute_offset: record.minute_offset.max(0) as u32,
            from_value: parse_dec(&record.from_value),
            to_value: parse_dec(&record.to_value),
            is_ratio: record.is_ratio != 0,
        })
    }

    pub fn to_record(&self) -> FilterDefinitionRecord {
        FilterDefinitionRecord {
            id: self.id,
            project_id: self.project_id,
            field: self.field.as_str().to_string(),
            minute_offset: self.minute_offset as i64,
            from_value: self.from_value.to_string(),
            to_value: self.to_value.to_string(),
            is_ratio: self.is_ratio as i64,
            active: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation log — the replayable audit trail of every entry decision
// ---------------------------------------------------------------------------

/// One filter evaluation: expected range vs. actual value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerFilterResult {
    pub filter_id: Option<i64>,
    pub field: FeatureField,
    pub minute_offset: u32,
    pub from_value: Decimal,
    pub to_value: Decimal,
    pub actual: Option<Decimal>,
    pub passed: bool,
}

/// One pipeline-stage outcome (momentum gate, staleness, errors)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub passed: bool,
    pub detail: String,
}

/// Tagged log entry with a stable wire shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    Filter(PerFilterResult),
    Stage(StageResult),
}

/// Structured, replayable decision log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationLog {
    pub schema_version: u32,
    pub entries: Vec<LogEntry>,
}

impl ValidationLog {
    pub fn new() -> Self {
        Self {
            schema_version: VALIDATION_LOG_SCHEMA_VERSION,
            entries: Vec::new(),
        }
    }

    pub fn push_stage(&mut self, stage: &str, passed: bool, detail: impl Into<String>) {
        self.entries.push(LogEntry::Stage(StageResult {
            stage: stage.to_string(),
            passed,
            detail: detail.into(),
        }));
    }

    pub fn push_filter(&mut self, result: PerFilterResult) {
        self.entries.push(LogEntry::Filter(result));
    }

    /// True iff every recorded filter entry passed
    pub fn all_filters_passed(&self) -> bool {
        self.entries.iter().all(|e| match e {
            LogEntry::Filter(f) => f.passed,
            LogEntry::Stage(_) => true,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for ValidationLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Final entry verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Go,
    NoGo,
}

/// Entry decision plus the log that explains it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub log: ValidationLog,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_validation_log_json_round_trip() {
        let mut log = ValidationLog::new();
        log.push_stage("momentum_gate", true, "change 0.09% >= 0.08%");
        log.push_filter(PerFilterResult {
            filter_id: Some(3),
            field: FeatureField::ObImbalance,
            minute_offset: 1,
            from_value: dec!(0.2),
            to_value: dec!(0.8),
            actual: Some(dec!(0.5)),
            passed: true,
        });

        let json = log.to_json();
        let parsed: ValidationLog = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, log);
        assert_eq!(parsed.schema_version, VALIDATION_LOG_SCHEMA_VERSION);
        assert!(parsed.all_filters_passed());
    }

    #[test]
    fn test_all_filters_passed_ignores_stage_failures() {
        let mut log = ValidationLog::new();
        log.push_stage("staleness", false, "feed stale");
        assert!(log.all_filters_passed());

        log.push_filter(PerFilterResult {
            filter_id: None,
            field: FeatureField::TxPressure,
            minute_offset: 0,
            from_value: dec!(1),
            to_value: dec!(2),
            actual: None,
            passed: false,
        });
        assert!(!log.all_filters_passed());
    }

    #[test]
    fn test_realized_gain() {
        let record = PositionRecord {
            id: Some(1),
            source_id: "w".into(),
            entry_time: 0,
            entry_price: "100".into(),
            cycle_id: None,
            status: "sold".into(),
            highest_price_since_entry: "110".into(),
            exit_time: Some(60),
            exit_price: Some("105".into()),
            exit_reason: None,
            validation_log: "{}".into(),
        };
        let position = Position::from_record(&record);
        assert_eq!(position.realized_gain(), Some(dec!(0.05)));
    }
}
