//! Pre-entry momentum gate
//!
//! Pure function of recent price history: percent change over a short lookback
//! ending at the signal timestamp. Candidates on a falling or flat tape are
//! rejected before any filter evaluation happens.

use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::config::MomentumConfig;
use crate::reader::TimeSeriesReader;
use crate::types::CandidateSignal;
use crate::EngineResult;

/// Why the gate rejected (or passed) a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    Passed,
    FallingOrFlat,
    InsufficientHistory,
}

impl GateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateReason::Passed => "PASSED",
            GateReason::FallingOrFlat => "FALLING_OR_FLAT",
            GateReason::InsufficientHistory => "INSUFFICIENT_HISTORY",
        }
    }
}

/// Gate outcome with the measured change for the audit log
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateDecision {
    pub allowed: bool,
    pub change_pct: Decimal,
    pub reason: GateReason,
}

/// Check recent momentum for a candidate entry.
///
/// Change is measured from the oldest to the newest price inside the lookback
/// window. Missing history fails closed.
pub async fn check(
    reader: &dyn TimeSeriesReader,
    token: &str,
    config: &MomentumConfig,
    signal: &CandidateSignal,
) -> EngineResult<GateDecision> {
    let from = signal.timestamp - Duration::minutes(config.lookback_minutes as i64);
    let history = reader.price_history(token, from, signal.timestamp).await?;

    let (Some(first), Some(last)) = (history.first(), history.last()) else {
        debug!(source = %signal.source_id, "Momentum gate: no history in lookback");
        return Ok(GateDecision {
            allowed: false,
            change_pct: Decimal::ZERO,
            reason: GateReason::InsufficientHistory,
        });
    };

    if history.len() < 2 || first.price.is_zero() {
        return Ok(GateDecision {
            allowed: false,
            change_pct: Decimal::ZERO,
            reason: GateReason::InsufficientHistory,
        });
    }

    let change_pct = (last.price - first.price) / first.price * dec!(100);
    let allowed = change_pct >= config.min_change_pct;

    debug!(
        source = %signal.source_id,
        change_pct = %change_pct,
        min = %config.min_change_pct,
        allowed,
        "Momentum gate evaluated"
    );

    Ok(GateDecision {
        allowed,
        change_pct,
        reason: if allowed {
            GateReason::Passed
        } else {
            GateReason::FallingOrFlat
        },
    })
}
