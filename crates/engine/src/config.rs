//! Engine configuration
//!
//! Every empirically tuned knob (thresholds, lookbacks, scoring weights,
//! percentile bounds) lives here with a default, injected at construction —
//! no ambient globals.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::{ToleranceBasis, ToleranceRule};

/// Price-cycle tracker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Drawdown thresholds as fractions; each runs its own cycle
    pub thresholds: Vec<Decimal>,
    /// Feed silence beyond this marks the tracker stale
    pub staleness_window_secs: i64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            thresholds: vec![dec!(0.03), dec!(0.05), dec!(0.10)],
            staleness_window_secs: 120,
        }
    }
}

/// Pre-entry momentum gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumConfig {
    /// Short lookback ending at the signal timestamp. Long lookbacks are too
    /// slow to catch fast reversals and must not be used as the primary gate.
    pub lookback_minutes: u32,
    /// Minimum percent change over the lookback (percent points, e.g. 0.08)
    pub min_change_pct: Decimal,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            lookback_minutes: 3,
            min_change_pct: dec!(0.08),
        }
    }
}

/// Filter validator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Minutes of features fetched before the entry (offsets 0..K)
    pub snapshot_minutes: u32,
    /// Explicit fail-open override for absent feature values. Default is
    /// fail-closed; enabling this is recorded in every validation log.
    pub missing_value_passes: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            snapshot_minutes: 5,
            missing_value_passes: false,
        }
    }
}

/// Trailing-stop exit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    /// Gain-bucketed tolerance ladder, ordered by bucket_lower
    pub rules: Vec<ToleranceRule>,
    /// Write a price_checks audit row for every check, not only sells
    pub record_checks: bool,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                // Underwater: measure from entry, give the trade room
                ToleranceRule {
                    bucket_lower: dec!(-1),
                    bucket_upper: dec!(0),
                    basis: ToleranceBasis::FromEntry,
                    allowed_drawdown_pct: dec!(0.05),
                },
                // Small gain: tight trail from the running high
                ToleranceRule {
                    bucket_lower: dec!(0),
                    bucket_upper: dec!(0.05),
                    basis: ToleranceBasis::FromHigh,
                    allowed_drawdown_pct: dec!(0.03),
                },
                ToleranceRule {
                    bucket_lower: dec!(0.05),
                    bucket_upper: dec!(0.15),
                    basis: ToleranceBasis::FromHigh,
                    allowed_drawdown_pct: dec!(0.05),
                },
                // Large gain: let the winner breathe
                ToleranceRule {
                    bucket_lower: dec!(0.15),
                    bucket_upper: dec!(1000),
                    basis: ToleranceBasis::FromHigh,
                    allowed_drawdown_pct: dec!(0.08),
                },
            ],
            record_checks: true,
        }
    }
}

/// Filter optimizer scoring settings. Weights are configuration, not a
/// contract — they have been retuned repeatedly against live outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Weight of bad_removed_pct in the combination score
    pub w_bad: Decimal,
    /// Weight of good_kept_pct in the combination score
    pub w_good: Decimal,
    /// Below this bad_removed_pct (percent points) the score is penalized
    pub bad_removed_floor: Decimal,
    /// Multiplicative penalty applied under the floor
    pub floor_penalty: Decimal,
    /// Percentile-bound variants tested around each scenario's default
    /// (added to the lower bound, subtracted from the upper)
    pub percentile_deltas: Vec<f64>,
    /// Minimum labeled samples per class before a scenario is attempted
    pub min_good_samples: usize,
    pub min_bad_samples: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            w_bad: dec!(0.7),
            w_good: dec!(0.3),
            bad_removed_floor: dec!(50),
            floor_penalty: dec!(0.5),
            percentile_deltas: vec![-5.0, 0.0, 5.0],
            min_good_samples: 10,
            min_bad_samples: 10,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Token symbol this pipeline trades
    pub token: String,
    pub cycle: CycleConfig,
    pub momentum: MomentumConfig,
    pub validator: ValidatorConfig,
    pub exit: ExitConfig,
    pub optimizer: OptimizerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            token: "SOL".to_string(),
            cycle: CycleConfig::default(),
            momentum: MomentumConfig::default(),
            validator: ValidatorConfig::default(),
            exit: ExitConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tolerance_ladder_is_contiguous() {
        let config = ExitConfig::default();
        for pair in config.rules.windows(2) {
            assert_eq!(pair[0].bucket_upper, pair[1].bucket_lower);
        }
    }

    #[test]
    fn test_default_weights_favor_bad_removal() {
        let config = OptimizerConfig::default();
        assert!(config.w_bad > config.w_good);
    }
}
