//! Feature fields and per-minute snapshots
//!
//! External feed data is validated into a typed map at this boundary: a closed
//! enum of feature names keyed by minute offset. Missing minutes simply have
//! no entry — lookups return `None`, never panic.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Closed set of per-minute feature names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureField {
    PriceChangePct,
    PriceVolatility,
    ObImbalance,
    ObBidDepth,
    ObAskDepth,
    TxBuyCount,
    TxSellCount,
    TxPressure,
    WhaleInflow,
    WhaleOutflow,
    WhaleNetFlow,
    PatternScore,
    PatternBreakout,
}

impl FeatureField {
    /// Every field, in candidate-generation order
    pub fn all() -> &'static [FeatureField] {
        &[
            FeatureField::PriceChangePct,
            FeatureField::PriceVolatility,
            FeatureField::ObImbalance,
            FeatureField::ObBidDepth,
            FeatureField::ObAskDepth,
            FeatureField::TxBuyCount,
            FeatureField::TxSellCount,
            FeatureField::TxPressure,
            FeatureField::WhaleInflow,
            FeatureField::WhaleOutflow,
            FeatureField::WhaleNetFlow,
            FeatureField::PatternScore,
            FeatureField::PatternBreakout,
        ]
    }

    /// Ratio-type fields are scale-free; absolute fields carry token units
    pub fn is_ratio(&self) -> bool {
        matches!(
            self,
            FeatureField::PriceChangePct
                | FeatureField::ObImbalance
                | FeatureField::TxPressure
                | FeatureField::PatternScore
                | FeatureField::PatternBreakout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureField::PriceChangePct => "price_change_pct",
            FeatureField::PriceVolatility => "price_volatility",
            FeatureField::ObImbalance => "ob_imbalance",
            FeatureField::ObBidDepth => "ob_bid_depth",
            FeatureField::ObAskDepth => "ob_ask_depth",
            FeatureField::TxBuyCount => "tx_buy_count",
            FeatureField::TxSellCount => "tx_sell_count",
            FeatureField::TxPressure => "tx_pressure",
            FeatureField::WhaleInflow => "whale_inflow",
            FeatureField::WhaleOutflow => "whale_outflow",
            FeatureField::WhaleNetFlow => "whale_net_flow",
            FeatureField::PatternScore => "pattern_score",
            FeatureField::PatternBreakout => "pattern_breakout",
        }
    }

    pub fn parse(s: &str) -> Option<FeatureField> {
        FeatureField::all().iter().copied().find(|f| f.as_str() == s)
    }
}

impl std::fmt::Display for FeatureField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Feature values for one minute offset before the reference time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MinuteVector {
    pub minute_offset: u32,
    pub values: HashMap<FeatureField, Decimal>,
}

/// Ordered per-minute feature vectors (offset 0 = the reference minute)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub reference_time: DateTime<Utc>,
    pub minutes: Vec<MinuteVector>,
}

impl FeatureSnapshot {
    pub fn new(reference_time: DateTime<Utc>) -> Self {
        Self {
            reference_time,
            minutes: Vec::new(),
        }
    }

    /// Value of a field at a minute offset, if the feed supplied that minute
    pub fn value(&self, field: FeatureField, minute_offset: u32) -> Option<Decimal> {
        self.minutes
            .iter()
            .find(|m| m.minute_offset == minute_offset)
            .and_then(|m| m.values.get(&field).copied())
    }

    /// Insert a value, creating the minute vector on demand
    pub fn insert(&mut self, minute_offset: u32, field: FeatureField, value: Decimal) {
        match self
            .minutes
            .iter_mut()
            .find(|m| m.minute_offset == minute_offset)
        {
            Some(minute) => {
                minute.values.insert(field, value);
            }
            None => {
                let mut values = HashMap::new();
                values.insert(field, value);
                self.minutes.push(MinuteVector {
                    minute_offset,
                    values,
                });
                self.minutes.sort_by_key(|m| m.minute_offset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_field_round_trip() {
        for field in FeatureField::all() {
            assert_eq!(FeatureField::parse(field.as_str()), Some(*field));
        }
        assert_eq!(FeatureField::parse("nonsense"), None);
    }

    #[test]
    fn test_snapshot_lookup_and_gaps() {
        let mut snap = FeatureSnapshot::new(Utc::now());
        snap.insert(0, FeatureField::ObImbalance, dec!(0.6));
        snap.insert(2, FeatureField::ObImbalance, dec!(0.4));

        assert_eq!(snap.value(FeatureField::ObImbalance, 0), Some(dec!(0.6)));
        // Minute 1 was never supplied by the feed
        assert_eq!(snap.value(FeatureField::ObImbalance, 1), None);
        assert_eq!(snap.value(FeatureField::TxPressure, 0), None);
        // Minutes stay ordered by offset
        let offsets: Vec<u32> = snap.minutes.iter().map(|m| m.minute_offset).collect();
        assert_eq!(offsets, vec![0, 2]);
    }
}
