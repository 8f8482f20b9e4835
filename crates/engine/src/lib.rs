//! Trade Decision Engine — cycles, entry validation, exits, and filter mining
//!
//! The decision pipeline for a single volatile token:
//! - Price-cycle state machine segmenting the tick stream per drawdown threshold
//! - Pre-entry momentum gate and filter-based entry validator
//! - Trailing-stop exit manager with a gain-bucketed tolerance ladder
//! - Periodic auto-filter optimizer mining closed-position outcomes

pub mod api;
pub mod cache;
pub mod config;
pub mod cycles;
pub mod exits;
pub mod features;
pub mod momentum;
pub mod optimizer;
pub mod reader;
pub mod types;
pub mod validator;

use thiserror::Error;

/// Engine-level error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("feed error: {0}")]
    Feed(String),

    #[error("database error: {0}")]
    Db(#[from] persistence::DbError),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

// Re-exports for convenience
pub use api::FeedClient;
pub use cache::{OutcomeCache, OutcomeRow};
pub use config::{
    CycleConfig, EngineConfig, ExitConfig, MomentumConfig, OptimizerConfig, ValidatorConfig,
};
pub use cycles::{CycleTracker, TickOutcome};
pub use exits::{check_position, ExitDecision, ExitManager, SweepStats};
pub use features::{FeatureField, FeatureSnapshot, MinuteVector};
pub use momentum::{GateDecision, GateReason};
pub use optimizer::{
    default_scenarios, FilterCombination, OptimizeProgress, OptimizeStatus, Optimizer,
    ScenarioParams, SelectedFilterSet,
};
pub use reader::{MemoryReader, TimeSeriesReader};
pub use types::{
    CandidateSignal, Decision, FilterDefinition, LogEntry, Position, PositionStatus, PriceCycle,
    ToleranceBasis, ToleranceRule, ValidationLog, Verdict,
};
pub use validator::{evaluate, FilterValidator, PipelineOutcome, SignalPipeline};
