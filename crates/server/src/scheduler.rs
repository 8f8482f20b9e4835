//! Periodic task wiring
//!
//! Three loops, each on its own tokio task: the tick loop feeding the cycle
//! tracker (~1s), the exit sweep (~1s), and the optimizer (~10min) kept off
//! the latency-sensitive path. Every invocation is caught and logged on
//! failure and retried on the next interval; a failing task never takes the
//! process down.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use engine::{
    default_scenarios, CycleTracker, EngineConfig, ExitManager, OptimizeProgress, Optimizer,
    OutcomeCache, TimeSeriesReader,
};
use persistence::SqlitePool;

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);
pub const EXIT_INTERVAL: Duration = Duration::from_secs(1);
pub const OPTIMIZE_INTERVAL: Duration = Duration::from_secs(600);

/// Outcome rows older than this are evicted from the optimizer cache
const CACHE_RETENTION_HOURS: i64 = 24 * 14;

/// Spawn all periodic loops. Handles are returned so callers can abort on
/// shutdown; the loops themselves run until then.
pub fn spawn_all(
    pool: SqlitePool,
    reader: Arc<dyn TimeSeriesReader>,
    tracker: Arc<CycleTracker>,
    config: EngineConfig,
    optimize_progress: Arc<OptimizeProgress>,
) -> Vec<JoinHandle<()>> {
    let tick = tokio::spawn(run_tick_loop(
        reader.clone(),
        tracker,
        config.token.clone(),
    ));

    let exits = ExitManager::new(
        pool.clone(),
        reader.clone(),
        config.exit.clone(),
        config.token.clone(),
    );
    let exit = tokio::spawn(run_exit_loop(exits));

    let optimize = tokio::spawn(run_optimizer_loop(
        pool,
        reader,
        config,
        optimize_progress,
    ));

    vec![tick, exit, optimize]
}

/// Feed the latest price into the cycle tracker once per second
pub async fn run_tick_loop(
    reader: Arc<dyn TimeSeriesReader>,
    tracker: Arc<CycleTracker>,
    token: String,
) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    info!(token = %token, "Tick loop started");

    loop {
        interval.tick().await;
        match reader.latest_price(&token).await {
            Ok(Some(point)) => {
                if let Err(e) = tracker.on_tick(point.price, point.timestamp).await {
                    error!(error = %e, "Cycle tick failed, retrying next interval");
                }
            }
            Ok(None) => debug!("No price available yet"),
            Err(e) => error!(error = %e, "Price fetch failed, retrying next interval"),
        }
    }
}

/// Sweep all pending positions once per second
pub async fn run_exit_loop(manager: ExitManager) {
    let mut interval = tokio::time::interval(EXIT_INTERVAL);
    info!("Exit sweep loop started");

    loop {
        interval.tick().await;
        if let Err(e) = manager.run_sweep().await {
            error!(error = %e, "Exit sweep failed, retrying next interval");
        }
    }
}

/// Refresh the outcome cache and re-run the optimizer every ten minutes.
/// The cache lives across iterations so each run only syncs new outcomes.
pub async fn run_optimizer_loop(
    pool: SqlitePool,
    reader: Arc<dyn TimeSeriesReader>,
    config: EngineConfig,
    progress: Arc<OptimizeProgress>,
) {
    let mut interval = tokio::time::interval(OPTIMIZE_INTERVAL);
    let mut cache = OutcomeCache::new(config.validator.snapshot_minutes);
    let optimizer = Optimizer::new(
        pool.clone(),
        config.optimizer.clone(),
        config.validator.snapshot_minutes,
        progress,
    );
    let scenarios = default_scenarios();
    info!(scenarios = scenarios.len(), "Optimizer loop started");

    loop {
        interval.tick().await;
        let now = Utc::now();

        if let Err(e) = cache.refresh(&pool, reader.as_ref(), &config.token).await {
            error!(error = %e, "Outcome cache refresh failed, retrying next interval");
            continue;
        }
        cache.evict_before(now - ChronoDuration::hours(CACHE_RETENTION_HOURS));

        match optimizer.run(&cache, &scenarios, now).await {
            Ok(Some(selected)) => {
                info!(run_id = %selected.run_id, "Optimizer installed a new filter set")
            }
            Ok(None) => debug!("Optimizer run was infeasible, filter set unchanged"),
            Err(e) => error!(error = %e, "Optimizer run failed, retrying next interval"),
        }
    }
}
