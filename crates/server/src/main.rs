//! Trade Engine — decision pipeline daemon for a single volatile token
//!
//! Usage:
//!   trade-engine serve --port 3001      — Run the pipeline with the dashboard API
//!   trade-engine optimize               — One-shot filter optimization from CLI

mod scheduler;

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use engine::{
    default_scenarios, CandidateSignal, CycleTracker, EngineConfig, FeedClient, OptimizeProgress,
    Optimizer, OutcomeCache, PipelineOutcome, SignalPipeline, TimeSeriesReader, ValidationLog,
};
use persistence::repository::{
    CycleRepository, FilterRepository, PositionRepository, ScenarioRepository,
};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "trade-engine")]
#[command(about = "Trade decision pipeline: cycles, entries, exits, filter mining", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the decision pipeline and dashboard API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Run one optimizer pass from the CLI (no web server)
    Optimize,
}

#[derive(Clone)]
struct AppState {
    db: Arc<persistence::Database>,
    reader: Arc<dyn TimeSeriesReader>,
    tracker: Arc<CycleTracker>,
    config: EngineConfig,
    optimize_progress: Arc<OptimizeProgress>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,trade_engine=debug")
    } else {
        EnvFilter::new("info,engine=info,trade_engine=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn db_path() -> String {
    std::env::var("TRADE_ENGINE_DB_PATH").unwrap_or_else(|_| "data/engine.db".to_string())
}

fn feed_url() -> String {
    std::env::var("TRADE_ENGINE_FEED_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Serve { host, port } => cmd_serve(&host, port).await?,
        Commands::Optimize => cmd_optimize().await?,
    }

    Ok(())
}

// ============================================================================
// Serve command — pipeline loops + Axum dashboard API
// ============================================================================

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Trade Engine v{} starting...", APP_VERSION);

    let db_path = db_path();
    let db = persistence::Database::new(&db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", db_path);

    let config = EngineConfig::default();

    // The default project receives optimizer-selected filter sets
    FilterRepository::new(db.pool())
        .ensure_project("auto", true)
        .await?;

    let reader: Arc<dyn TimeSeriesReader> = Arc::new(FeedClient::new(feed_url()));
    let tracker = Arc::new(CycleTracker::new(db.pool_clone(), config.cycle.clone()));
    let optimize_progress = Arc::new(OptimizeProgress::new());

    let handles = scheduler::spawn_all(
        db.pool_clone(),
        reader.clone(),
        tracker.clone(),
        config.clone(),
        optimize_progress.clone(),
    );

    let state = AppState {
        db: Arc::new(db),
        reader,
        tracker,
        config,
        optimize_progress,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/signal", post(api_signal))
        .route("/positions", get(api_positions))
        .route("/positions/:id", get(api_position_detail))
        .route("/cycles", get(api_cycles))
        .route("/scenarios", get(api_scenarios))
        .route("/filters/active", get(api_filters_active))
        .route("/optimize/status", get(api_optimize_status))
        .route("/optimize/cancel", post(api_optimize_cancel))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Trade Engine v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health           - Health check");
    println!("  POST /api/signal           - Submit a candidate entry signal");
    println!("  GET  /api/positions        - Recent positions (?limit=&status=)");
    println!("  GET  /api/positions/:id    - Position with validation log and checks");
    println!("  GET  /api/cycles           - Recent price cycles");
    println!("  GET  /api/scenarios        - Recent optimizer scenarios");
    println!("  GET  /api/filters/active   - Active filter set");
    println!("  GET  /api/optimize/status  - Poll optimizer progress");
    println!("  POST /api/optimize/cancel  - Cancel the running optimizer pass");
    println!("\n  Database: {}", db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

// ============================================================================
// Optimize command — one-shot CLI run
// ============================================================================

async fn cmd_optimize() -> anyhow::Result<()> {
    println!("\n=== Trade Engine v{} — optimizer ===", APP_VERSION);

    let db_path = db_path();
    let db = persistence::Database::new(&db_path)
        .await
        .map_err(|e| anyhow::anyhow!("Database initialization failed: {}", e))?;
    println!("Database: {}", db_path);

    let config = EngineConfig::default();
    let reader = FeedClient::new(feed_url());

    let mut cache = OutcomeCache::new(config.validator.snapshot_minutes);
    cache
        .refresh(db.pool(), &reader, &config.token)
        .await
        .map_err(|e| anyhow::anyhow!("Outcome cache refresh failed: {}", e))?;
    println!("Cached outcomes: {}", cache.len());

    let progress = Arc::new(OptimizeProgress::new());
    let optimizer = Optimizer::new(
        db.pool_clone(),
        config.optimizer.clone(),
        config.validator.snapshot_minutes,
        progress,
    );

    let scenarios = default_scenarios();
    println!("Scenarios: {}\n", scenarios.len());

    match optimizer
        .run(&cache, &scenarios, chrono::Utc::now())
        .await
        .map_err(|e| anyhow::anyhow!("Optimizer run failed: {}", e))?
    {
        Some(selected) => {
            let combo = &selected.combination;
            println!("Selected filter set ({}):", selected.run_id);
            println!(
                "  score {:.2} | good kept {:.1}% | bad removed {:.1}%",
                combo.score, combo.good_kept_pct, combo.bad_removed_pct
            );
            for filter in &combo.filters {
                println!(
                    "  {:<18} m-{} in [{:.4}, {:.4}]",
                    filter.field.as_str(),
                    filter.minute_offset,
                    filter.from,
                    filter.to
                );
            }
        }
        None => println!("No feasible scenario; previous filter set left unchanged."),
    }

    Ok(())
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health
async fn api_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "trade-engine",
        "version": APP_VERSION,
        "token": state.config.token,
        "feed_stale": state.tracker.is_stale(chrono::Utc::now()),
    }))
}

/// POST /api/signal — run a candidate entry through the decision pipeline
async fn api_signal(
    State(state): State<AppState>,
    Json(signal): Json<CandidateSignal>,
) -> Json<serde_json::Value> {
    let pipeline = SignalPipeline::new(
        state.db.pool_clone(),
        state.reader.clone(),
        state.tracker.clone(),
        state.config.clone(),
    );

    let projects = match FilterRepository::new(state.db.pool())
        .auto_managed_projects()
        .await
    {
        Ok(ids) => ids,
        Err(e) => {
            return Json(serde_json::json!({
                "success": false,
                "error": format!("Failed to load filter projects: {}", e),
            }))
        }
    };

    match pipeline.handle_signal(&signal, &projects).await {
        Ok(outcome) => {
            let (disposition, position_id) = match outcome {
                PipelineOutcome::Entered { position_id } => ("entered", Some(position_id)),
                PipelineOutcome::Rejected { position_id } => ("rejected", Some(position_id)),
                PipelineOutcome::Errored { position_id } => ("errored", Some(position_id)),
                PipelineOutcome::Suppressed => ("suppressed", None),
            };
            Json(serde_json::json!({
                "success": true,
                "disposition": disposition,
                "position_id": position_id,
            }))
        }
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Signal handling failed: {}", e),
        })),
    }
}

/// GET /api/positions — recent positions, optionally filtered by status
async fn api_positions(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let limit: i64 = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(50);
    let status = params.get("status").map(|s| s.as_str());

    let repo = PositionRepository::new(state.db.pool());
    match repo.list_recent(limit, status).await {
        Ok(records) => Json(serde_json::json!({
            "success": true,
            "data": records,
            "total": records.len(),
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to query positions: {}", e),
            "data": [],
        })),
    }
}

/// GET /api/positions/:id — one position with its decoded validation log and
/// price-check audit trail
async fn api_position_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Json<serde_json::Value> {
    let repo = PositionRepository::new(state.db.pool());

    let record = match repo.get(id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return Json(serde_json::json!({
                "success": false,
                "error": format!("Position {} not found", id),
            }))
        }
        Err(e) => {
            return Json(serde_json::json!({
                "success": false,
                "error": format!("Failed to query position: {}", e),
            }))
        }
    };

    let log: Option<ValidationLog> = serde_json::from_str(&record.validation_log).ok();
    let checks = repo.list_price_checks(id).await.unwrap_or_default();

    Json(serde_json::json!({
        "success": true,
        "position": record,
        "validation_log": log,
        "price_checks": checks,
    }))
}

/// GET /api/cycles — recent price cycles across thresholds
async fn api_cycles(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let limit: i64 = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);

    let repo = CycleRepository::new(state.db.pool());
    match repo.list_recent(limit).await {
        Ok(records) => Json(serde_json::json!({
            "success": true,
            "data": records,
            "total": records.len(),
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to query cycles: {}", e),
            "data": [],
        })),
    }
}

/// GET /api/scenarios — recent optimizer scenarios, newest first
async fn api_scenarios(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let limit: i64 = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(50);

    let repo = ScenarioRepository::new(state.db.pool());
    match repo.list_recent(limit).await {
        Ok(records) => Json(serde_json::json!({
            "success": true,
            "data": records,
            "total": records.len(),
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to query scenarios: {}", e),
            "data": [],
        })),
    }
}

/// GET /api/filters/active — the filter set the validator currently applies
async fn api_filters_active(State(state): State<AppState>) -> Json<serde_json::Value> {
    let repo = FilterRepository::new(state.db.pool());

    let projects = match repo.auto_managed_projects().await {
        Ok(ids) => ids,
        Err(e) => {
            return Json(serde_json::json!({
                "success": false,
                "error": format!("Failed to load filter projects: {}", e),
            }))
        }
    };

    match repo.active_for_projects(&projects).await {
        Ok(records) => Json(serde_json::json!({
            "success": true,
            "projects": projects,
            "data": records,
            "total": records.len(),
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to query filters: {}", e),
            "data": [],
        })),
    }
}

/// GET /api/optimize/status — poll optimizer progress
async fn api_optimize_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let progress = &state.optimize_progress;
    let status = progress.status.read().unwrap().clone();
    let run_id = progress.last_run_id.read().unwrap().clone();
    let error = progress.error_message.read().unwrap().clone();
    let total = progress.total_scenarios.load(Ordering::Relaxed);
    let completed = progress.completed.load(Ordering::Relaxed);

    Json(serde_json::json!({
        "status": status,
        "run_id": run_id,
        "progress_pct": progress.progress_pct(),
        "completed": completed,
        "total": total,
        "error": error,
    }))
}

/// POST /api/optimize/cancel — cancel between scenarios
async fn api_optimize_cancel(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.optimize_progress.cancel();
    info!("Optimizer cancel requested via API");
    Json(serde_json::json!({
        "success": true,
        "message": "Cancel requested"
    }))
}
