//! Database schema definitions

/// SQL to create all tables
/// NOTE: All prices/percentages stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- Price cycles: one OPEN cycle per drawdown threshold at any time
CREATE TABLE IF NOT EXISTS price_cycles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    threshold_pct TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    start_price TEXT NOT NULL,
    highest_price TEXT NOT NULL,
    lowest_price TEXT NOT NULL,
    end_time INTEGER,
    status TEXT NOT NULL DEFAULT 'open',
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Positions (trades) with their validation audit log
CREATE TABLE IF NOT EXISTS positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id TEXT NOT NULL,
    entry_time INTEGER NOT NULL,
    entry_price TEXT NOT NULL,
    cycle_id INTEGER,
    status TEXT NOT NULL DEFAULT 'pending',
    highest_price_since_entry TEXT NOT NULL,
    exit_time INTEGER,
    exit_price TEXT,
    validation_log TEXT NOT NULL,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Per-check exit audit trail (why a position held or sold)
CREATE TABLE IF NOT EXISTS price_checks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    position_id INTEGER NOT NULL,
    checked_at INTEGER NOT NULL,
    price TEXT NOT NULL,
    gain_pct TEXT NOT NULL,
    drawdown_pct TEXT NOT NULL,
    rule_basis TEXT NOT NULL,
    allowed_drawdown_pct TEXT NOT NULL,
    decision TEXT NOT NULL,
    FOREIGN KEY (position_id) REFERENCES positions(id)
);

-- Filter projects group filter definitions; auto-managed projects are
-- rewritten by the optimizer
CREATE TABLE IF NOT EXISTS filter_projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    auto_managed INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Acceptable feature ranges, one row per (field, minute offset)
CREATE TABLE IF NOT EXISTS filter_definitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    field TEXT NOT NULL,
    minute_offset INTEGER NOT NULL,
    from_value TEXT NOT NULL,
    to_value TEXT NOT NULL,
    is_ratio INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    FOREIGN KEY (project_id) REFERENCES filter_projects(id)
);

-- Optimizer scenario results, one row per scenario per run, one marked selected
CREATE TABLE IF NOT EXISTS filter_scenarios (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    params_hash TEXT NOT NULL,
    params TEXT NOT NULL,
    score TEXT,
    good_kept_pct TEXT,
    bad_removed_pct TEXT,
    filters TEXT,
    feasible INTEGER NOT NULL DEFAULT 0,
    selected INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

-- At most one OPEN cycle per threshold (write-boundary invariant)
CREATE UNIQUE INDEX IF NOT EXISTS idx_cycles_one_open
    ON price_cycles(threshold_pct) WHERE status = 'open';
CREATE INDEX IF NOT EXISTS idx_cycles_status ON price_cycles(status, threshold_pct);
CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);
CREATE INDEX IF NOT EXISTS idx_positions_entry ON positions(entry_time);
CREATE INDEX IF NOT EXISTS idx_checks_position ON price_checks(position_id);
CREATE INDEX IF NOT EXISTS idx_filters_project ON filter_definitions(project_id, active);
CREATE INDEX IF NOT EXISTS idx_scenarios_run ON filter_scenarios(run_id);
-- Identical params may recur across runs; dedup is per run
CREATE UNIQUE INDEX IF NOT EXISTS idx_scenarios_dedup
    ON filter_scenarios(run_id, params_hash)
"#;

/// ALTER TABLE migrations, run after table creation (duplicate-column errors tolerated)
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE positions ADD COLUMN exit_reason TEXT",
];
