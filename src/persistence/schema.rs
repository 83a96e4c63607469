//! SQLite schema for the embedded store. One `CREATE TABLE IF NOT EXISTS`
//! per entity in the data model; run once at `Store::open` time.

pub const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS account (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        cash TEXT NOT NULL,
        equity_high_water_mark TEXT NOT NULL,
        circuit_breaker_active INTEGER NOT NULL DEFAULT 0,
        circuit_breaker_reason TEXT
    )",
    "CREATE TABLE IF NOT EXISTS strategies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        symbol TEXT NOT NULL,
        status TEXT NOT NULL,
        schedule_interval_s INTEGER NOT NULL,
        parameters TEXT NOT NULL,
        last_run_at TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS positions (
        symbol TEXT PRIMARY KEY,
        amount TEXT NOT NULL,
        average_cost TEXT NOT NULL,
        opened_at TEXT NOT NULL,
        last_updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS trades (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        strategy_id INTEGER NOT NULL,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        price TEXT NOT NULL,
        amount TEXT NOT NULL,
        value TEXT NOT NULL,
        fee TEXT NOT NULL,
        reason TEXT NOT NULL,
        executed_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS signals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        strategy_id INTEGER NOT NULL,
        symbol TEXT NOT NULL,
        action TEXT NOT NULL,
        conviction REAL NOT NULL,
        price_at_signal TEXT NOT NULL,
        reason TEXT NOT NULL,
        raw_analysis TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS run_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        strategy_id INTEGER NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        outcome TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS trace_steps (
        run_log_id INTEGER NOT NULL,
        step_index INTEGER NOT NULL,
        kind TEXT NOT NULL,
        label TEXT NOT NULL,
        input_digest TEXT,
        output_digest TEXT,
        details TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        PRIMARY KEY (run_log_id, step_index)
    )",
    "CREATE TABLE IF NOT EXISTS watched_instruments (
        symbol TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        added_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS price_bars (
        symbol TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        open_time TEXT NOT NULL,
        open REAL NOT NULL,
        high REAL NOT NULL,
        low REAL NOT NULL,
        close REAL NOT NULL,
        volume REAL NOT NULL,
        PRIMARY KEY (symbol, timeframe, open_time)
    )",
    "CREATE INDEX IF NOT EXISTS idx_trades_strategy ON trades(strategy_id)",
    "CREATE INDEX IF NOT EXISTS idx_signals_strategy ON signals(strategy_id)",
    "CREATE INDEX IF NOT EXISTS idx_run_logs_strategy ON run_logs(strategy_id)",
    "CREATE INDEX IF NOT EXISTS idx_price_bars_lookup ON price_bars(symbol, timeframe, open_time)",
];
