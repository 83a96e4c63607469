//! Single-writer SQLite store. Every table in the data model gets one CRUD
//! surface here; callers never see a raw `rusqlite::Connection`.
//!
//! Mirrors `state_manager.rs`'s `Arc<Mutex<Connection>>` + WAL discipline,
//! generalized from its three ad hoc tables to the full schema and from
//! loosely-typed f64/String columns to the domain's `Money`/enum newtypes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::debug;

use crate::cache::price_bars::PriceBarRepository;
use crate::error::PersistenceError;
use crate::types::{
    Account, Action, Candle, Money, Position, RunLog, RunOutcome, Signal, Strategy, StrategyKind,
    StrategyStatus, Symbol, Timeframe, TraceStep, TraceStepKind, Trade, WatchedInstrument,
};

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PersistenceError::NotFound(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        debug!(path = %path.display(), "store opened");
        Ok(store)
    }

    pub fn migrate(&self) -> Result<(), PersistenceError> {
        let conn = self.conn.lock().unwrap();
        for statement in super::schema::MIGRATIONS {
            conn.execute(statement, [])?;
        }
        Ok(())
    }

    // -- account ------------------------------------------------------

    pub fn init_account(&self, initial_cash: Money) -> Result<(), PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO account (id, cash, equity_high_water_mark, circuit_breaker_active, circuit_breaker_reason)
             VALUES (0, ?1, ?1, 0, NULL)",
            params![initial_cash.to_string()],
        )?;
        Ok(())
    }

    pub fn load_account(&self) -> Result<Account, PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT cash, equity_high_water_mark, circuit_breaker_active, circuit_breaker_reason FROM account WHERE id = 0",
            [],
            |row| {
                Ok(Account {
                    cash: parse_money(row.get::<_, String>(0)?),
                    equity_high_water_mark: parse_money(row.get::<_, String>(1)?),
                    circuit_breaker_active: row.get::<_, i64>(2)? != 0,
                    circuit_breaker_reason: row.get(3)?,
                })
            },
        )
        .map_err(PersistenceError::from)
    }

    pub fn save_account(&self, account: &Account) -> Result<(), PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE account SET cash = ?1, equity_high_water_mark = ?2, circuit_breaker_active = ?3, circuit_breaker_reason = ?4 WHERE id = 0",
            params![
                account.cash.to_string(),
                account.equity_high_water_mark.to_string(),
                account.circuit_breaker_active as i64,
                account.circuit_breaker_reason,
            ],
        )?;
        Ok(())
    }

    // -- positions ------------------------------------------------------

    pub fn load_position(&self, symbol: &Symbol) -> Result<Option<Position>, PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT symbol, amount, average_cost, opened_at, last_updated_at FROM positions WHERE symbol = ?1",
            params![symbol.as_str()],
            row_to_position,
        )
        .optional()
        .map_err(PersistenceError::from)
    }

    pub fn load_positions(&self) -> Result<HashMap<Symbol, Position>, PersistenceError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT symbol, amount, average_cost, opened_at, last_updated_at FROM positions",
        )?;
        let rows = stmt.query_map([], row_to_position)?;
        let mut out = HashMap::new();
        for row in rows {
            let position = row?;
            out.insert(position.symbol.clone(), position);
        }
        Ok(out)
    }

    pub fn upsert_position(&self, position: &Position) -> Result<(), PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO positions (symbol, amount, average_cost, opened_at, last_updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(symbol) DO UPDATE SET amount = excluded.amount, average_cost = excluded.average_cost, last_updated_at = excluded.last_updated_at",
            params![
                position.symbol.as_str(),
                position.amount.to_string(),
                position.average_cost.to_string(),
                position.opened_at.to_rfc3339(),
                position.last_updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_position(&self, symbol: &Symbol) -> Result<(), PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM positions WHERE symbol = ?1", params![symbol.as_str()])?;
        Ok(())
    }

    // -- trades -----------------------------------------------------------

    pub fn append_trade(&self, trade: &Trade) -> Result<Trade, PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trades (strategy_id, symbol, side, price, amount, value, fee, reason, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                trade.strategy_id,
                trade.symbol.as_str(),
                trade.side.to_string(),
                trade.price.to_string(),
                trade.amount.to_string(),
                trade.value.to_string(),
                trade.fee.to_string(),
                trade.reason,
                trade.executed_at.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Trade {
            id,
            ..trade.clone()
        })
    }

    pub fn load_trades(&self, strategy_id: Option<i64>) -> Result<Vec<Trade>, PersistenceError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, strategy_id, symbol, side, price, amount, value, fee, reason, executed_at
             FROM trades WHERE (?1 IS NULL OR strategy_id = ?1) ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![strategy_id], |row| {
            Ok(Trade {
                id: row.get(0)?,
                strategy_id: row.get(1)?,
                symbol: Symbol::new(row.get::<_, String>(2)?),
                side: parse_side(row.get::<_, String>(3)?),
                price: parse_money(row.get::<_, String>(4)?),
                amount: parse_money(row.get::<_, String>(5)?),
                value: parse_money(row.get::<_, String>(6)?),
                fee: parse_money(row.get::<_, String>(7)?),
                reason: row.get(8)?,
                executed_at: parse_dt(row.get::<_, String>(9)?),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(PersistenceError::from)
    }

    // -- signals ------------------------------------------------------------

    pub fn append_signal(&self, signal: &Signal) -> Result<Signal, PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO signals (strategy_id, symbol, action, conviction, price_at_signal, reason, raw_analysis, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                signal.strategy_id,
                signal.symbol.as_str(),
                action_str(signal.action),
                signal.conviction,
                signal.price_at_signal.to_string(),
                signal.reason,
                signal.raw_analysis.to_string(),
                signal.created_at.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Signal { id, ..signal.clone() })
    }

    // -- strategies --------------------------------------------------------

    pub fn insert_strategy(&self, strategy: &Strategy) -> Result<Strategy, PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO strategies (name, kind, symbol, status, schedule_interval_s, parameters, last_run_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                strategy.name,
                kind_str(strategy.kind),
                strategy.symbol.as_str(),
                status_str(strategy.status),
                strategy.schedule_interval_s as i64,
                strategy.parameters.to_string(),
                strategy.last_run_at.map(|t| t.to_rfc3339()),
                strategy.created_at.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Strategy { id, ..strategy.clone() })
    }

    pub fn load_strategy(&self, id: i64) -> Result<Option<Strategy>, PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, kind, symbol, status, schedule_interval_s, parameters, last_run_at, created_at
             FROM strategies WHERE id = ?1",
            params![id],
            row_to_strategy,
        )
        .optional()
        .map_err(PersistenceError::from)
    }

    pub fn load_strategies(&self) -> Result<Vec<Strategy>, PersistenceError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, symbol, status, schedule_interval_s, parameters, last_run_at, created_at
             FROM strategies ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_strategy)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(PersistenceError::from)
    }

    pub fn update_strategy_status(&self, id: i64, status: StrategyStatus) -> Result<(), PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE strategies SET status = ?1 WHERE id = ?2",
            params![status_str(status), id],
        )?;
        Ok(())
    }

    pub fn update_strategy_last_run(&self, id: i64, at: DateTime<Utc>) -> Result<(), PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE strategies SET last_run_at = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn update_strategy_parameters(&self, id: i64, parameters: &serde_json::Value) -> Result<(), PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE strategies SET parameters = ?1 WHERE id = ?2",
            params![parameters.to_string(), id],
        )?;
        Ok(())
    }

    pub fn delete_strategy(&self, id: i64) -> Result<(), PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM strategies WHERE id = ?1", params![id])?;
        Ok(())
    }

    // -- run logs / trace steps ---------------------------------------------

    pub fn insert_run_log(&self, run: &RunLog) -> Result<i64, PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO run_logs (strategy_id, started_at, finished_at, outcome) VALUES (?1, ?2, ?3, ?4)",
            params![
                run.strategy_id,
                run.started_at.to_rfc3339(),
                run.finished_at.map(|t| t.to_rfc3339()),
                outcome_str(run.outcome),
            ],
        )?;
        let run_log_id = conn.last_insert_rowid();
        for step in &run.steps {
            conn.execute(
                "INSERT INTO trace_steps (run_log_id, step_index, kind, label, input_digest, output_digest, details, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run_log_id,
                    step.step_index,
                    trace_kind_str(step.kind),
                    step.label,
                    step.input_digest,
                    step.output_digest,
                    step.details.to_string(),
                    step.duration.as_millis() as i64,
                ],
            )?;
        }
        Ok(run_log_id)
    }

    pub fn load_run_logs(&self, strategy_id: Option<i64>, limit: usize) -> Result<Vec<RunLog>, PersistenceError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, strategy_id, started_at, finished_at, outcome FROM run_logs
             WHERE (?1 IS NULL OR strategy_id = ?1) ORDER BY id DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![strategy_id, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    parse_dt(row.get::<_, String>(2)?),
                    row.get::<_, Option<String>>(3)?.map(parse_dt),
                    parse_outcome(row.get::<_, String>(4)?),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(runs.len());
        for (id, strategy_id, started_at, finished_at, outcome) in runs {
            let mut step_stmt = conn.prepare(
                "SELECT step_index, kind, label, input_digest, output_digest, details, duration_ms
                 FROM trace_steps WHERE run_log_id = ?1 ORDER BY step_index",
            )?;
            let steps = step_stmt
                .query_map(params![id], |row| {
                    Ok(TraceStep {
                        step_index: row.get::<_, i64>(0)? as u32,
                        kind: parse_trace_kind(row.get::<_, String>(1)?),
                        label: row.get(2)?,
                        input_digest: row.get(3)?,
                        output_digest: row.get(4)?,
                        details: serde_json::from_str(&row.get::<_, String>(5)?)
                            .unwrap_or(serde_json::Value::Null),
                        duration: std::time::Duration::from_millis(row.get::<_, i64>(6)? as u64),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            out.push(RunLog {
                id,
                strategy_id,
                started_at,
                finished_at,
                outcome,
                steps,
            });
        }
        Ok(out)
    }

    // -- watched instruments --------------------------------------------

    pub fn upsert_watched_instrument(&self, instrument: &WatchedInstrument) -> Result<(), PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO watched_instruments (symbol, display_name, added_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(symbol) DO UPDATE SET display_name = excluded.display_name",
            params![instrument.symbol.as_str(), instrument.display_name, instrument.added_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_watched_instruments(&self) -> Result<Vec<WatchedInstrument>, PersistenceError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT symbol, display_name, added_at FROM watched_instruments")?;
        let rows = stmt.query_map([], |row| {
            Ok(WatchedInstrument {
                symbol: Symbol::new(row.get::<_, String>(0)?),
                display_name: row.get(1)?,
                added_at: parse_dt(row.get::<_, String>(2)?),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(PersistenceError::from)
    }

    // -- export -------------------------------------------------------------

    /// Dumps the whole store as a JSON document, for the `export`/backup path.
    pub fn export_json(&self) -> Result<serde_json::Value, PersistenceError> {
        let account = self.load_account()?;
        let positions: Vec<Position> = self.load_positions()?.into_values().collect();
        let trades = self.load_trades(None)?;
        let strategies = self.load_strategies()?;
        let run_logs = self.load_run_logs(None, 200)?;

        Ok(serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "account": account,
            "positions": positions,
            "trades": trades,
            "strategies": strategies,
            "run_logs": run_logs,
        }))
    }
}

fn row_to_position(row: &rusqlite::Row) -> rusqlite::Result<Position> {
    Ok(Position {
        symbol: Symbol::new(row.get::<_, String>(0)?),
        amount: parse_money(row.get::<_, String>(1)?),
        average_cost: parse_money(row.get::<_, String>(2)?),
        opened_at: parse_dt(row.get::<_, String>(3)?),
        last_updated_at: parse_dt(row.get::<_, String>(4)?),
    })
}

fn row_to_strategy(row: &rusqlite::Row) -> rusqlite::Result<Strategy> {
    Ok(Strategy {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: parse_kind(row.get::<_, String>(2)?),
        symbol: Symbol::new(row.get::<_, String>(3)?),
        status: parse_status(row.get::<_, String>(4)?),
        schedule_interval_s: row.get::<_, i64>(5)? as u64,
        parameters: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or(serde_json::Value::Null),
        last_run_at: row.get::<_, Option<String>>(7)?.map(parse_dt),
        created_at: parse_dt(row.get::<_, String>(8)?),
    })
}

fn parse_money(s: String) -> Money {
    Money::from_str(&s).unwrap_or(Money::ZERO)
}

fn parse_dt(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_side(s: String) -> crate::types::Side {
    match s.as_str() {
        "SELL" => crate::types::Side::Sell,
        _ => crate::types::Side::Buy,
    }
}

fn action_str(action: Action) -> &'static str {
    match action {
        Action::Buy => "BUY",
        Action::Sell => "SELL",
        Action::Hold => "HOLD",
    }
}

fn kind_str(kind: StrategyKind) -> &'static str {
    match kind {
        StrategyKind::Ta => "TA",
        StrategyKind::Macro => "MACRO",
        StrategyKind::Grid => "GRID",
    }
}

fn parse_kind(s: String) -> StrategyKind {
    match s.as_str() {
        "MACRO" => StrategyKind::Macro,
        "GRID" => StrategyKind::Grid,
        _ => StrategyKind::Ta,
    }
}

fn status_str(status: StrategyStatus) -> &'static str {
    match status {
        StrategyStatus::Active => "ACTIVE",
        StrategyStatus::Paused => "PAUSED",
        StrategyStatus::Stopped => "STOPPED",
        StrategyStatus::Error => "ERROR",
    }
}

fn parse_status(s: String) -> StrategyStatus {
    match s.as_str() {
        "PAUSED" => StrategyStatus::Paused,
        "STOPPED" => StrategyStatus::Stopped,
        "ERROR" => StrategyStatus::Error,
        _ => StrategyStatus::Active,
    }
}

fn outcome_str(outcome: RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Ok => "OK",
        RunOutcome::Vetoed => "VETOED",
        RunOutcome::Failed => "FAILED",
    }
}

fn parse_outcome(s: String) -> RunOutcome {
    match s.as_str() {
        "VETOED" => RunOutcome::Vetoed,
        "FAILED" => RunOutcome::Failed,
        _ => RunOutcome::Ok,
    }
}

fn trace_kind_str(kind: TraceStepKind) -> &'static str {
    match kind {
        TraceStepKind::Fetch => "FETCH",
        TraceStepKind::Compute => "COMPUTE",
        TraceStepKind::Score => "SCORE",
        TraceStepKind::Llm => "LLM",
        TraceStepKind::Order => "ORDER",
    }
}

fn parse_trace_kind(s: String) -> TraceStepKind {
    match s.as_str() {
        "COMPUTE" => TraceStepKind::Compute,
        "SCORE" => TraceStepKind::Score,
        "LLM" => TraceStepKind::Llm,
        "ORDER" => TraceStepKind::Order,
        _ => TraceStepKind::Fetch,
    }
}

#[async_trait]
impl PriceBarRepository for Store {
    async fn highest_open_time(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
    ) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT MAX(open_time) FROM price_bars WHERE symbol = ?1 AND timeframe = ?2",
            params![symbol.as_str(), timeframe.as_str()],
            |row| row.get::<_, Option<String>>(0),
        )
        .map(|opt| opt.map(parse_dt))
        .map_err(PersistenceError::from)
    }

    async fn load_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, PersistenceError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT open_time, open, high, low, close, volume FROM price_bars
             WHERE symbol = ?1 AND timeframe = ?2 ORDER BY open_time DESC LIMIT ?3",
        )?;
        let mut rows = stmt
            .query_map(params![symbol.as_str(), timeframe.as_str(), limit as i64], |row| {
                Ok(Candle::new_unchecked(
                    parse_dt(row.get::<_, String>(0)?),
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    async fn insert_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        bars: &[Candle],
    ) -> Result<(), PersistenceError> {
        let conn = self.conn.lock().unwrap();
        for bar in bars {
            conn.execute(
                "INSERT OR IGNORE INTO price_bars (symbol, timeframe, open_time, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    symbol.as_str(),
                    timeframe.as_str(),
                    bar.open_time.to_rfc3339(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                ],
            )?;
        }
        Ok(())
    }
}

