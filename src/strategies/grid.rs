//! Grid evaluator.
//!
//! Precomputes `grid_count+1` log-spaced price levels on first evaluation and
//! tracks which level the price last crossed in `level_index`. Both are
//! persisted in the strategy's opaque `parameters` blob via
//! `Decision::state_patch` — the scheduler is responsible for writing the
//! patch back before the next tick.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Action, Decision, Money, Strategy, StrategyStatus, TraceStepKind, Trace};

use super::{Context, Evaluator};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridParams {
    pub symbol: String,
    pub lower_price: f64,
    pub upper_price: f64,
    pub grid_count: u32,
    pub capital_per_grid: f64,
    #[serde(default)]
    pub levels: Vec<f64>,
    #[serde(default)]
    pub level_index: Option<usize>,
}

pub struct GridEvaluator;

#[async_trait]
impl Evaluator for GridEvaluator {
    async fn evaluate(&self, strategy: &Strategy, ctx: &Context) -> anyhow::Result<(Decision, Trace)> {
        let mut params: GridParams = serde_json::from_value(strategy.parameters.clone())
            .map_err(|e| anyhow::anyhow!("invalid grid parameters: {e}"))?;
        let mut trace = Trace::new();

        let started = std::time::Instant::now();
        let lookup = ctx.ticker(&strategy.symbol).await;
        let Some(price) = lookup.value().map(price_of) else {
            trace.push(
                TraceStepKind::Fetch,
                "ticker",
                serde_json::json!({ "present": false }),
                started.elapsed(),
            );
            anyhow::bail!("no ticker available for {}", strategy.symbol);
        };
        trace.push(
            TraceStepKind::Fetch,
            "ticker",
            serde_json::json!({ "price": price }),
            started.elapsed(),
        );

        if params.levels.is_empty() || params.level_index.is_none() {
            let levels = build_levels(params.lower_price, params.upper_price, params.grid_count);
            let index = closest_level_index(&levels, price);
            trace.push(
                TraceStepKind::Compute,
                "levels_init",
                serde_json::json!({ "levels": levels, "level_index": index }),
                std::time::Duration::ZERO,
            );
            params.levels = levels;
            params.level_index = Some(index);
        }

        if price < params.lower_price || price > params.upper_price {
            trace.push(
                TraceStepKind::Score,
                "out_of_range",
                serde_json::json!({ "price": price, "lower": params.lower_price, "upper": params.upper_price }),
                std::time::Duration::ZERO,
            );
            let decision = hold_decision(
                "grid_out_of_range",
                Some(StrategyStatus::Paused),
                &params,
            );
            return Ok((decision, trace));
        }

        let current_index = params.level_index.unwrap_or(0);
        let new_index = step_index(&params.levels, current_index, price);

        let decision = if new_index < current_index {
            params.level_index = Some(new_index);
            Decision {
                action: Action::Buy,
                conviction: 80.0,
                suggested_notional: Money::from_f64(params.capital_per_grid),
                stop_loss: None,
                take_profit: None,
                reason: "grid_cross_down".to_string(),
                raw_analysis: serde_json::json!({ "level_index": new_index, "price": price }),
                state_patch: Some(serde_json::to_value(&params)?),
                requested_status: None,
            }
        } else if new_index > current_index {
            params.level_index = Some(new_index);
            Decision {
                action: Action::Sell,
                conviction: 80.0,
                suggested_notional: Money::from_f64(params.capital_per_grid),
                stop_loss: None,
                take_profit: None,
                reason: "grid_cross_up".to_string(),
                raw_analysis: serde_json::json!({ "level_index": new_index, "price": price }),
                state_patch: Some(serde_json::to_value(&params)?),
                requested_status: None,
            }
        } else {
            hold_decision("grid_hold", None, &params)
        };

        trace.push(
            TraceStepKind::Score,
            "grid_cross",
            serde_json::json!({ "action": format!("{:?}", decision.action), "level_index": params.level_index }),
            std::time::Duration::ZERO,
        );

        Ok((decision, trace))
    }
}

fn price_of(value: &crate::cache::SourceValue) -> f64 {
    match value {
        crate::cache::SourceValue::Ticker24h(t) => t.last_price,
        _ => 0.0,
    }
}

/// `count+1` levels equally spaced in log-space between `lower` and `upper`.
fn build_levels(lower: f64, upper: f64, count: u32) -> Vec<f64> {
    let steps = count.max(1);
    let log_lower = lower.ln();
    let log_upper = upper.ln();
    (0..=steps)
        .map(|i| {
            let t = i as f64 / steps as f64;
            (log_lower + (log_upper - log_lower) * t).exp()
        })
        .collect()
}

fn closest_level_index(levels: &[f64], price: f64) -> usize {
    levels
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (**a - price).abs().total_cmp(&(**b - price).abs()))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Moves `current_index` by at most one grid line toward `price`: down one
/// if price dropped below the current line, up one if it rose above the
/// next line, otherwise unchanged. A single tick only ever registers the
/// line just crossed, even if price has blown through several — further
/// crossings surface on the following ticks instead of compounding into one
/// oversized order.
fn step_index(levels: &[f64], current_index: usize, price: f64) -> usize {
    if current_index > 0 && price < levels[current_index] {
        current_index - 1
    } else if current_index + 1 < levels.len() && price > levels[current_index + 1] {
        current_index + 1
    } else {
        current_index
    }
}

fn hold_decision(reason: &str, paused: Option<StrategyStatus>, params: &GridParams) -> Decision {
    Decision {
        action: Action::Hold,
        conviction: 50.0,
        suggested_notional: Money::ZERO,
        stop_loss: None,
        take_profit: None,
        reason: reason.to_string(),
        raw_analysis: serde_json::json!({ "paused": paused.is_some() }),
        state_patch: serde_json::to_value(params).ok(),
        requested_status: paused,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_spaced_levels_are_monotonic() {
        let levels = build_levels(100.0, 200.0, 4);
        assert_eq!(levels.len(), 5);
        assert!(levels.windows(2).all(|w| w[1] > w[0]));
        assert!((levels[0] - 100.0).abs() < 1e-6);
        assert!((levels[4] - 200.0).abs() < 1e-6);
    }

    #[test]
    fn closest_level_picks_nearest() {
        let levels = vec![100.0, 120.0, 144.0, 173.0, 200.0];
        assert_eq!(closest_level_index(&levels, 121.0), 1);
    }

    #[test]
    fn step_index_drops_one_level_even_when_price_crosses_several() {
        let levels = vec![90_000.0, 94_574.0, 99_383.0, 104_446.0, 109_783.0];
        // price fell all the way past level 1, but only the line just below
        // the current index (2) is registered this tick.
        let new_index = step_index(&levels, 3, 98_000.0);
        assert_eq!(new_index, 2);
    }

    #[test]
    fn step_index_rises_one_level_on_crossing_up() {
        let levels = vec![100.0, 120.0, 144.0, 173.0, 200.0];
        let new_index = step_index(&levels, 1, 180.0);
        assert_eq!(new_index, 2);
    }

    #[test]
    fn step_index_holds_within_the_current_bracket() {
        let levels = vec![100.0, 120.0, 144.0, 173.0, 200.0];
        let new_index = step_index(&levels, 2, 150.0);
        assert_eq!(new_index, 2);
    }
}
