//! Macro-trend evaluator.
//!
//! Scores process-global macro/on-chain indicators into a single `-2..+2`
//! table, weights and normalizes them into a conviction, and optionally asks
//! the advisory client for a qualitative gloss on the result. The gloss is
//! cosmetic: it is appended to `reason` and never touches `action` or
//! `conviction`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::{
    EtfFlowSnapshot, FearGreedClass, MacroFredSnapshot, MinersSnapshot, OnchainBtcSnapshot,
    SourceKind, SourceValue,
};
use crate::llm;
use crate::types::{Action, Decision, Money, Strategy, TraceStepKind, Trace};

use super::{Context, Evaluator};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MacroParams {
    pub symbol: String,
    pub llm_enabled: bool,
    pub base_notional_pct: f64,
}

impl Default for MacroParams {
    fn default() -> Self {
        Self {
            symbol: "BTC".to_string(),
            llm_enabled: false,
            base_notional_pct: 0.20,
        }
    }
}

struct ScoredIndicator {
    name: &'static str,
    weight: i32,
    score: Option<i32>,
}

pub struct MacroTrendEvaluator;

#[async_trait]
impl Evaluator for MacroTrendEvaluator {
    async fn evaluate(&self, strategy: &Strategy, ctx: &Context) -> anyhow::Result<(Decision, Trace)> {
        let params: MacroParams = serde_json::from_value(strategy.parameters.clone()).unwrap_or_default();
        let mut trace = Trace::new();

        let macro_fred = fetch(ctx, &mut trace, SourceKind::MacroFred, "").await;
        let fear_greed = fetch(ctx, &mut trace, SourceKind::FearGreed, "").await;
        let stablecoin = fetch(ctx, &mut trace, SourceKind::StablecoinSupply, "").await;
        let etf_flows = fetch(ctx, &mut trace, SourceKind::EtfFlows, &params.symbol).await;
        let onchain = fetch(ctx, &mut trace, SourceKind::OnchainBtc, "").await;
        let miners = fetch(ctx, &mut trace, SourceKind::Miners, "").await;
        let mstr = fetch(ctx, &mut trace, SourceKind::MstrMnav, "").await;

        let mut indicators = Vec::new();

        if let Some(SourceValue::MacroFred(m)) = &macro_fred {
            indicators.push(score_fed_rate(m));
            indicators.push(score_treasury(m));
            indicators.push(score_dxy(m));
            indicators.push(score_m2(m));
        } else {
            indicators.extend(absent_group(&["fed_rate", "treasury_10y", "dxy", "m2_growth_yoy"]));
        }

        if let Some(SourceValue::FearGreed(fg)) = &fear_greed {
            indicators.push(score_fear_greed(fg.classification));
        } else {
            indicators.push(absent("fear_greed", 1));
        }

        if let Some(SourceValue::StablecoinSupply(_)) = &stablecoin {
            // Trend vs 90-day lag is not available from a single snapshot;
            // treat a present reading as flat until a historical baseline
            // exists. Noted as a scored-but-neutral indicator, not absent.
            indicators.push(ScoredIndicator { name: "stablecoin_supply_trend", weight: 1, score: Some(0) });
        } else {
            indicators.push(absent("stablecoin_supply_trend", 1));
        }

        if let Some(SourceValue::EtfFlows(flows)) = &etf_flows {
            indicators.push(score_etf_flow(&params.symbol, flows));
        } else {
            indicators.push(absent("etf_flow", 1));
        }

        if let Some(SourceValue::OnchainBtc(chain)) = &onchain {
            indicators.push(score_ahr999(chain.ahr999));
            indicators.push(score_mvrv(chain.mvrv_ratio));
        } else {
            indicators.extend(absent_group_weighted(&["ahr999", "mvrv_ratio"], 2));
        }

        if let Some(SourceValue::Miners(m)) = &miners {
            indicators.push(score_miners(m));
        } else {
            indicators.push(absent("miners_profitable_ratio", 1));
        }

        if let Some(SourceValue::MstrMnav(mnav)) = mstr {
            indicators.push(score_mstr_mnav(mnav));
        } else {
            indicators.push(absent("mstr_mnav", 1));
        }

        for indicator in &indicators {
            trace.push(
                TraceStepKind::Score,
                indicator.name,
                serde_json::json!({ "weight": indicator.weight, "score": indicator.score }),
                std::time::Duration::ZERO,
            );
        }

        let raw: i32 = indicators
            .iter()
            .map(|i| i.weight * i.score.unwrap_or(0))
            .sum();

        let conviction = (((raw as f64 + 16.0) / 31.0) * 100.0).clamp(0.0, 100.0);

        let action = if conviction >= 70.0 {
            Action::Buy
        } else if conviction <= 30.0 {
            Action::Sell
        } else {
            Action::Hold
        };

        let distance = (conviction - 50.0).abs() / 50.0;
        let notional_fraction = distance * params.base_notional_pct;
        let suggested_notional = ctx.account.cash * Money::from_f64(notional_fraction);

        let mut reason = format!("macro_raw={raw} conviction={conviction:.1}");

        if params.llm_enabled {
            let prompt = format!(
                "Macro indicator table for {}: {}",
                params.symbol,
                indicators
                    .iter()
                    .map(|i| format!("{}={:?}", i.name, i.score))
                    .collect::<Vec<_>>()
                    .join(", "),
            );
            let started = std::time::Instant::now();
            if let Some(summary) = llm::advise(ctx.llm.as_ref(), &prompt).await {
                reason.push_str(" | ");
                reason.push_str(&summary);
                trace.push(TraceStepKind::Llm, "advisory_summary", serde_json::json!({ "ok": true }), started.elapsed());
            } else {
                trace.push(TraceStepKind::Llm, "advisory_summary", serde_json::json!({ "ok": false }), started.elapsed());
            }
        }

        trace.push(
            TraceStepKind::Score,
            "aggregate",
            serde_json::json!({ "raw": raw, "conviction": conviction }),
            std::time::Duration::ZERO,
        );

        let decision = Decision {
            action,
            conviction,
            suggested_notional,
            stop_loss: None,
            take_profit: None,
            reason,
            raw_analysis: serde_json::json!({
                "indicators": indicators.iter().map(|i| serde_json::json!({
                    "name": i.name,
                    "weight": i.weight,
                    "score": i.score,
                })).collect::<Vec<_>>(),
            }),
            state_patch: None,
            requested_status: None,
        };

        Ok((decision, trace))
    }
}

async fn fetch(ctx: &Context, trace: &mut Trace, source: SourceKind, key: &str) -> Option<SourceValue> {
    let started = std::time::Instant::now();
    let lookup = ctx.source(source, key).await;
    let present = lookup.value().is_some();
    trace.push(
        TraceStepKind::Fetch,
        format!("{source:?}"),
        serde_json::json!({ "present": present, "fresh": lookup.is_fresh() }),
        started.elapsed(),
    );
    lookup.value().cloned()
}

fn absent(name: &'static str, weight: i32) -> ScoredIndicator {
    ScoredIndicator { name, weight, score: None }
}

fn absent_group(names: &[&'static str]) -> Vec<ScoredIndicator> {
    names.iter().map(|&n| absent(n, 1)).collect()
}

fn absent_group_weighted(names: &[&'static str], weight: i32) -> Vec<ScoredIndicator> {
    names.iter().map(|&n| absent(n, weight)).collect()
}

fn score_fed_rate(m: &MacroFredSnapshot) -> ScoredIndicator {
    let score = if m.fed_rate < 3.5 {
        1
    } else if m.fed_rate <= 5.0 {
        0
    } else {
        -1
    };
    ScoredIndicator { name: "fed_rate", weight: 1, score: Some(score) }
}

fn score_treasury(m: &MacroFredSnapshot) -> ScoredIndicator {
    let score = if m.treasury_10y < 3.5 {
        1
    } else if m.treasury_10y <= 4.5 {
        0
    } else {
        -1
    };
    ScoredIndicator { name: "treasury_10y", weight: 1, score: Some(score) }
}

fn score_dxy(m: &MacroFredSnapshot) -> ScoredIndicator {
    let score = if m.dxy < 100.0 {
        1
    } else if m.dxy <= 107.0 {
        0
    } else if m.dxy <= 110.0 {
        -1
    } else {
        -2
    };
    ScoredIndicator { name: "dxy", weight: 1, score: Some(score) }
}

fn score_m2(m: &MacroFredSnapshot) -> ScoredIndicator {
    let score = if m.m2_growth_yoy > 5.0 {
        1
    } else if m.m2_growth_yoy >= 0.0 {
        0
    } else {
        -1
    };
    ScoredIndicator { name: "m2_growth_yoy", weight: 1, score: Some(score) }
}

fn score_fear_greed(class: FearGreedClass) -> ScoredIndicator {
    let score = match class {
        FearGreedClass::ExtremeFear | FearGreedClass::Fear => 1,
        FearGreedClass::Neutral | FearGreedClass::Greed => 0,
        FearGreedClass::ExtremeGreed => -1,
    };
    ScoredIndicator { name: "fear_greed", weight: 1, score: Some(score) }
}

fn score_etf_flow(symbol: &str, flows: &EtfFlowSnapshot) -> ScoredIndicator {
    let (raw_flow, scale) = match symbol {
        "ETH" => (flows.eth_usd, 0.25),
        "SOL" => (flows.sol_usd, 0.10),
        _ => (flows.btc_usd, 1.0),
    };
    let scaled = raw_flow * scale;
    let score = if scaled > 200_000_000.0 {
        1
    } else if scaled >= -200_000_000.0 {
        0
    } else {
        -1
    };
    ScoredIndicator { name: "etf_flow", weight: 1, score: Some(score) }
}

fn score_ahr999(ahr999: f64) -> ScoredIndicator {
    let score = if ahr999 < 0.45 {
        1
    } else if ahr999 <= 1.2 {
        0
    } else {
        -1
    };
    ScoredIndicator { name: "ahr999", weight: 2, score: Some(score) }
}

fn score_mvrv(mvrv: f64) -> ScoredIndicator {
    let score = if mvrv < 1.0 {
        1
    } else if mvrv <= 3.7 {
        0
    } else {
        -1
    };
    ScoredIndicator { name: "mvrv_ratio", weight: 2, score: Some(score) }
}

fn score_miners(m: &MinersSnapshot) -> ScoredIndicator {
    let ratio = if m.total > 0 {
        m.profitable as f64 / m.total as f64
    } else {
        0.5
    };
    let score = if ratio > 0.70 {
        1
    } else if ratio >= 0.40 {
        0
    } else {
        -1
    };
    ScoredIndicator { name: "miners_profitable_ratio", weight: 1, score: Some(score) }
}

fn score_mstr_mnav(mnav: f64) -> ScoredIndicator {
    let score = if mnav < 1.5 {
        1
    } else if mnav <= 3.0 {
        0
    } else if mnav <= 4.0 {
        0
    } else {
        -1
    };
    ScoredIndicator { name: "mstr_mnav", weight: 1, score: Some(score) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dxy_extreme_scores_minus_two() {
        let snap = MacroFredSnapshot { fed_rate: 4.0, treasury_10y: 4.0, dxy: 112.0, m2_growth_yoy: 2.0 };
        assert_eq!(score_dxy(&snap).score, Some(-2));
    }

    #[test]
    fn etf_flow_scaled_for_eth() {
        let flows = EtfFlowSnapshot { btc_usd: 0.0, eth_usd: 900_000_000.0, sol_usd: 0.0 };
        // 900M * 0.25 = 225M > 200M threshold
        assert_eq!(score_etf_flow("ETH", &flows).score, Some(1));
    }

    #[test]
    fn conviction_normalization_midpoint_is_hold() {
        let conviction = ((0.0_f64 + 16.0) / 31.0) * 100.0;
        assert!(conviction > 30.0 && conviction < 70.0);
    }
}
