//! Technical-indicator evaluator.
//!
//! Scores each configured timeframe independently from a neutral baseline,
//! aggregates with timeframe weights, resolves the same-direction-conflict
//! clamp, and grades the resulting call. Grounded in the indicator
//! combinations the teacher's old `VolatilityRegimeStrategy` used (EMA
//! stack, RSI, ATR-based stops) generalized to the multi-timeframe,
//! multi-indicator scoring table this evaluator needs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::indicators::{self, CandlePattern, MacdCross, TrendStructure, VolumeClass};
use crate::types::{Action, Candle, Decision, Money, Strategy, TraceStepKind, Timeframe, Trace};

use super::{Context, Evaluator};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaParams {
    pub timeframes: Vec<Timeframe>,
    pub buy_threshold: f64,
    pub sell_threshold: f64,
    pub atr_stop_mult: f64,
    pub atr_target_mult: f64,
    pub klines_limit: usize,
    pub base_size_pct: f64,
}

impl Default for TaParams {
    fn default() -> Self {
        Self {
            timeframes: vec![Timeframe::M15, Timeframe::H1, Timeframe::H4],
            buy_threshold: 65.0,
            sell_threshold: 35.0,
            atr_stop_mult: 2.0,
            atr_target_mult: 3.0,
            klines_limit: 300,
            base_size_pct: 0.10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grade {
    A,
    B,
    C,
}

struct TimeframeScore {
    timeframe: Timeframe,
    score: f64,
    macd_cross: MacdCross,
}

pub struct TaEvaluator;

#[async_trait]
impl Evaluator for TaEvaluator {
    async fn evaluate(&self, strategy: &Strategy, ctx: &Context) -> anyhow::Result<(Decision, Trace)> {
        let params: TaParams = serde_json::from_value(strategy.parameters.clone()).unwrap_or_default();
        let mut trace = Trace::new();
        let mut scores = Vec::with_capacity(params.timeframes.len());

        let mut primary_series: Option<Vec<Candle>> = None;
        let mut primary_price = Money::ZERO;

        for &timeframe in &params.timeframes {
            let started = std::time::Instant::now();
            let series = ctx.klines(&strategy.symbol, timeframe, params.klines_limit).await?;
            trace.push(
                TraceStepKind::Fetch,
                format!("klines:{timeframe}"),
                serde_json::json!({ "bars": series.bars.len() }),
                started.elapsed(),
            );

            let score = score_timeframe(&series.bars, timeframe, &mut trace);
            if is_primary(timeframe, &params.timeframes) {
                primary_series = Some(series.bars.clone());
                if let Some(last) = series.bars.last() {
                    primary_price = Money::from_f64(last.close);
                }
            }
            scores.push(score);
        }

        let aggregate = aggregate_score(&scores);
        let aggregate = resolve_conflict(&scores, &params.timeframes, aggregate);
        let grade = grade_call(&scores, aggregate);

        trace.push(
            TraceStepKind::Score,
            "aggregate",
            serde_json::json!({ "score": aggregate, "grade": format!("{grade:?}") }),
            std::time::Duration::ZERO,
        );

        let action = if aggregate >= params.buy_threshold {
            Action::Buy
        } else if aggregate <= params.sell_threshold {
            Action::Sell
        } else {
            Action::Hold
        };

        let (stop_loss, take_profit) = primary_series
            .as_deref()
            .map(|candles| compute_stop_target(candles, primary_price, action, &params))
            .unwrap_or((None, None));

        let size_fraction = (((aggregate - 50.0).abs() - 15.0) / 35.0).clamp(0.0, 1.0) * params.base_size_pct;
        let suggested_notional = ctx.account.cash * Money::from_f64(size_fraction);

        let decision = Decision {
            action,
            conviction: aggregate,
            suggested_notional,
            stop_loss,
            take_profit,
            reason: format!("ta_score={aggregate:.1} grade={grade:?}"),
            raw_analysis: serde_json::json!({
                "timeframes": scores.iter().map(|s| serde_json::json!({
                    "timeframe": s.timeframe.as_str(),
                    "score": s.score,
                })).collect::<Vec<_>>(),
            }),
            state_patch: None,
            requested_status: None,
        };

        Ok((decision, trace))
    }
}

fn is_primary(timeframe: Timeframe, selected: &[Timeframe]) -> bool {
    if selected.contains(&Timeframe::H4) {
        timeframe == Timeframe::H4
    } else {
        timeframe == Timeframe::H1
    }
}

fn score_timeframe(candles: &[Candle], timeframe: Timeframe, trace: &mut Trace) -> TimeframeScore {
    let started = std::time::Instant::now();
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

    let mut score = 50.0;

    if closes.len() < 200 {
        trace.push(
            TraceStepKind::Compute,
            format!("indicators:{timeframe}"),
            serde_json::json!({ "insufficient_data": true }),
            started.elapsed(),
        );
        return TimeframeScore {
            timeframe,
            score,
            macd_cross: MacdCross::None,
        };
    }

    let ema9 = indicators::latest(&indicators::ema(&closes, 9)).ok();
    let ema21 = indicators::latest(&indicators::ema(&closes, 21)).ok();
    let ema50 = indicators::latest(&indicators::ema(&closes, 50)).ok();
    let ema200 = indicators::latest(&indicators::ema(&closes, 200)).ok();
    let price = closes.last().copied().unwrap_or(0.0);

    if let (Some(e9), Some(e21), Some(e50), Some(e200)) = (ema9, ema21, ema50, ema200) {
        let bullish_legs = [price > e9, e9 > e21, e21 > e50, e50 > e200];
        let bearish_legs = [price < e9, e9 < e21, e21 < e50, e50 < e200];
        let bullish_count = bullish_legs.iter().filter(|&&b| b).count();
        let bearish_count = bearish_legs.iter().filter(|&&b| b).count();
        if bullish_count == 4 {
            score += 15.0;
        } else if bearish_count == 4 {
            score -= 15.0;
        } else {
            score += 15.0 * (bullish_count as f64 - bearish_count as f64) / 4.0;
        }
    }

    let rsi_series = indicators::rsi(&closes, 14);
    if let Ok(rsi) = indicators::latest(&rsi_series) {
        if rsi < 30.0 {
            score += 10.0;
        } else if rsi > 70.0 {
            score -= 10.0;
        }
    }

    let (macd_line, signal_line, histogram) = indicators::macd(&closes, 12, 26, 9);
    let cross = indicators::macd_cross(&macd_line, &signal_line);
    match cross {
        MacdCross::Golden => score += 10.0,
        MacdCross::Death => score -= 10.0,
        MacdCross::None => {
            if let (Some(Some(hist_prev)), Some(Some(hist_last)), Some(Some(macd_last))) = (
                histogram.get(histogram.len().saturating_sub(2)),
                histogram.last(),
                macd_line.last(),
            ) {
                if hist_last > hist_prev && *macd_last > 0.0 {
                    score += 3.0;
                }
            }
        }
    }

    let bollinger = indicators::bollinger(&closes, 20, 2.0);
    if let Some(Some(percent_b)) = bollinger.percent_b.last() {
        if *percent_b < 0.0 {
            score += 6.0;
        } else if *percent_b > 1.0 {
            score -= 6.0;
        } else if bollinger.squeeze.last().copied().unwrap_or(false) {
            if let Some(Some(mid)) = bollinger.mid.last() {
                score += if price >= *mid { 3.0 } else { -3.0 };
            }
        }
    }

    let volume_ratios = indicators::volume_ratio(&volumes);
    if let Some(Some(ratio)) = volume_ratios.last() {
        let class = indicators::classify_volume_ratio(*ratio);
        let up_close = candles.last().map(|c| c.close > c.open).unwrap_or(false);
        match class {
            VolumeClass::Surge => score += if up_close { 5.0 } else { -5.0 },
            VolumeClass::Dry | VolumeClass::Normal => {}
        }
    }

    match indicators::trend_structure(candles) {
        TrendStructure::Uptrend => score += 5.0,
        TrendStructure::Downtrend => score -= 5.0,
        TrendStructure::Consolidation => {}
    }

    match indicators::detect_candle_pattern(candles) {
        CandlePattern::BullishEngulfing | CandlePattern::Hammer => score += 4.0,
        CandlePattern::BearishEngulfing | CandlePattern::ShootingStar => score -= 4.0,
        CandlePattern::Doji | CandlePattern::None => {}
    }

    score = score.clamp(0.0, 100.0);

    trace.push(
        TraceStepKind::Compute,
        format!("indicators:{timeframe}"),
        serde_json::json!({ "score": score }),
        started.elapsed(),
    );

    TimeframeScore {
        timeframe,
        score,
        macd_cross: cross,
    }
}

fn weights_for(timeframes: &[Timeframe]) -> Vec<f64> {
    match timeframes {
        [a, b, c] if *a == Timeframe::M15 && *b == Timeframe::H1 && *c == Timeframe::H4 => {
            vec![0.15, 0.35, 0.50]
        }
        [a, b, c, d]
            if *a == Timeframe::M15 && *b == Timeframe::H1 && *c == Timeframe::H4 && *d == Timeframe::D1 =>
        {
            vec![0.10, 0.20, 0.30, 0.40]
        }
        _ => {
            let n = timeframes.len().max(1);
            vec![1.0 / n as f64; n]
        }
    }
}

fn aggregate_score(scores: &[TimeframeScore]) -> f64 {
    let timeframes: Vec<Timeframe> = scores.iter().map(|s| s.timeframe).collect();
    let weights = weights_for(&timeframes);
    scores
        .iter()
        .zip(weights.iter())
        .map(|(s, w)| s.score * w)
        .sum()
}

/// Longest-timeframe-dominant conflict clamp: if the longest selected
/// timeframe is bearish-leaning (≤40) while any shorter one is bullish (≥60),
/// pull the aggregate back into the HOLD band.
fn resolve_conflict(scores: &[TimeframeScore], timeframes: &[Timeframe], aggregate: f64) -> f64 {
    let Some(longest) = timeframes.iter().copied().max_by_key(|t| timeframe_rank(*t)) else {
        return aggregate;
    };
    let longest_score = scores.iter().find(|s| s.timeframe == longest).map(|s| s.score);
    let Some(longest_score) = longest_score else {
        return aggregate;
    };
    let any_shorter_bullish = scores
        .iter()
        .any(|s| s.timeframe != longest && s.score >= 60.0);

    if longest_score <= 40.0 && any_shorter_bullish {
        aggregate.clamp(40.0, 60.0)
    } else {
        aggregate
    }
}

fn timeframe_rank(timeframe: Timeframe) -> u8 {
    match timeframe {
        Timeframe::M1 => 0,
        Timeframe::M5 => 1,
        Timeframe::M15 => 2,
        Timeframe::H1 => 3,
        Timeframe::H4 => 4,
        Timeframe::D1 => 5,
    }
}

fn grade_call(scores: &[TimeframeScore], aggregate: f64) -> Grade {
    let n = scores.len().max(1);
    let extreme_count = scores
        .iter()
        .filter(|s| s.score >= 70.0 || s.score <= 30.0)
        .count();
    let two_thirds = extreme_count as f64 >= (2.0 / 3.0) * n as f64;
    let aggregate_extreme = aggregate >= 78.0 || aggregate <= 22.0;

    if two_thirds && aggregate_extreme {
        return Grade::A;
    }

    let direction_aligned = if aggregate >= 50.0 {
        scores.iter().filter(|s| s.score >= 50.0).count()
    } else {
        scores.iter().filter(|s| s.score < 50.0).count()
    };
    let half_aligned = direction_aligned as f64 >= n as f64 / 2.0;
    let primary_cross = scores
        .first()
        .map(|s| s.macd_cross != MacdCross::None)
        .unwrap_or(false);

    if half_aligned || primary_cross {
        Grade::B
    } else {
        Grade::C
    }
}

fn compute_stop_target(
    candles: &[Candle],
    price: Money,
    action: Action,
    params: &TaParams,
) -> (Option<Money>, Option<Money>) {
    if action == Action::Hold || candles.len() < 15 {
        return (None, None);
    }
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let Ok(atr) = indicators::latest(&indicators::atr(&highs, &lows, &closes, 14)) else {
        return (None, None);
    };
    let atr = Money::from_f64(atr);
    match action {
        Action::Buy => (
            Some(price - atr * Money::from_f64(params.atr_stop_mult)),
            Some(price + atr * Money::from_f64(params.atr_target_mult)),
        ),
        Action::Sell => (
            Some(price + atr * Money::from_f64(params.atr_stop_mult)),
            Some(price - atr * Money::from_f64(params.atr_target_mult)),
        ),
        Action::Hold => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_match_three_timeframe_table() {
        let timeframes = vec![Timeframe::M15, Timeframe::H1, Timeframe::H4];
        assert_eq!(weights_for(&timeframes), vec![0.15, 0.35, 0.50]);
    }

    #[test]
    fn weights_match_four_timeframe_table() {
        let timeframes = vec![Timeframe::M15, Timeframe::H1, Timeframe::H4, Timeframe::D1];
        assert_eq!(weights_for(&timeframes), vec![0.10, 0.20, 0.30, 0.40]);
    }

    #[test]
    fn grade_a_requires_extreme_alignment() {
        let scores = vec![
            TimeframeScore { timeframe: Timeframe::M15, score: 80.0, macd_cross: MacdCross::None },
            TimeframeScore { timeframe: Timeframe::H1, score: 82.0, macd_cross: MacdCross::None },
            TimeframeScore { timeframe: Timeframe::H4, score: 79.0, macd_cross: MacdCross::Golden },
        ];
        assert_eq!(grade_call(&scores, 80.0), Grade::A);
    }
}
