use rust_decimal::Decimal;
use tracing::warn;

use crate::types::{PositionSide, SignalKind};

use super::{Strategy, StrategyContext};

/// The built-in `default` strategy: a signal class fires iff every one of
/// its configured named conditions holds. Evaluation is position-aware so
/// a single tick yields at most one actionable signal.
pub struct RuleStrategy;

impl RuleStrategy {
    pub fn new() -> Self {
        Self
    }

    fn all_conditions_met(conditions: &[String], ctx: &StrategyContext) -> bool {
        // An unconfigured class never fires.
        if conditions.is_empty() {
            return false;
        }
        conditions.iter().all(|name| evaluate_condition(name, ctx))
    }
}

impl Default for RuleStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for RuleStrategy {
    fn id(&self) -> &str {
        "default"
    }

    fn populate_signal(&self, ctx: &StrategyContext) -> SignalKind {
        match ctx.position_side {
            // Holding long: only a sell exit is actionable.
            Some(PositionSide::Long) => {
                if Self::all_conditions_met(&ctx.signals.sell, ctx) {
                    SignalKind::Sell
                } else {
                    SignalKind::None
                }
            }
            Some(PositionSide::Short) => {
                if Self::all_conditions_met(&ctx.signals.cover, ctx) {
                    SignalKind::Cover
                } else {
                    SignalKind::None
                }
            }
            // Flat: buy takes precedence over short.
            None => {
                if Self::all_conditions_met(&ctx.signals.buy, ctx) {
                    SignalKind::Buy
                } else if Self::all_conditions_met(&ctx.signals.short, ctx) {
                    SignalKind::Short
                } else {
                    SignalKind::None
                }
            }
        }
    }
}

/// Evaluate one named boolean condition against the indicator snapshot.
/// Unknown names log a warning and evaluate to false.
pub fn evaluate_condition(name: &str, ctx: &StrategyContext) -> bool {
    let ind = ctx.indicators;
    match name {
        "ma_bullish" => ind.ma_bullish(),
        "ma_bearish" => ind.ma_bearish(),
        "ma_golden_cross" => match (ind.prev_ma_short, ind.prev_ma_long) {
            (Some(prev_short), Some(prev_long)) => {
                prev_short <= prev_long && ind.ma_short > ind.ma_long
            }
            _ => false,
        },
        "ma_dead_cross" => match (ind.prev_ma_short, ind.prev_ma_long) {
            (Some(prev_short), Some(prev_long)) => {
                prev_short >= prev_long && ind.ma_short < ind.ma_long
            }
            _ => false,
        },
        "rsi_oversold" => ind.rsi < ctx.params.rsi.oversold,
        "rsi_overbought" => ind.rsi > ctx.params.rsi.overbought,
        "macd_golden_cross" => ind.macd.as_ref().is_some_and(|m| m.golden_cross()),
        "macd_dead_cross" => ind.macd.as_ref().is_some_and(|m| m.dead_cross()),
        "macd_bullish" => ind
            .macd
            .as_ref()
            .is_some_and(|m| m.histogram > Decimal::ZERO),
        "macd_bearish" => ind
            .macd
            .as_ref()
            .is_some_and(|m| m.histogram < Decimal::ZERO),
        "volume_surge" => ind.volume_ratio() >= ctx.params.volume.surge_ratio,
        "volume_low" => ind.volume_ratio() <= ctx.params.volume.low_ratio,
        "price_above_ma_long" => ind.price > ind.ma_long,
        "price_below_ma_long" => ind.price < ind.ma_long,
        "cvd_positive" => ind.cvd.is_some_and(|v| v > Decimal::ZERO),
        "cvd_negative" => ind.cvd.is_some_and(|v| v < Decimal::ZERO),
        "funding_positive" => ind.funding_rate.is_some_and(|v| v > Decimal::ZERO),
        "funding_negative" => ind.funding_rate.is_some_and(|v| v < Decimal::ZERO),
        other => {
            warn!(condition = other, "unknown signal condition");
            false
        }
    }
}
