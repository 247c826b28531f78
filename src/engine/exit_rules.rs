use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::RiskConfig;
use crate::risk::roi_target;
use crate::types::{Candle, ExitReason, Position, PositionSide, TrailingStopState};

/// A matched price-based exit: the first rule in the intra-candle
/// priority that fired, and the price it executes at.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitTrigger {
    pub reason: ExitReason,
    pub price: Decimal,
}

/// Effective fill price after slippage and half the quoted spread, both
/// worsening the trader's side. Shared by the backtest and paper engines
/// so their position arithmetic matches exactly.
pub fn effective_fill_price(
    raw: Decimal,
    side: PositionSide,
    entry: bool,
    slippage_percent: Decimal,
    spread_bps: Decimal,
) -> Decimal {
    let adj = slippage_percent / Decimal::from(100) + spread_bps / Decimal::from(20000);
    let worse = match (side, entry) {
        (PositionSide::Long, true) | (PositionSide::Short, false) => Decimal::ONE + adj,
        (PositionSide::Long, false) | (PositionSide::Short, true) => Decimal::ONE - adj,
    };
    raw * worse
}

/// Advance the trailing stop for this candle using the high/low extremes.
/// Longs track the high-water mark and never lower the trail; shorts
/// mirror. Positive-offset trailing delays activation until the offset
/// profit is reached, then trails with the widened callback.
pub fn update_trailing_stop(pos: &mut Position, high: Decimal, low: Decimal, risk: &RiskConfig) {
    let positive = risk.trailing_stop_positive;
    if !risk.trailing_stop.enabled && positive.is_none() {
        return;
    }

    let best_price = match pos.side {
        PositionSide::Long => high,
        PositionSide::Short => low,
    };
    let best_profit = pos.profit_ratio(best_price);
    let offset = risk.trailing_stop_positive_offset;
    let offset_reached = positive.is_some() && best_profit >= offset;

    let already_active = pos.trailing_stop.as_ref().is_some_and(|s| s.active);
    if risk.trailing_only_offset_is_reached && !offset_reached && !already_active {
        return;
    }

    let base_armed = risk.trailing_stop.enabled
        && best_profit >= risk.trailing_stop.activation_percent / Decimal::from(100);
    if !already_active && !base_armed && !offset_reached {
        return;
    }

    let callback = if offset_reached {
        positive.expect("offset_reached implies a positive callback")
    } else {
        risk.trailing_stop.callback_percent / Decimal::from(100)
    };

    match pos.side {
        PositionSide::Long => {
            let prev = pos.trailing_stop.take();
            let highest = prev
                .as_ref()
                .map(|s| s.highest_price.max(high))
                .unwrap_or(high);
            let candidate = highest * (Decimal::ONE - callback);
            let stop_price = prev
                .as_ref()
                .map(|s| s.stop_price.max(candidate))
                .unwrap_or(candidate);
            pos.trailing_stop = Some(TrailingStopState {
                active: true,
                highest_price: highest,
                lowest_price: None,
                stop_price,
            });
        }
        PositionSide::Short => {
            let prev = pos.trailing_stop.take();
            let lowest = prev
                .as_ref()
                .and_then(|s| s.lowest_price)
                .map(|l| l.min(low))
                .unwrap_or(low);
            let candidate = lowest * (Decimal::ONE + callback);
            let stop_price = prev
                .as_ref()
                .map(|s| s.stop_price.min(candidate))
                .unwrap_or(candidate);
            pos.trailing_stop = Some(TrailingStopState {
                active: true,
                highest_price: lowest,
                lowest_price: Some(lowest),
                stop_price,
            });
        }
    }
    pos.trailing_stop_activated = true;
}

/// Evaluate the intra-candle exit priority for one position. The ordering
/// is pessimistic: the stop loss is checked before any profit-taking rule
/// that the same candle may also have reached. With `intracandle` off,
/// every comparison collapses to the close.
pub fn price_exit_trigger(
    pos: &Position,
    candle: &Candle,
    now: DateTime<Utc>,
    risk: &RiskConfig,
    intracandle: bool,
) -> Option<ExitTrigger> {
    let (high, low) = if intracandle {
        (candle.high, candle.low)
    } else {
        (candle.close, candle.close)
    };
    let close = candle.close;
    let hold_ms = pos.hold_duration_ms(now);
    let hundred = Decimal::from(100);

    match pos.side {
        PositionSide::Long => {
            if low <= pos.stop_loss {
                return Some(ExitTrigger {
                    reason: ExitReason::StopLoss,
                    price: pos.stop_loss,
                });
            }
            if let Some(threshold) = roi_target(&risk.minimal_roi, hold_ms) {
                let trigger = pos.entry_price * (Decimal::ONE + threshold);
                if high >= trigger {
                    // A trigger the candle never traded through fills at
                    // the close instead.
                    let price = if trigger < low { close } else { trigger };
                    return Some(ExitTrigger {
                        reason: ExitReason::RoiTable,
                        price,
                    });
                }
            }
            if high >= pos.take_profit {
                return Some(ExitTrigger {
                    reason: ExitReason::TakeProfit,
                    price: pos.take_profit,
                });
            }
            for stage in &risk.take_profit_stages {
                let trigger = pos.entry_price * (Decimal::ONE + stage.at_percent / hundred);
                if high >= trigger {
                    return Some(ExitTrigger {
                        reason: ExitReason::StagedTp,
                        price: trigger,
                    });
                }
            }
            if let Some(state) = pos.trailing_stop.as_ref().filter(|s| s.active) {
                if low <= state.stop_price {
                    return Some(ExitTrigger {
                        reason: ExitReason::TrailingStop,
                        price: state.stop_price,
                    });
                }
            }
        }
        PositionSide::Short => {
            if high >= pos.stop_loss {
                return Some(ExitTrigger {
                    reason: ExitReason::StopLoss,
                    price: pos.stop_loss,
                });
            }
            if let Some(threshold) = roi_target(&risk.minimal_roi, hold_ms) {
                let trigger = pos.entry_price * (Decimal::ONE - threshold);
                if low <= trigger {
                    let price = if trigger > high { close } else { trigger };
                    return Some(ExitTrigger {
                        reason: ExitReason::RoiTable,
                        price,
                    });
                }
            }
            if low <= pos.take_profit {
                return Some(ExitTrigger {
                    reason: ExitReason::TakeProfit,
                    price: pos.take_profit,
                });
            }
            for stage in &risk.take_profit_stages {
                let trigger = pos.entry_price * (Decimal::ONE - stage.at_percent / hundred);
                if low <= trigger {
                    return Some(ExitTrigger {
                        reason: ExitReason::StagedTp,
                        price: trigger,
                    });
                }
            }
            if let Some(state) = pos.trailing_stop.as_ref().filter(|s| s.active) {
                if high >= state.stop_price {
                    return Some(ExitTrigger {
                        reason: ExitReason::TrailingStop,
                        price: state.stop_price,
                    });
                }
            }
        }
    }

    if risk.time_stop_hours > 0 {
        let limit_ms = risk.time_stop_hours as i64 * 3_600_000;
        if hold_ms >= limit_ms && pos.profit_ratio(close) <= Decimal::ZERO {
            return Some(ExitTrigger {
                reason: ExitReason::TimeStop,
                price: close,
            });
        }
    }

    None
}
