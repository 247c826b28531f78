use rust_decimal::Decimal;
use tracing::debug;

use crate::config::RiskConfig;
use crate::strategies::{Strategy, StrategyContext};
use crate::types::{Position, PositionSide};

/// The configured hard floor for a stop: the worst level the stop may
/// ever sit at, derived from `stop_loss_percent` off the entry.
pub fn hard_floor(entry_price: Decimal, side: PositionSide, stop_loss_percent: Decimal) -> Decimal {
    let fraction = stop_loss_percent / Decimal::from(100);
    match side {
        PositionSide::Long => entry_price * (Decimal::ONE - fraction),
        PositionSide::Short => entry_price * (Decimal::ONE + fraction),
    }
}

/// Resolve a candidate stop for the position: a strategy-supplied custom
/// stop wins; otherwise the break-even rule applies once its profit
/// threshold is met. The candidate is clamped to the hard floor and only
/// returned when strictly more favourable than the current stop, so stops
/// never walk backwards.
pub fn resolve_new_stop_loss(
    pos: &Position,
    current_price: Decimal,
    strategy: Option<&dyn Strategy>,
    ctx: Option<&StrategyContext>,
    risk: &RiskConfig,
) -> Option<Decimal> {
    let mut candidate = None;

    if let (Some(strategy), Some(ctx)) = (strategy, ctx) {
        candidate = strategy.custom_stoploss(pos, ctx);
    }

    if candidate.is_none() {
        if let Some(break_even_profit) = risk.break_even_profit {
            if pos.profit_ratio(current_price) >= break_even_profit {
                let offset = risk.break_even_stop;
                candidate = Some(match pos.side {
                    PositionSide::Long => pos.entry_price * (Decimal::ONE + offset),
                    PositionSide::Short => pos.entry_price * (Decimal::ONE - offset),
                });
            }
        }
    }

    let candidate = candidate?;
    let floor = hard_floor(pos.entry_price, pos.side, risk.stop_loss_percent);
    let clamped = match pos.side {
        PositionSide::Long => candidate.max(floor),
        PositionSide::Short => candidate.min(floor),
    };

    if pos.improves_stop(clamped) {
        debug!(
            symbol = %pos.symbol,
            old = %pos.stop_loss,
            new = %clamped,
            "stop loss tightened"
        );
        Some(clamped)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn position(side: PositionSide, stop_loss: Decimal) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side,
            entry_price: dec!(100),
            entry_time: Utc.timestamp_millis_opt(0).unwrap(),
            quantity: dec!(1),
            cost: dec!(100),
            margin_usdt: None,
            stop_loss,
            take_profit: match side {
                PositionSide::Long => dec!(110),
                PositionSide::Short => dec!(90),
            },
            trailing_stop: None,
            trailing_stop_activated: false,
            last_funding_ts: None,
            total_funding_paid: Decimal::ZERO,
            exchange_sl_order_id: None,
            exchange_sl_price: None,
            exit_timeout_count: 0,
            signal_conditions: Vec::new(),
        }
    }

    fn risk() -> RiskConfig {
        RiskConfig {
            stop_loss_percent: dec!(5),
            break_even_profit: Some(dec!(0.02)),
            break_even_stop: dec!(0.002),
            ..RiskConfig::default()
        }
    }

    struct CustomStop(Decimal);

    impl Strategy for CustomStop {
        fn id(&self) -> &str {
            "custom-stop"
        }

        fn populate_signal(&self, _ctx: &StrategyContext) -> crate::types::SignalKind {
            crate::types::SignalKind::None
        }

        fn custom_stoploss(&self, _pos: &Position, _ctx: &StrategyContext) -> Option<Decimal> {
            Some(self.0)
        }
    }

    #[test]
    fn break_even_moves_stop_above_entry_for_long() {
        let pos = position(PositionSide::Long, dec!(95));
        // profit 3% >= 2% threshold
        let new_stop = resolve_new_stop_loss(&pos, dec!(103), None, None, &risk()).unwrap();
        assert_eq!(new_stop, dec!(100.2));
    }

    #[test]
    fn break_even_not_reached_no_change() {
        let pos = position(PositionSide::Long, dec!(95));
        assert!(resolve_new_stop_loss(&pos, dec!(101), None, None, &risk()).is_none());
    }

    #[test]
    fn hard_floor_clamps_reckless_custom_stop() {
        let pos = position(PositionSide::Long, dec!(96));
        let strategy = CustomStop(dec!(80));
        // custom stop 80 clamps to floor 95, which does not improve on 96
        let snap = crate::indicators::IndicatorSnapshot {
            price: dec!(103),
            prev_price: None,
            ma_short: dec!(100),
            ma_long: dec!(100),
            prev_ma_short: None,
            prev_ma_long: None,
            rsi: dec!(50),
            prev_rsi: None,
            volume: dec!(1),
            avg_volume: dec!(1),
            macd: None,
            cvd: None,
            funding_rate: None,
            btc_dominance: None,
            btc_dom_change: None,
        };
        let params = crate::config::StrategyParams::default();
        let signals = crate::config::SignalsConfig::default();
        let ctx = StrategyContext {
            symbol: "BTCUSDT",
            candles: &[],
            indicators: &snap,
            params: &params,
            signals: &signals,
            position_side: Some(PositionSide::Long),
        };
        assert!(
            resolve_new_stop_loss(&pos, dec!(103), Some(&strategy), Some(&ctx), &risk()).is_none()
        );

        // a sane custom stop above the current one is applied as-is
        let strategy = CustomStop(dec!(101));
        let new_stop =
            resolve_new_stop_loss(&pos, dec!(103), Some(&strategy), Some(&ctx), &risk()).unwrap();
        assert_eq!(new_stop, dec!(101));
    }

    #[test]
    fn stops_never_walk_backwards() {
        let pos = position(PositionSide::Long, dec!(101));
        // break-even candidate 100.2 is below current stop 101
        assert!(resolve_new_stop_loss(&pos, dec!(103), None, None, &risk()).is_none());
    }

    #[test]
    fn short_side_mirrors() {
        let pos = position(PositionSide::Short, dec!(105));
        // short in 3% profit: candidate = 100 * (1 - 0.002) = 99.8
        let new_stop = resolve_new_stop_loss(&pos, dec!(97), None, None, &risk()).unwrap();
        assert_eq!(new_stop, dec!(99.8));
        assert_eq!(hard_floor(dec!(100), PositionSide::Short, dec!(5)), dec!(105));
    }
}
