use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

use crate::strategies::{Strategy, StrategyContext};
use crate::types::{ExitReason, Position};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitConfirmation {
    pub confirmed: bool,
    pub reason: Option<String>,
}

impl ExitConfirmation {
    fn confirmed() -> Self {
        Self {
            confirmed: true,
            reason: None,
        }
    }

    fn rejected(reason: &str) -> Self {
        Self {
            confirmed: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Confirm or veto a pending exit. Force exits always pass. A strategy
/// `confirm_exit` opinion is authoritative when present. The default
/// policy rejects stop-loss exits whose loss exceeds `max_deviation`: a
/// move that violent usually means a flash crash with no real liquidity
/// at the stop, so waiting beats selling the bottom.
pub fn should_confirm_exit(
    pos: &Position,
    reason: ExitReason,
    profit_ratio: Decimal,
    max_deviation: Decimal,
    strategy: Option<&dyn Strategy>,
    ctx: Option<&StrategyContext>,
) -> ExitConfirmation {
    if reason.is_force_exit() {
        return ExitConfirmation::confirmed();
    }

    if let (Some(strategy), Some(ctx)) = (strategy, ctx) {
        if let Some(verdict) = strategy.confirm_exit(pos, reason, ctx) {
            return if verdict {
                ExitConfirmation::confirmed()
            } else {
                debug!(symbol = %pos.symbol, %reason, "exit vetoed by strategy");
                ExitConfirmation::rejected("strategy_rejected")
            };
        }
    }

    if reason == ExitReason::StopLoss && profit_ratio.abs() > max_deviation {
        debug!(
            symbol = %pos.symbol,
            %profit_ratio,
            "stop-loss exit rejected: move exceeds max deviation"
        );
        return ExitConfirmation::rejected("flash_crash_protection");
    }

    ExitConfirmation::confirmed()
}

/// Per-symbol timestamps of the last rejected exit, owned by the
/// executor process.
pub type RejectionLog = HashMap<String, DateTime<Utc>>;

pub fn record_exit_rejection(log: &mut RejectionLog, symbol: &str, now: DateTime<Utc>) {
    log.insert(symbol.to_string(), now);
}

/// Whether the symbol's last exit rejection is still inside the cooldown
/// window.
pub fn is_exit_rejection_cooling_down(
    symbol: &str,
    cooldown_ms: i64,
    log: &RejectionLog,
    now: DateTime<Utc>,
) -> bool {
    log.get(symbol)
        .map(|last| (now - *last).num_milliseconds() < cooldown_ms)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionSide;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            entry_price: dec!(50000),
            entry_time: Utc.timestamp_millis_opt(0).unwrap(),
            quantity: dec!(0.1),
            cost: dec!(5000),
            margin_usdt: None,
            stop_loss: dec!(48000),
            take_profit: dec!(55000),
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

    #[test]
    fn flash_crash_rejects_oversized_stop_loss() {
        // long from 50000 marked at 42000: -16% against 15% max deviation
        let result = should_confirm_exit(
            &position(),
            ExitReason::StopLoss,
            dec!(-0.16),
            dec!(0.15),
            None,
            None,
        );
        assert_eq!(
            result,
            ExitConfirmation {
                confirmed: false,
                reason: Some("flash_crash_protection".to_string()),
            }
        );
    }

    #[test]
    fn force_exit_always_confirms() {
        for reason in [
            ExitReason::ForceExit,
            ExitReason::ForceExitTimeout,
            ExitReason::ForceExitManual,
        ] {
            let result =
                should_confirm_exit(&position(), reason, dec!(-0.5), dec!(0.15), None, None);
            assert!(result.confirmed);
        }
    }

    #[test]
    fn normal_exits_confirm() {
        let result = should_confirm_exit(
            &position(),
            ExitReason::TakeProfit,
            dec!(0.1),
            dec!(0.15),
            None,
            None,
        );
        assert!(result.confirmed);

        // small stop-loss inside deviation passes too
        let result = should_confirm_exit(
            &position(),
            ExitReason::StopLoss,
            dec!(-0.04),
            dec!(0.15),
            None,
            None,
        );
        assert!(result.confirmed);
    }

    #[test]
    fn rejection_log_cooldown_window() {
        let mut log = RejectionLog::new();
        let t0 = Utc.timestamp_millis_opt(1_000_000).unwrap();
        record_exit_rejection(&mut log, "BTCUSDT", t0);

        let within = t0 + chrono::Duration::milliseconds(30_000);
        assert!(is_exit_rejection_cooling_down("BTCUSDT", 60_000, &log, within));

        let after = t0 + chrono::Duration::milliseconds(61_000);
        assert!(!is_exit_rejection_cooling_down("BTCUSDT", 60_000, &log, after));
        assert!(!is_exit_rejection_cooling_down("ETHUSDT", 60_000, &log, within));
    }
}
