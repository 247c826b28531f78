use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::config::ProtectionsConfig;
use crate::types::TradeRecord;

/// Why an entry was blocked by the protection gates.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtectionReason {
    CooldownPeriod { symbol: String },
    StoplossGuard { stop_losses: usize, limit: usize },
    MaxDrawdown { drawdown: Decimal },
    LowProfitPair { symbol: String, avg_profit: Decimal },
}

impl std::fmt::Display for ProtectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtectionReason::CooldownPeriod { symbol } => {
                write!(f, "cooldown active for {symbol} after stop-loss")
            }
            ProtectionReason::StoplossGuard { stop_losses, limit } => {
                write!(f, "stoploss guard: {stop_losses} stop-losses >= limit {limit}")
            }
            ProtectionReason::MaxDrawdown { drawdown } => {
                write!(f, "max drawdown protection: cumulative pnl ratio {drawdown}")
            }
            ProtectionReason::LowProfitPair { symbol, avg_profit } => {
                write!(f, "low profit pair {symbol}: avg pnl ratio {avg_profit}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProtectionResult {
    pub allowed: bool,
    pub reason: Option<ProtectionReason>,
}

impl ProtectionResult {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn block(reason: ProtectionReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Entry gates over the recent closed trades. Rules run in a fixed order;
/// the first failing rule blocks the entry.
pub struct ProtectionManager;

impl ProtectionManager {
    pub fn check(
        symbol: &str,
        now: DateTime<Utc>,
        recent_trades: &[TradeRecord],
        config: &ProtectionsConfig,
        candle_ms: i64,
    ) -> ProtectionResult {
        // 1. Cooldown after a stop-loss on this symbol.
        if let Some(cooldown) = config.cooldown.as_ref().filter(|c| c.enabled) {
            let window = Duration::milliseconds(cooldown.stop_duration_candles as i64 * candle_ms);
            let blocked = recent_trades.iter().any(|t| {
                t.symbol == symbol && t.was_stop_loss && now - t.closed_at < window
            });
            if blocked {
                debug!(%symbol, "entry blocked by cooldown");
                return ProtectionResult::block(ProtectionReason::CooldownPeriod {
                    symbol: symbol.to_string(),
                });
            }
        }

        // 2. Too many stop-losses in the lookback window.
        if let Some(guard) = config.stoploss_guard.as_ref().filter(|c| c.enabled) {
            let window = Duration::milliseconds(guard.lookback_period_candles as i64 * candle_ms);
            let stop_losses = recent_trades
                .iter()
                .filter(|t| {
                    t.was_stop_loss
                        && now - t.closed_at < window
                        && (!guard.only_per_pair || t.symbol == symbol)
                })
                .count();
            if stop_losses >= guard.trade_limit {
                debug!(%symbol, stop_losses, "entry blocked by stoploss guard");
                return ProtectionResult::block(ProtectionReason::StoplossGuard {
                    stop_losses,
                    limit: guard.trade_limit,
                });
            }
        }

        // 3. Cumulative drawdown across all pairs.
        if let Some(dd) = config.max_drawdown.as_ref().filter(|c| c.enabled) {
            let window = Duration::milliseconds(dd.lookback_period_candles as i64 * candle_ms);
            let in_window: Vec<&TradeRecord> = recent_trades
                .iter()
                .filter(|t| now - t.closed_at < window)
                .collect();
            if in_window.len() >= dd.trade_limit {
                let drawdown: Decimal = in_window.iter().map(|t| t.pnl_ratio).sum();
                if drawdown <= dd.max_allowed_drawdown {
                    debug!(%drawdown, "entry blocked by max drawdown protection");
                    return ProtectionResult::block(ProtectionReason::MaxDrawdown { drawdown });
                }
            }
        }

        // 4. This pair keeps losing money.
        if let Some(lp) = config.low_profit_pairs.as_ref().filter(|c| c.enabled) {
            let window = Duration::milliseconds(lp.lookback_period_candles as i64 * candle_ms);
            let pair_trades: Vec<&TradeRecord> = recent_trades
                .iter()
                .filter(|t| t.symbol == symbol && now - t.closed_at < window)
                .collect();
            if pair_trades.len() >= lp.trade_limit {
                let avg_profit: Decimal = pair_trades.iter().map(|t| t.pnl_ratio).sum::<Decimal>()
                    / Decimal::from(pair_trades.len() as u64);
                if avg_profit < lp.required_profit {
                    debug!(%symbol, %avg_profit, "entry blocked by low profit pairs");
                    return ProtectionResult::block(ProtectionReason::LowProfitPair {
                        symbol: symbol.to_string(),
                        avg_profit,
                    });
                }
            }
        }

        ProtectionResult::allow()
    }
}
