use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::PositionSide;

/// Trailing-stop bookkeeping for one position. `highest_price` is the
/// high-water mark for longs; shorts track `lowest_price` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopState {
    pub active: bool,
    pub highest_price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lowest_price: Option<Decimal>,
    pub stop_price: Decimal,
}

/// An open position. Invariants: `quantity > 0`; for longs
/// `stop_loss < entry_price < take_profit`, mirrored for shorts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Effective entry price, post slippage and half-spread.
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub quantity: Decimal,
    /// USDT debited on entry.
    pub cost: Decimal,
    /// Reserved margin for shorts, net of the entry fee.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin_usdt: Option<Decimal>,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_stop: Option<TrailingStopState>,
    #[serde(default)]
    pub trailing_stop_activated: bool,
    /// Last settled 8h funding boundary, epoch ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_funding_ts: Option<i64>,
    #[serde(default)]
    pub total_funding_paid: Decimal,
    /// Broker id of the exchange-native stop order, when one is resting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_sl_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_sl_price: Option<Decimal>,
    /// Consecutive exit-order timeouts; the third escalates to force-exit.
    #[serde(default)]
    pub exit_timeout_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signal_conditions: Vec<String>,
}

impl Position {
    /// Unrealized profit as a fraction of the entry notional, at `price`.
    pub fn profit_ratio(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        match self.side {
            PositionSide::Long => (price - self.entry_price) / self.entry_price,
            PositionSide::Short => (self.entry_price - price) / self.entry_price,
        }
    }

    pub fn notional(&self, price: Decimal) -> Decimal {
        self.quantity * price
    }

    /// Account-equity contribution of this position marked at `price`.
    pub fn mark_value(&self, price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => self.quantity * price,
            PositionSide::Short => {
                let margin = self.margin_usdt.unwrap_or(self.cost);
                margin + (self.entry_price - price) * self.quantity
            }
        }
    }

    pub fn hold_duration_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_time).num_milliseconds()
    }

    /// Whether `candidate` is a strictly better stop than the current one.
    /// Stops never walk backwards.
    pub fn improves_stop(&self, candidate: Decimal) -> bool {
        match self.side {
            PositionSide::Long => candidate > self.stop_loss,
            PositionSide::Short => candidate < self.stop_loss,
        }
    }
}
