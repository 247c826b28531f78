use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::PositionSide;

/// Direction of a fill. Entries are `Buy`/`Short`, exits `Sell`/`Cover`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
    Short,
    Cover,
}

impl TradeSide {
    pub fn is_entry(&self) -> bool {
        matches!(self, TradeSide::Buy | TradeSide::Short)
    }

    pub fn position_side(&self) -> PositionSide {
        match self {
            TradeSide::Buy | TradeSide::Sell => PositionSide::Long,
            TradeSide::Short | TradeSide::Cover => PositionSide::Short,
        }
    }

    /// The exit side that closes a round trip opened with this side.
    pub fn matching_exit(&self) -> Option<TradeSide> {
        match self {
            TradeSide::Buy => Some(TradeSide::Sell),
            TradeSide::Short => Some(TradeSide::Cover),
            _ => None,
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
    TrailingStop,
    TimeStop,
    RoiTable,
    StagedTp,
    EndOfData,
    ForceExit,
    ForceExitTimeout,
    ForceExitManual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Signal => "signal",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TimeStop => "time_stop",
            ExitReason::RoiTable => "roi_table",
            ExitReason::StagedTp => "staged_tp",
            ExitReason::EndOfData => "end_of_data",
            ExitReason::ForceExit => "force_exit",
            ExitReason::ForceExitTimeout => "force_exit_timeout",
            ExitReason::ForceExitManual => "force_exit_manual",
        }
    }

    /// Force exits bypass the confirm-exit veto unconditionally.
    pub fn is_force_exit(&self) -> bool {
        matches!(
            self,
            ExitReason::ForceExit | ExitReason::ForceExitTimeout | ExitReason::ForceExitManual
        )
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A completed round trip. Appended once to the account ledger and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub side: TradeSide,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub cost: Decimal,
    pub proceeds: Decimal,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
    pub exit_reason: ExitReason,
}

impl Trade {
    pub fn was_stop_loss(&self) -> bool {
        self.exit_reason == ExitReason::StopLoss
    }
}

/// Compressed view of a recent closed trade, fed to the protection gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub closed_at: DateTime<Utc>,
    pub pnl_ratio: Decimal,
    pub was_stop_loss: bool,
}

impl TradeRecord {
    pub fn from_trade(trade: &Trade) -> Self {
        Self {
            symbol: trade.symbol.clone(),
            closed_at: trade.exit_time,
            pnl_ratio: if trade.cost.is_zero() {
                Decimal::ZERO
            } else {
                trade.pnl / trade.cost
            },
            was_stop_loss: trade.was_stop_loss(),
        }
    }
}

/// One execution event as persisted to the JSONL history; the drift
/// analyzer pairs these across scenarios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub symbol: String,
    pub side: TradeSide,
    pub fill_price: Decimal,
    pub quantity: Decimal,
    /// Absolute price paid to slippage per unit, in quote currency.
    pub slippage_per_unit: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_exit_reasons() {
        assert!(ExitReason::ForceExit.is_force_exit());
        assert!(ExitReason::ForceExitTimeout.is_force_exit());
        assert!(ExitReason::ForceExitManual.is_force_exit());
        assert!(!ExitReason::StopLoss.is_force_exit());
    }

    #[test]
    fn trade_side_pairing() {
        assert_eq!(TradeSide::Buy.matching_exit(), Some(TradeSide::Sell));
        assert_eq!(TradeSide::Short.matching_exit(), Some(TradeSide::Cover));
        assert_eq!(TradeSide::Sell.matching_exit(), None);
    }
}
