use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    /// Broker order direction that closes a position of this side.
    pub fn closing_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    pub fn opening_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Broker-level order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Raw strategy output. Position-aware evaluation guarantees at most one
/// actionable kind per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    None,
    Buy,
    Sell,
    Short,
    Cover,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::None => "none",
            SignalKind::Buy => "buy",
            SignalKind::Sell => "sell",
            SignalKind::Short => "short",
            SignalKind::Cover => "cover",
        }
    }

    /// Entries open exposure; exits release it and bypass the entry filters.
    pub fn is_entry(&self) -> bool {
        matches!(self, SignalKind::Buy | SignalKind::Short)
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, SignalKind::Sell | SignalKind::Cover)
    }

    /// Fixed tie-break order for ensemble scoring.
    pub fn vote_order() -> [SignalKind; 4] {
        [
            SignalKind::Buy,
            SignalKind::Sell,
            SignalKind::Short,
            SignalKind::Cover,
        ]
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeFrame {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl TimeFrame {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFrame::M1 => "1m",
            TimeFrame::M5 => "5m",
            TimeFrame::M15 => "15m",
            TimeFrame::H1 => "1h",
            TimeFrame::H4 => "4h",
            TimeFrame::D1 => "1d",
        }
    }

    pub fn to_minutes(&self) -> u64 {
        match self {
            TimeFrame::M1 => 1,
            TimeFrame::M5 => 5,
            TimeFrame::M15 => 15,
            TimeFrame::H1 => 60,
            TimeFrame::H4 => 240,
            TimeFrame::D1 => 1440,
        }
    }

    /// Duration of one candle in epoch milliseconds. Protection windows are
    /// expressed in candles and converted through this.
    pub fn candle_ms(&self) -> i64 {
        (self.to_minutes() * 60 * 1000) as i64
    }
}

impl FromStr for TimeFrame {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(TimeFrame::M1),
            "5m" => Ok(TimeFrame::M5),
            "15m" => Ok(TimeFrame::M15),
            "1h" => Ok(TimeFrame::H1),
            "4h" => Ok(TimeFrame::H4),
            "1d" => Ok(TimeFrame::D1),
            other => Err(format!("unknown timeframe '{other}'")),
        }
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Backtest,
    Paper,
    Live,
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Backtest => write!(f, "Backtest"),
            TradingMode::Paper => write!(f, "Paper"),
            TradingMode::Live => write!(f, "Live"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_roundtrip() {
        for tf in [
            TimeFrame::M1,
            TimeFrame::M5,
            TimeFrame::M15,
            TimeFrame::H1,
            TimeFrame::H4,
            TimeFrame::D1,
        ] {
            assert_eq!(tf.as_str().parse::<TimeFrame>().unwrap(), tf);
        }
        assert_eq!(TimeFrame::H1.candle_ms(), 3_600_000);
    }

    #[test]
    fn closing_side_inverts_position_side() {
        assert_eq!(PositionSide::Long.closing_order_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.closing_order_side(), OrderSide::Buy);
    }
}
