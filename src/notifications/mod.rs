use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::ExitReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Typed alert payloads the engines emit. Transports (Telegram etc.) live
/// outside this crate; the default sink below writes to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Alert {
    PositionOpened {
        symbol: String,
        side: String,
        quantity: String,
        entry_price: String,
    },
    PositionClosed {
        symbol: String,
        pnl: String,
        pnl_percent: String,
        reason: String,
    },
    StopLossTriggered {
        symbol: String,
        price: String,
        pnl: String,
    },
    ForceExit {
        symbol: String,
        reason: String,
        order_placed: bool,
    },
    ExitOrderTimeout {
        symbol: String,
        timeout_count: u32,
    },
    DailyLossLimitReached {
        loss: String,
        limit: String,
    },
    EngineStarted {
        mode: String,
        scenario: String,
    },
    EngineStopped {
        scenario: String,
    },
}

impl Alert {
    pub fn severity(&self) -> Severity {
        match self {
            Alert::ForceExit { .. } | Alert::DailyLossLimitReached { .. } => Severity::Critical,
            Alert::StopLossTriggered { .. } | Alert::ExitOrderTimeout { .. } => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

pub fn position_opened(symbol: &str, side: &str, quantity: Decimal, price: Decimal) -> Alert {
    Alert::PositionOpened {
        symbol: symbol.to_string(),
        side: side.to_string(),
        quantity: quantity.to_string(),
        entry_price: price.to_string(),
    }
}

pub fn position_closed(symbol: &str, pnl: Decimal, pnl_percent: Decimal, reason: ExitReason) -> Alert {
    Alert::PositionClosed {
        symbol: symbol.to_string(),
        pnl: pnl.to_string(),
        pnl_percent: pnl_percent.to_string(),
        reason: reason.to_string(),
    }
}

pub fn force_exit(symbol: &str, reason: ExitReason, order_placed: bool) -> Alert {
    Alert::ForceExit {
        symbol: symbol.to_string(),
        reason: reason.to_string(),
        order_placed,
    }
}

/// Outbound alert sink. Sends must never propagate errors into the
/// trading loop.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: Alert);
}

/// Default sink: structured log lines.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: Alert) {
        match alert.severity() {
            Severity::Info => info!(?alert, "alert"),
            Severity::Warning | Severity::Critical => warn!(?alert, "alert"),
        }
    }
}

/// Sink that drops everything; used by backtests and tests.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _alert: Alert) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn force_exit_is_critical() {
        let alert = force_exit("BTCUSDT", ExitReason::ForceExitTimeout, false);
        assert_eq!(alert.severity(), Severity::Critical);
    }

    #[test]
    fn alerts_serialize_with_tag() {
        let alert = position_opened("BTCUSDT", "long", dec!(0.5), dec!(42000));
        let json = serde_json::to_string(&alert).unwrap();
        assert!(json.contains("\"type\":\"PositionOpened\""));
    }
}
