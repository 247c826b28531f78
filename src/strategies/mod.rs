pub mod ensemble;
pub mod registry;
pub mod rules;

pub use ensemble::*;
pub use registry::*;
pub use rules::*;

use rust_decimal::Decimal;

use crate::config::{SignalsConfig, StrategyParams};
use crate::indicators::IndicatorSnapshot;
use crate::types::{Candle, ExitReason, Position, PositionSide, SignalKind, Trade};

/// Read-only view a strategy receives per tick.
pub struct StrategyContext<'a> {
    pub symbol: &'a str,
    pub candles: &'a [Candle],
    pub indicators: &'a IndicatorSnapshot,
    pub params: &'a StrategyParams,
    pub signals: &'a SignalsConfig,
    pub position_side: Option<PositionSide>,
}

/// A strategy-requested exit, routed through the confirm-exit hook before
/// it closes anything.
#[derive(Debug, Clone)]
pub struct ExitRequest {
    pub reason: String,
}

/// Uniform capability set for strategies. `populate_signal` is mandatory;
/// the remaining hooks default to "no opinion" and callers probe them by
/// their return values.
pub trait Strategy: Send + Sync {
    fn id(&self) -> &str;

    /// Raw signal for the current tick. Must honour position-awareness:
    /// never an entry while holding, never an exit while flat.
    fn populate_signal(&self, ctx: &StrategyContext) -> SignalKind;

    /// Strategy-supplied stop candidate, before the hard-floor clamp.
    fn custom_stoploss(&self, _pos: &Position, _ctx: &StrategyContext) -> Option<Decimal> {
        None
    }

    /// Strategy-level exit trigger, checked before price-based exits.
    fn should_exit(&self, _pos: &Position, _ctx: &StrategyContext) -> Option<ExitRequest> {
        None
    }

    /// Veto hook for pending exits. `None` defers to the default
    /// flash-crash policy; `Some(false)` rejects the exit.
    fn confirm_exit(
        &self,
        _pos: &Position,
        _reason: ExitReason,
        _ctx: &StrategyContext,
    ) -> Option<bool> {
        None
    }

    fn on_trade_closed(&self, _trade: &Trade) {}
}
