use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::StrategyParams;
use crate::types::Candle;

use super::{cvd, ema, macd, rsi, volume_ratio, MacdOutput};

const AVG_VOLUME_PERIOD: usize = 20;

/// Indicator values at the last candle of a window, plus the previous
/// values needed for crossover detection. Computed solely from the candle
/// window; external scalars are injected afterwards by the signal engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub price: Decimal,
    pub prev_price: Option<Decimal>,
    pub ma_short: Decimal,
    pub ma_long: Decimal,
    pub prev_ma_short: Option<Decimal>,
    pub prev_ma_long: Option<Decimal>,
    pub rsi: Decimal,
    pub prev_rsi: Option<Decimal>,
    pub volume: Decimal,
    pub avg_volume: Decimal,
    pub macd: Option<MacdOutput>,
    pub cvd: Option<Decimal>,
    pub funding_rate: Option<Decimal>,
    pub btc_dominance: Option<Decimal>,
    pub btc_dom_change: Option<Decimal>,
}

impl IndicatorSnapshot {
    /// MA fields use EMA; true when the short average sits above the long.
    pub fn ma_bullish(&self) -> bool {
        self.ma_short > self.ma_long
    }

    pub fn ma_bearish(&self) -> bool {
        self.ma_short < self.ma_long
    }

    pub fn volume_ratio(&self) -> Decimal {
        if self.avg_volume.is_zero() {
            return Decimal::ZERO;
        }
        self.volume / self.avg_volume
    }
}

/// Compute the snapshot for a candle window, or None while warming up.
pub fn compute_snapshot(candles: &[Candle], params: &StrategyParams) -> Option<IndicatorSnapshot> {
    let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<Decimal> = candles.iter().map(|c| c.volume).collect();

    let mut warmup = params.ma.long.max(params.rsi.period + 1).max(AVG_VOLUME_PERIOD + 1);
    if params.macd.enabled {
        warmup = warmup.max(params.macd.slow + params.macd.signal + 1);
    }
    if closes.len() < warmup {
        return None;
    }

    let last = candles.last()?;
    let prev_closes = &closes[..closes.len() - 1];

    let ma_short = ema(&closes, params.ma.short)?;
    let ma_long = ema(&closes, params.ma.long)?;
    let rsi_now = rsi(&closes, params.rsi.period)?;
    let avg_volume = super::average_volume(&volumes, AVG_VOLUME_PERIOD)?;

    let macd_out = if params.macd.enabled {
        macd(&closes, params.macd.fast, params.macd.slow, params.macd.signal)
    } else {
        None
    };

    Some(IndicatorSnapshot {
        price: last.close,
        prev_price: prev_closes.last().copied(),
        ma_short,
        ma_long,
        prev_ma_short: ema(prev_closes, params.ma.short),
        prev_ma_long: ema(prev_closes, params.ma.long),
        rsi: rsi_now,
        prev_rsi: rsi(prev_closes, params.rsi.period),
        volume: last.volume,
        avg_volume,
        macd: macd_out,
        cvd: Some(cvd(candles)),
        funding_rate: None,
        btc_dominance: None,
        btc_dom_change: None,
    })
}

/// Convenience wrapper exposing the exclusive-window volume ratio for a
/// raw candle slice.
pub fn window_volume_ratio(candles: &[Candle]) -> Option<Decimal> {
    let volumes: Vec<Decimal> = candles.iter().map(|c| c.volume).collect();
    volume_ratio(&volumes, AVG_VOLUME_PERIOD)
}
