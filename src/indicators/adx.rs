use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdxOutput {
    pub adx: Decimal,
    pub plus_di: Decimal,
    pub minus_di: Decimal,
}

/// Wilder ADX over candles: true range and directional movement smoothed
/// with Wilder's method, DX averaged into ADX. The first ADX value is the
/// SMA of the first `period` DX values, so `2 * period` intervals
/// (`2 * period + 1` candles) are required.
pub fn adx(candles: &[Candle], period: usize) -> Option<AdxOutput> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let period_dec = Decimal::from(period as u64);
    let hundred = Decimal::from(100);

    let mut trs = Vec::with_capacity(candles.len() - 1);
    let mut plus_dms = Vec::with_capacity(candles.len() - 1);
    let mut minus_dms = Vec::with_capacity(candles.len() - 1);

    for w in candles.windows(2) {
        let (prev, curr) = (&w[0], &w[1]);
        let tr = (curr.high - curr.low)
            .max((curr.high - prev.close).abs())
            .max((curr.low - prev.close).abs());
        trs.push(tr);

        let up_move = curr.high - prev.high;
        let down_move = prev.low - curr.low;
        if up_move > down_move && up_move > Decimal::ZERO {
            plus_dms.push(up_move);
            minus_dms.push(Decimal::ZERO);
        } else if down_move > up_move && down_move > Decimal::ZERO {
            plus_dms.push(Decimal::ZERO);
            minus_dms.push(down_move);
        } else {
            plus_dms.push(Decimal::ZERO);
            minus_dms.push(Decimal::ZERO);
        }
    }

    // Wilder smoothing: seed with the plain sum of the first period, then
    // smoothed = prev - prev/period + curr.
    let mut tr_smooth: Decimal = trs[..period].iter().sum();
    let mut plus_smooth: Decimal = plus_dms[..period].iter().sum();
    let mut minus_smooth: Decimal = minus_dms[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(trs.len() - period + 1);
    let mut plus_di = Decimal::ZERO;
    let mut minus_di = Decimal::ZERO;

    for i in (period - 1)..trs.len() {
        if i >= period {
            tr_smooth = tr_smooth - tr_smooth / period_dec + trs[i];
            plus_smooth = plus_smooth - plus_smooth / period_dec + plus_dms[i];
            minus_smooth = minus_smooth - minus_smooth / period_dec + minus_dms[i];
        }

        if tr_smooth.is_zero() {
            plus_di = Decimal::ZERO;
            minus_di = Decimal::ZERO;
        } else {
            plus_di = hundred * plus_smooth / tr_smooth;
            minus_di = hundred * minus_smooth / tr_smooth;
        }

        let di_sum = plus_di + minus_di;
        let dx = if di_sum.is_zero() {
            Decimal::ZERO
        } else {
            hundred * (plus_di - minus_di).abs() / di_sum
        };
        dx_values.push(dx);
    }

    if dx_values.len() < period {
        return None;
    }

    let mut adx_value: Decimal = dx_values[..period].iter().sum::<Decimal>() / period_dec;
    for dx in &dx_values[period..] {
        adx_value = (adx_value * (period_dec - Decimal::ONE) + *dx) / period_dec;
    }

    Some(AdxOutput {
        adx: adx_value,
        plus_di,
        minus_di,
    })
}
