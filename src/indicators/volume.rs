use rust_decimal::Decimal;

use crate::types::Candle;

use super::sma;

/// Ratio of the last volume to the SMA of the `period` volumes before it
/// (exclusive of the current candle).
pub fn volume_ratio(volumes: &[Decimal], period: usize) -> Option<Decimal> {
    if volumes.len() < period + 1 {
        return None;
    }
    let current = *volumes.last()?;
    let prior = &volumes[..volumes.len() - 1];
    let avg = sma(prior, period)?;
    if avg.is_zero() {
        return None;
    }
    Some(current / avg)
}

/// Average volume over the `period` candles preceding the current one.
pub fn average_volume(volumes: &[Decimal], period: usize) -> Option<Decimal> {
    if volumes.len() < period + 1 {
        return None;
    }
    sma(&volumes[..volumes.len() - 1], period)
}

/// Cumulative volume delta: signed volume summed over the window, where
/// the sign follows the candle direction.
pub fn cvd(candles: &[Candle]) -> Decimal {
    candles.iter().map(|c| c.signed_volume()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn volume_ratio_excludes_current_candle() {
        let volumes = vec![dec!(100), dec!(100), dec!(100), dec!(300)];
        assert_eq!(volume_ratio(&volumes, 3), Some(dec!(3)));
    }

    #[test]
    fn cvd_sums_signed_volume() {
        let t = Utc.timestamp_millis_opt(0).unwrap();
        let mk = |open: Decimal, close: Decimal, volume: Decimal| Candle {
            open_time: t,
            close_time: t,
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume,
        };
        let candles = vec![
            mk(dec!(10), dec!(11), dec!(100)), // +100
            mk(dec!(11), dec!(10), dec!(40)),  // -40
            mk(dec!(10), dec!(10), dec!(500)), // 0
        ];
        assert_eq!(cvd(&candles), dec!(60));
    }
}
