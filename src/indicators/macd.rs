use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ema_series;

/// Current and previous MACD values, enough for golden/dead-cross
/// detection without re-deriving history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdOutput {
    pub macd: Decimal,
    pub signal: Decimal,
    pub histogram: Decimal,
    pub prev_macd: Decimal,
    pub prev_signal: Decimal,
    pub prev_histogram: Decimal,
}

/// MACD(fast, slow, signal). Requires at least `slow + signal + 1` samples
/// so that both a current and a previous signal value exist.
pub fn macd(
    values: &[Decimal],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<MacdOutput> {
    if fast == 0 || slow == 0 || signal == 0 || fast >= slow {
        return None;
    }
    if values.len() < slow + signal + 1 {
        return None;
    }

    let fast_series = ema_series(values, fast)?;
    let slow_series = ema_series(values, slow)?;

    // Align both series on the slow seed; fast has (slow - fast) extra
    // leading entries.
    let offset = slow - fast;
    let macd_line: Vec<Decimal> = slow_series
        .iter()
        .enumerate()
        .map(|(i, s)| fast_series[i + offset] - *s)
        .collect();

    let signal_series = ema_series(&macd_line, signal)?;
    if signal_series.len() < 2 {
        return None;
    }

    let curr_signal = *signal_series.last()?;
    let prev_signal = signal_series[signal_series.len() - 2];
    let curr_macd = *macd_line.last()?;
    let prev_macd = macd_line[macd_line.len() - 2];

    Some(MacdOutput {
        macd: curr_macd,
        signal: curr_signal,
        histogram: curr_macd - curr_signal,
        prev_macd,
        prev_signal,
        prev_histogram: prev_macd - prev_signal,
    })
}

impl MacdOutput {
    /// MACD line crossed above its signal line on the latest sample.
    pub fn golden_cross(&self) -> bool {
        self.prev_macd <= self.prev_signal && self.macd > self.signal
    }

    /// MACD line crossed below its signal line on the latest sample.
    pub fn dead_cross(&self) -> bool {
        self.prev_macd >= self.prev_signal && self.macd < self.signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_requires_enough_samples() {
        let values: Vec<Decimal> = (1..=35).map(Decimal::from).collect();
        assert!(macd(&values, 12, 26, 9).is_none());
        let values: Vec<Decimal> = (1..=36).map(Decimal::from).collect();
        assert!(macd(&values, 12, 26, 9).is_some());
    }

    #[test]
    fn macd_positive_in_uptrend() {
        let values: Vec<Decimal> = (1..=60).map(Decimal::from).collect();
        let out = macd(&values, 12, 26, 9).unwrap();
        assert!(out.macd > Decimal::ZERO);
        assert!(!out.dead_cross());
    }

    #[test]
    fn histogram_is_macd_minus_signal() {
        let values: Vec<Decimal> = (1..=60).map(|v| Decimal::from(v * v)).collect();
        let out = macd(&values, 5, 10, 3).unwrap();
        assert_eq!(out.histogram, out.macd - out.signal);
        assert_eq!(out.prev_histogram, out.prev_macd - out.prev_signal);
    }
}
