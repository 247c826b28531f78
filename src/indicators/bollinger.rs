use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{sma, stddev};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BollingerBands {
    pub upper: Decimal,
    pub middle: Decimal,
    pub lower: Decimal,
}

impl BollingerBands {
    /// Normalized band width `(upper - lower) / middle`.
    pub fn width(&self) -> Decimal {
        if self.middle.is_zero() {
            return Decimal::ZERO;
        }
        (self.upper - self.lower) / self.middle
    }
}

pub fn bollinger(values: &[Decimal], period: usize, std_mult: Decimal) -> Option<BollingerBands> {
    let middle = sma(values, period)?;
    let sd = stddev(values, period)?;
    Some(BollingerBands {
        upper: middle + sd * std_mult,
        middle,
        lower: middle - sd * std_mult,
    })
}

/// Band width at each index from `period - 1` onward.
pub fn bollinger_width_series(
    values: &[Decimal],
    period: usize,
    std_mult: Decimal,
) -> Option<Vec<Decimal>> {
    if period == 0 || values.len() < period {
        return None;
    }
    let mut out = Vec::with_capacity(values.len() - period + 1);
    for end in period..=values.len() {
        let bands = bollinger(&values[..end], period, std_mult)?;
        out.push(bands.width());
    }
    Some(out)
}

/// Percentile rank (0..=100) of the last width within the series.
pub fn width_percentile(widths: &[Decimal]) -> Option<Decimal> {
    let current = *widths.last()?;
    let below = widths.iter().filter(|w| **w < current).count();
    Some(Decimal::from(below as u64 * 100) / Decimal::from(widths.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn bands_are_symmetric_around_sma() {
        let values: Vec<Decimal> = vec![dec!(10), dec!(12), dec!(14), dec!(12), dec!(10)];
        let bands = bollinger(&values, 5, dec!(2)).unwrap();
        assert_eq!(bands.middle, dec!(11.6));
        assert_eq!(bands.upper - bands.middle, bands.middle - bands.lower);
        assert!(bands.width() > Decimal::ZERO);
    }

    #[test]
    fn flat_series_has_zero_width() {
        let values = vec![dec!(50); 10];
        let bands = bollinger(&values, 10, dec!(2)).unwrap();
        assert_eq!(bands.width(), Decimal::ZERO);
    }

    #[test]
    fn percentile_ranks_expansion_high() {
        // widths rising: last value should rank at the top
        let widths = vec![dec!(0.1), dec!(0.2), dec!(0.3), dec!(0.4), dec!(0.5)];
        assert_eq!(width_percentile(&widths), Some(dec!(80)));
        let widths = vec![dec!(0.5), dec!(0.4), dec!(0.3), dec!(0.2), dec!(0.1)];
        assert_eq!(width_percentile(&widths), Some(Decimal::ZERO));
    }
}
