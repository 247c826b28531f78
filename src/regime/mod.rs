use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::indicators::{adx, bollinger_width_series, width_percentile};
use crate::types::{Candle, SignalKind};

const ADX_PERIOD: usize = 14;
const BB_PERIOD: usize = 20;
const STRUCTURE_WINDOW: usize = 10;
/// Absolute band width below which the market counts as compressed.
const NARROW_WIDTH: Decimal = dec!(0.3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    TrendingBull,
    TrendingBear,
    RangingTight,
    RangingWide,
    BreakoutUp,
    BreakoutDown,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::TrendingBull => "trending_bull",
            MarketRegime::TrendingBear => "trending_bear",
            MarketRegime::RangingTight => "ranging_tight",
            MarketRegime::RangingWide => "ranging_wide",
            MarketRegime::BreakoutUp => "breakout_up",
            MarketRegime::BreakoutDown => "breakout_down",
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceStructure {
    HigherHighs,
    LowerLows,
    Mixed,
    Flat,
}

/// What classes of signals the current regime admits. Doubles as the key
/// into `regime_overrides`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalFilter {
    TrendSignalsOnly,
    ReversalSignalsOnly,
    BreakoutWatch,
    ReducedSize,
    All,
}

impl SignalFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalFilter::TrendSignalsOnly => "trend_signals_only",
            SignalFilter::ReversalSignalsOnly => "reversal_signals_only",
            SignalFilter::BreakoutWatch => "breakout_watch",
            SignalFilter::ReducedSize => "reduced_size",
            SignalFilter::All => "all",
        }
    }
}

impl std::fmt::Display for SignalFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeAnalysis {
    pub regime: MarketRegime,
    /// 0..=100.
    pub confidence: Decimal,
    pub adx: Decimal,
    pub bb_width: Decimal,
    pub bb_width_percentile: Decimal,
    pub structure: PriceStructure,
    pub signal_filter: SignalFilter,
}

/// Label recent highs/lows: the latest `STRUCTURE_WINDOW` candles against
/// the window before them.
fn price_structure(candles: &[Candle]) -> PriceStructure {
    if candles.len() < STRUCTURE_WINDOW * 2 {
        return PriceStructure::Flat;
    }
    let split = candles.len() - STRUCTURE_WINDOW;
    let prior = &candles[split - STRUCTURE_WINDOW..split];
    let recent = &candles[split..];

    let prior_high = prior.iter().map(|c| c.high).max().unwrap_or_default();
    let prior_low = prior.iter().map(|c| c.low).min().unwrap_or_default();
    let recent_high = recent.iter().map(|c| c.high).max().unwrap_or_default();
    let recent_low = recent.iter().map(|c| c.low).min().unwrap_or_default();

    let higher = recent_high > prior_high;
    let lower = recent_low < prior_low;
    match (higher, lower) {
        (true, false) if recent_low > prior_low => PriceStructure::HigherHighs,
        (false, true) if recent_high < prior_high => PriceStructure::LowerLows,
        (false, false) => PriceStructure::Flat,
        _ => PriceStructure::Mixed,
    }
}

/// Classify the market state of a candle window. Returns None while the
/// window is too short for ADX or the band-width history.
pub fn classify_regime(candles: &[Candle]) -> Option<RegimeAnalysis> {
    let adx_out = adx(candles, ADX_PERIOD)?;
    let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
    let widths = bollinger_width_series(&closes, BB_PERIOD, dec!(2))?;
    if widths.len() < STRUCTURE_WINDOW + 1 {
        return None;
    }

    let bb_width = *widths.last()?;
    let bb_pct = width_percentile(&widths)?;
    let structure = price_structure(candles);
    let width_10_ago = widths[widths.len() - 1 - STRUCTURE_WINDOW];

    let di_bullish = adx_out.plus_di > adx_out.minus_di;

    // 1. Compression breakout: narrow 10 candles ago, width expanded >30%.
    if width_10_ago < NARROW_WIDTH && bb_width > width_10_ago * dec!(1.3) {
        let regime = if di_bullish {
            MarketRegime::BreakoutUp
        } else {
            MarketRegime::BreakoutDown
        };
        return Some(RegimeAnalysis {
            regime,
            confidence: dec!(55),
            adx: adx_out.adx,
            bb_width,
            bb_width_percentile: bb_pct,
            structure,
            signal_filter: SignalFilter::BreakoutWatch,
        });
    }

    // 2. Established trend.
    if adx_out.adx > dec!(25) {
        let (regime, aligned, opposed) = if di_bullish {
            (
                MarketRegime::TrendingBull,
                structure == PriceStructure::HigherHighs,
                structure == PriceStructure::LowerLows,
            )
        } else {
            (
                MarketRegime::TrendingBear,
                structure == PriceStructure::LowerLows,
                structure == PriceStructure::HigherHighs,
            )
        };
        let mut confidence = if aligned {
            (dec!(60) + dec!(1.5) * (adx_out.adx - dec!(25))).min(dec!(95))
        } else {
            dec!(45)
        };
        if opposed {
            confidence = (confidence - dec!(20)).max(Decimal::ZERO);
        }
        return Some(RegimeAnalysis {
            regime,
            confidence,
            adx: adx_out.adx,
            bb_width,
            bb_width_percentile: bb_pct,
            structure,
            signal_filter: SignalFilter::TrendSignalsOnly,
        });
    }

    // 3. Range-bound.
    if adx_out.adx < dec!(20) {
        let (regime, filter, confidence) = if bb_pct < dec!(25) {
            (MarketRegime::RangingTight, SignalFilter::BreakoutWatch, dec!(75))
        } else {
            (
                MarketRegime::RangingWide,
                SignalFilter::ReversalSignalsOnly,
                dec!(65),
            )
        };
        return Some(RegimeAnalysis {
            regime,
            confidence,
            adx: adx_out.adx,
            bb_width,
            bb_width_percentile: bb_pct,
            structure,
            signal_filter: filter,
        });
    }

    // 4. ADX 20..=25: transition zone, trade small.
    Some(RegimeAnalysis {
        regime: MarketRegime::RangingWide,
        confidence: dec!(48),
        adx: adx_out.adx,
        bb_width,
        bb_width_percentile: bb_pct,
        structure,
        signal_filter: SignalFilter::ReducedSize,
    })
}

/// Whether the regime admits a signal class. Exits always pass;
/// `breakout_watch` admits exits only.
pub fn should_allow_signal(analysis: &RegimeAnalysis, kind: SignalKind) -> bool {
    if kind.is_exit() || kind == SignalKind::None {
        return true;
    }
    match analysis.signal_filter {
        SignalFilter::BreakoutWatch => false,
        SignalFilter::TrendSignalsOnly => match analysis.regime {
            MarketRegime::TrendingBull => kind == SignalKind::Buy,
            MarketRegime::TrendingBear => kind == SignalKind::Short,
            _ => true,
        },
        SignalFilter::ReversalSignalsOnly | SignalFilter::ReducedSize | SignalFilter::All => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn candle(i: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        let t = Utc.timestamp_millis_opt(i * 3_600_000).unwrap();
        Candle {
            open_time: t,
            close_time: t,
            open,
            high,
            low,
            close,
            volume: dec!(1000),
        }
    }

    fn trending_up(n: usize) -> Vec<Candle> {
        (0..n as i64)
            .map(|i| {
                let base = Decimal::from(100 + 3 * i);
                candle(i, base, base + dec!(4), base - dec!(1), base + dec!(3))
            })
            .collect()
    }

    fn flat_range(n: usize) -> Vec<Candle> {
        (0..n as i64)
            .map(|i| {
                let wiggle = Decimal::from(i % 2);
                candle(
                    i,
                    dec!(100) + wiggle,
                    dec!(101) + wiggle,
                    dec!(99) + wiggle,
                    dec!(100) + wiggle,
                )
            })
            .collect()
    }

    #[test]
    fn uptrend_classifies_trending_bull() {
        let analysis = classify_regime(&trending_up(60)).unwrap();
        assert_eq!(analysis.regime, MarketRegime::TrendingBull);
        assert_eq!(analysis.signal_filter, SignalFilter::TrendSignalsOnly);
        assert!(analysis.confidence >= dec!(60));
        assert_eq!(analysis.structure, PriceStructure::HigherHighs);
    }

    #[test]
    fn tight_range_watches_for_breakout() {
        let analysis = classify_regime(&flat_range(80)).unwrap();
        assert!(analysis.adx < dec!(20), "adx {}", analysis.adx);
        assert_eq!(analysis.regime, MarketRegime::RangingTight);
        assert_eq!(analysis.signal_filter, SignalFilter::BreakoutWatch);
        assert_eq!(analysis.confidence, dec!(75));
    }

    #[test]
    fn width_expansion_out_of_compression_is_a_breakout() {
        // dead-flat compression, then one wide down candle blows the
        // band width out well past the 30% expansion rule
        let mut candles: Vec<Candle> = (0..40)
            .map(|i| candle(i, dec!(100), dec!(100), dec!(100), dec!(100)))
            .collect();
        candles.push(candle(40, dec!(100), dec!(100), dec!(94), dec!(95)));

        let analysis = classify_regime(&candles).unwrap();
        assert_eq!(analysis.regime, MarketRegime::BreakoutDown);
        assert_eq!(analysis.signal_filter, SignalFilter::BreakoutWatch);
        assert_eq!(analysis.confidence, dec!(55));
        // confidence below 60 means the engine still admits entries
        assert!(analysis.confidence < dec!(60));
    }

    #[test]
    fn breakout_watch_admits_exits_only() {
        let analysis = classify_regime(&flat_range(80)).unwrap();
        assert_eq!(analysis.signal_filter, SignalFilter::BreakoutWatch);
        assert!(!should_allow_signal(&analysis, SignalKind::Buy));
        assert!(!should_allow_signal(&analysis, SignalKind::Short));
        assert!(should_allow_signal(&analysis, SignalKind::Sell));
        assert!(should_allow_signal(&analysis, SignalKind::Cover));
    }

    #[test]
    fn trend_filter_blocks_countertrend_entry() {
        let analysis = classify_regime(&trending_up(60)).unwrap();
        assert!(should_allow_signal(&analysis, SignalKind::Buy));
        assert!(!should_allow_signal(&analysis, SignalKind::Short));
    }
}
