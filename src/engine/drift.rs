use chrono::DateTime;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;

use crate::types::{FillEvent, PositionSide, TradeSide};

/// Pairing tolerance between paper and live entries.
const ENTRY_TIME_TOLERANCE_MS: i64 = 60_000;

/// A closed round trip reconstructed from the fill history: an entry
/// (buy/short) matched with the next exit (sell/cover) on the same
/// symbol.
#[derive(Debug, Clone)]
pub struct RoundTrip {
    pub symbol: String,
    pub side: PositionSide,
    pub entry: FillEvent,
    pub exit: FillEvent,
}

pub fn reconstruct_round_trips(fills: &[FillEvent]) -> Vec<RoundTrip> {
    let mut open: HashMap<(String, PositionSide), FillEvent> = HashMap::new();
    let mut trips = Vec::new();

    let mut ordered: Vec<&FillEvent> = fills.iter().collect();
    ordered.sort_by_key(|f| f.timestamp);

    for fill in ordered {
        match fill.side {
            TradeSide::Buy | TradeSide::Short => {
                open.insert(
                    (fill.symbol.clone(), fill.side.position_side()),
                    fill.clone(),
                );
            }
            TradeSide::Sell | TradeSide::Cover => {
                let key = (fill.symbol.clone(), fill.side.position_side());
                if let Some(entry) = open.remove(&key) {
                    trips.push(RoundTrip {
                        symbol: fill.symbol.clone(),
                        side: fill.side.position_side(),
                        entry,
                        exit: fill.clone(),
                    });
                }
            }
        }
    }
    trips
}

/// Slippage as a percentage of the inferred signal price. The signal
/// price backs the slippage out of the fill: longs filled above it,
/// shorts below it.
fn slippage_ratio_percent(fill: &FillEvent, side: PositionSide) -> Option<Decimal> {
    let signal_price = match side {
        PositionSide::Long => fill.fill_price - fill.slippage_per_unit,
        PositionSide::Short => fill.fill_price + fill.slippage_per_unit,
    };
    if signal_price <= Decimal::ZERO {
        return None;
    }
    Some(fill.slippage_per_unit / signal_price * dec!(100))
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftPair {
    pub symbol: String,
    pub paper_entry_time: DateTime<Utc>,
    pub live_entry_time: DateTime<Utc>,
    pub drift_percent: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolDrift {
    pub pairs: usize,
    pub avg_drift_percent: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub total_pairs: usize,
    pub avg_drift_percent: Decimal,
    pub max_drift_percent: Decimal,
    /// Pairs whose drift exceeds the configured threshold.
    pub exceeding_threshold: usize,
    pub threshold_percent: Decimal,
    pub by_symbol: HashMap<String, SymbolDrift>,
    pub pairs: Vec<DriftPair>,
}

/// Pair paper round trips against live ones on (symbol, side) with entry
/// times within a minute, and report the fill-price drift between the
/// two execution paths.
pub fn detect_drift(
    paper_fills: &[FillEvent],
    live_fills: &[FillEvent],
    threshold_percent: Decimal,
) -> DriftReport {
    let paper_trips = reconstruct_round_trips(paper_fills);
    let mut live_trips = reconstruct_round_trips(live_fills);

    let mut pairs = Vec::new();
    for paper in &paper_trips {
        let paper_entry_ms = paper.entry.timestamp.timestamp_millis();
        let candidate = live_trips
            .iter()
            .enumerate()
            .filter(|(_, live)| live.symbol == paper.symbol && live.side == paper.side)
            .map(|(i, live)| {
                let delta = (live.entry.timestamp.timestamp_millis() - paper_entry_ms).abs();
                (i, delta)
            })
            .filter(|(_, delta)| *delta <= ENTRY_TIME_TOLERANCE_MS)
            .min_by_key(|(_, delta)| *delta);

        let Some((index, _)) = candidate else {
            continue;
        };
        let live = live_trips.remove(index);

        let (Some(paper_ratio), Some(live_ratio)) = (
            slippage_ratio_percent(&paper.entry, paper.side),
            slippage_ratio_percent(&live.entry, live.side),
        ) else {
            continue;
        };

        pairs.push(DriftPair {
            symbol: paper.symbol.clone(),
            paper_entry_time: paper.entry.timestamp,
            live_entry_time: live.entry.timestamp,
            drift_percent: (paper_ratio - live_ratio).abs(),
        });
    }

    let total_pairs = pairs.len();
    let avg = if total_pairs > 0 {
        pairs.iter().map(|p| p.drift_percent).sum::<Decimal>()
            / Decimal::from(total_pairs as u64)
    } else {
        Decimal::ZERO
    };
    let max = pairs
        .iter()
        .map(|p| p.drift_percent)
        .max()
        .unwrap_or(Decimal::ZERO);
    let exceeding = pairs
        .iter()
        .filter(|p| p.drift_percent > threshold_percent)
        .count();

    let mut by_symbol: HashMap<String, SymbolDrift> = HashMap::new();
    for pair in &pairs {
        let entry = by_symbol.entry(pair.symbol.clone()).or_insert(SymbolDrift {
            pairs: 0,
            avg_drift_percent: Decimal::ZERO,
        });
        entry.pairs += 1;
        entry.avg_drift_percent += pair.drift_percent;
    }
    for drift in by_symbol.values_mut() {
        if drift.pairs > 0 {
            drift.avg_drift_percent /= Decimal::from(drift.pairs as u64);
        }
    }

    DriftReport {
        total_pairs,
        avg_drift_percent: avg,
        max_drift_percent: max,
        exceeding_threshold: exceeding,
        threshold_percent,
        by_symbol,
        pairs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fill(
        symbol: &str,
        side: TradeSide,
        price: Decimal,
        slip: Decimal,
        seconds: i64,
    ) -> FillEvent {
        FillEvent {
            symbol: symbol.to_string(),
            side,
            fill_price: price,
            quantity: dec!(1),
            slippage_per_unit: slip,
            timestamp: Utc.timestamp_millis_opt(seconds * 1000).unwrap(),
        }
    }

    fn scenario(slip: Decimal, entry_offset_s: i64) -> Vec<FillEvent> {
        vec![
            fill("BTCUSDT", TradeSide::Buy, dec!(100) + slip, slip, entry_offset_s),
            fill("BTCUSDT", TradeSide::Sell, dec!(105), slip, entry_offset_s + 3600),
        ]
    }

    #[test]
    fn identical_inputs_have_zero_drift() {
        let paper = scenario(dec!(0.05), 0);
        let live = scenario(dec!(0.05), 10);
        let report = detect_drift(&paper, &live, dec!(0.5));
        assert_eq!(report.total_pairs, 1);
        assert_eq!(report.pairs[0].drift_percent, Decimal::ZERO);
        assert_eq!(report.exceeding_threshold, 0);
    }

    #[test]
    fn entries_beyond_a_minute_never_pair() {
        let paper = scenario(dec!(0.05), 0);
        let live = scenario(dec!(0.05), 61);
        let report = detect_drift(&paper, &live, dec!(0.5));
        assert_eq!(report.total_pairs, 0);
    }

    #[test]
    fn mismatched_symbols_never_pair() {
        let paper = scenario(dec!(0.05), 0);
        let live = vec![
            fill("ETHUSDT", TradeSide::Buy, dec!(100.05), dec!(0.05), 0),
            fill("ETHUSDT", TradeSide::Sell, dec!(105), dec!(0.05), 3600),
        ];
        let report = detect_drift(&paper, &live, dec!(0.5));
        assert_eq!(report.total_pairs, 0);
    }

    #[test]
    fn live_slippage_excess_shows_as_drift() {
        // paper slips 0.05 on a 100 signal price: 0.05%
        let paper = scenario(dec!(0.05), 0);
        // live slips 1.00 on the same signal price: 1.0%
        let live = scenario(dec!(1), 5);
        let report = detect_drift(&paper, &live, dec!(0.5));
        assert_eq!(report.total_pairs, 1);
        assert_eq!(report.pairs[0].drift_percent, dec!(0.95));
        assert_eq!(report.exceeding_threshold, 1);
        assert_eq!(report.by_symbol["BTCUSDT"].pairs, 1);
    }

    #[test]
    fn short_round_trips_pair_by_direction() {
        let paper = vec![
            fill("BTCUSDT", TradeSide::Short, dec!(99.95), dec!(0.05), 0),
            fill("BTCUSDT", TradeSide::Cover, dec!(95), dec!(0.05), 3600),
        ];
        // a live long must not pair with a paper short
        let live_long = scenario(dec!(0.05), 0);
        let report = detect_drift(&paper, &live_long, dec!(0.5));
        assert_eq!(report.total_pairs, 0);

        let live_short = vec![
            fill("BTCUSDT", TradeSide::Short, dec!(99.95), dec!(0.05), 20),
            fill("BTCUSDT", TradeSide::Cover, dec!(95), dec!(0.05), 3700),
        ];
        let report = detect_drift(&paper, &live_short, dec!(0.5));
        assert_eq!(report.total_pairs, 1);
        assert_eq!(report.pairs[0].drift_percent, Decimal::ZERO);
    }
}
