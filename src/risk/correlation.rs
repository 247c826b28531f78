use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::types::{Candle, PositionSide};

/// Window of candles used for return correlations.
pub const CORRELATION_WINDOW: usize = 60;
const MIN_RETURN_SAMPLES: usize = 10;

/// Simple per-candle returns over the last `CORRELATION_WINDOW` candles,
/// as f64 for the statistics below.
pub fn candle_returns(candles: &[Candle]) -> Vec<f64> {
    let start = candles.len().saturating_sub(CORRELATION_WINDOW);
    candles[start..]
        .windows(2)
        .filter_map(|w| {
            if w[0].close.is_zero() {
                return None;
            }
            let ret = (w[1].close - w[0].close) / w[0].close;
            ret.try_into().ok()
        })
        .collect()
}

/// Pearson correlation over two aligned return series; series are trimmed
/// to the common tail.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < MIN_RETURN_SAMPLES {
        return None;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];

    let nf = n as f64;
    let mean_a = a.iter().sum::<f64>() / nf;
    let mean_b = b.iter().sum::<f64>() / nf;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

pub fn correlation_between(a: &[Candle], b: &[Candle]) -> Option<f64> {
    pearson(&candle_returns(a), &candle_returns(b))
}

/// A position already held, as seen by the heat calculation.
pub struct HeldExposure<'a> {
    pub symbol: &'a str,
    pub side: PositionSide,
    /// Portfolio weight: position notional over account equity.
    pub weight: Decimal,
    pub candles: &'a [Candle],
}

#[derive(Debug, Clone, Serialize)]
pub struct HeatResult {
    pub heat: Decimal,
    pub blocked: bool,
    pub size_multiplier: Decimal,
}

/// Binary gate: halve the new position when any held symbol correlates at
/// or above `threshold` with the candidate.
pub fn binary_gate_multiplier(
    candidate: &[Candle],
    held: &[(&str, &[Candle])],
    threshold: Decimal,
) -> Decimal {
    let threshold_f: f64 = threshold.try_into().unwrap_or(1.0);
    for (_, candles) in held {
        if let Some(rho) = correlation_between(candidate, candles) {
            if rho >= threshold_f {
                return dec!(0.5);
            }
        }
    }
    Decimal::ONE
}

/// Weighted correlation heat: same-side correlation adds, opposite-side
/// (hedging) subtracts. At or above `max_heat` the entry is blocked;
/// otherwise the size multiplier is `1 - heat`, floored at zero.
pub fn portfolio_heat(
    candidate: &[Candle],
    candidate_side: PositionSide,
    held: &[HeldExposure],
    max_heat: Decimal,
) -> HeatResult {
    let mut heat = Decimal::ZERO;
    for exposure in held {
        let Some(rho) = correlation_between(candidate, exposure.candles) else {
            continue;
        };
        let abs_rho = Decimal::try_from(rho.abs()).unwrap_or(Decimal::ZERO);
        let effective = if exposure.side == candidate_side {
            abs_rho
        } else {
            -abs_rho
        };
        heat += effective * exposure.weight;
    }

    if heat >= max_heat {
        return HeatResult {
            heat,
            blocked: true,
            size_multiplier: Decimal::ZERO,
        };
    }
    HeatResult {
        heat,
        blocked: false,
        size_multiplier: (Decimal::ONE - heat).max(Decimal::ZERO),
    }
}

/// Aggregate exposure ratios for the open book.
#[derive(Debug, Clone, Serialize)]
pub struct ExposureSummary {
    pub position_count: usize,
    pub long_exposure_ratio: Decimal,
    pub short_exposure_ratio: Decimal,
    pub gross_exposure_ratio: Decimal,
    pub net_exposure_ratio: Decimal,
    /// Mean pairwise |rho|; present with two or more positions.
    pub avg_abs_correlation: Option<f64>,
}

pub fn exposure_summary(
    equity: Decimal,
    positions: &[(PositionSide, Decimal, &[Candle])],
) -> ExposureSummary {
    let mut long = Decimal::ZERO;
    let mut short = Decimal::ZERO;
    for (side, notional, _) in positions {
        match side {
            PositionSide::Long => long += *notional,
            PositionSide::Short => short += *notional,
        }
    }

    let ratio = |v: Decimal| {
        if equity.is_zero() {
            Decimal::ZERO
        } else {
            v / equity
        }
    };

    let avg_abs_correlation = if positions.len() >= 2 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for i in 0..positions.len() {
            for j in (i + 1)..positions.len() {
                if let Some(rho) = correlation_between(positions[i].2, positions[j].2) {
                    sum += rho.abs();
                    count += 1;
                }
            }
        }
        if count > 0 {
            Some(sum / count as f64)
        } else {
            None
        }
    } else {
        None
    };

    ExposureSummary {
        position_count: positions.len(),
        long_exposure_ratio: ratio(long),
        short_exposure_ratio: ratio(short),
        gross_exposure_ratio: ratio(long + short),
        net_exposure_ratio: ratio(long - short),
        avg_abs_correlation,
    }
}
