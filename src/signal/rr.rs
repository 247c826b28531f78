use rust_decimal::Decimal;

use crate::types::{Candle, SignalKind};

/// Lookback used for support/resistance when no external pivot is given.
pub const RR_LOOKBACK: usize = 20;
const MIN_CANDLES: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct RiskRewardCheck {
    pub passed: bool,
    /// None means the check was skipped or disabled (ratio treated as
    /// infinite).
    pub ratio: Option<Decimal>,
    pub support: Option<Decimal>,
    pub resistance: Option<Decimal>,
}

impl RiskRewardCheck {
    fn pass_unbounded() -> Self {
        Self {
            passed: true,
            ratio: None,
            support: None,
            resistance: None,
        }
    }
}

/// Prospective reward over prospective risk, measured against recent
/// structure. `min_rr == 0` disables the filter; fewer than five candles
/// skips it.
pub fn check_risk_reward(
    candles: &[Candle],
    kind: SignalKind,
    price: Decimal,
    min_rr: Decimal,
    pivot: Option<(Decimal, Decimal)>,
) -> RiskRewardCheck {
    if min_rr.is_zero() {
        return RiskRewardCheck::pass_unbounded();
    }
    if candles.len() < MIN_CANDLES {
        return RiskRewardCheck::pass_unbounded();
    }

    let (support, resistance) = match pivot {
        Some(pivot) => pivot,
        None => {
            let start = candles.len().saturating_sub(RR_LOOKBACK);
            let window = &candles[start..];
            let support = window
                .iter()
                .map(|c| c.low)
                .min()
                .unwrap_or(price);
            let resistance = window
                .iter()
                .map(|c| c.high)
                .max()
                .unwrap_or(price);
            (support, resistance)
        }
    };

    let (reward, risk) = match kind {
        SignalKind::Buy => (resistance - price, price - support),
        SignalKind::Short => (price - support, resistance - price),
        // exits and none are never gated here
        _ => {
            return RiskRewardCheck::pass_unbounded();
        }
    };

    // No measurable risk: treat the ratio as infinite and pass.
    if risk <= Decimal::ZERO {
        return RiskRewardCheck {
            passed: true,
            ratio: None,
            support: Some(support),
            resistance: Some(resistance),
        };
    }

    let ratio = reward.max(Decimal::ZERO) / risk;
    RiskRewardCheck {
        passed: ratio >= min_rr,
        ratio: Some(ratio),
        support: Some(support),
        resistance: Some(resistance),
    }
}
