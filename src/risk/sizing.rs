use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;

use crate::types::TradeRecord;

/// Half-Kelly fraction from a win rate and the win/loss payoff ratio,
/// clamped to [0, 0.5]. Returns zero when the edge is negative.
pub fn kelly_fraction(win_rate: Decimal, avg_win: Decimal, avg_loss: Decimal) -> Decimal {
    if avg_loss <= Decimal::ZERO || avg_win <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let b = avg_win / avg_loss;
    let full = win_rate - (Decimal::ONE - win_rate) / b;
    (full / dec!(2)).clamp(Decimal::ZERO, dec!(0.5))
}

/// Kelly fraction from recent closed trades; None until enough samples of
/// both outcomes exist.
pub fn kelly_from_trades(recent: &[TradeRecord]) -> Option<Decimal> {
    const MIN_TRADES: usize = 10;
    if recent.len() < MIN_TRADES {
        return None;
    }
    let wins: Vec<Decimal> = recent
        .iter()
        .filter(|t| t.pnl_ratio > Decimal::ZERO)
        .map(|t| t.pnl_ratio)
        .collect();
    let losses: Vec<Decimal> = recent
        .iter()
        .filter(|t| t.pnl_ratio < Decimal::ZERO)
        .map(|t| -t.pnl_ratio)
        .collect();
    if wins.is_empty() || losses.is_empty() {
        return None;
    }
    let win_rate = Decimal::from(wins.len() as u64) / Decimal::from(recent.len() as u64);
    let avg_win = wins.iter().sum::<Decimal>() / Decimal::from(wins.len() as u64);
    let avg_loss = losses.iter().sum::<Decimal>() / Decimal::from(losses.len() as u64);
    Some(kelly_fraction(win_rate, avg_win, avg_loss))
}

/// Active ROI-table threshold for a hold duration: the most permissive
/// (smallest) target among entries whose minimum hold has elapsed.
pub fn roi_target(minimal_roi: &BTreeMap<i64, Decimal>, hold_ms: i64) -> Option<Decimal> {
    minimal_roi
        .range(..=hold_ms)
        .map(|(_, threshold)| *threshold)
        .min()
}
