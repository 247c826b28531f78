pub mod adx;
pub mod bollinger;
pub mod macd;
pub mod rsi;
pub mod snapshot;
pub mod volume;

pub use adx::*;
pub use bollinger::*;
pub use macd::*;
pub use rsi::*;
pub use snapshot::*;
pub use volume::*;

use rust_decimal::Decimal;

/// Arithmetic mean of the last `period` values.
pub fn sma(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: Decimal = values.iter().rev().take(period).sum();
    Some(sum / Decimal::from(period as u64))
}

/// EMA seeded with the SMA of the first `period` values, then
/// `v*k + prev*(1-k)` with `k = 2/(period+1)`.
pub fn ema(values: &[Decimal], period: usize) -> Option<Decimal> {
    ema_series(values, period)?.last().copied()
}

/// Full EMA series starting at index `period - 1` of the input.
pub fn ema_series(values: &[Decimal], period: usize) -> Option<Vec<Decimal>> {
    if period == 0 || values.len() < period {
        return None;
    }
    let k = Decimal::from(2) / Decimal::from(period as u64 + 1);
    let seed: Decimal = values[..period].iter().sum::<Decimal>() / Decimal::from(period as u64);
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(seed);
    let mut prev = seed;
    for v in &values[period..] {
        prev = *v * k + prev * (Decimal::ONE - k);
        out.push(prev);
    }
    Some(out)
}

pub fn highest(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    values.iter().rev().take(period).max().copied()
}

pub fn lowest(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    values.iter().rev().take(period).min().copied()
}

/// Population standard deviation over the last `period` values.
pub fn stddev(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let mean = sma(values, period)?;
    let variance: Decimal = values
        .iter()
        .rev()
        .take(period)
        .map(|v| {
            let diff = *v - mean;
            diff * diff
        })
        .sum::<Decimal>()
        / Decimal::from(period as u64);
    Some(sqrt_decimal(variance))
}

/// Newton-iteration square root; good to ~10 decimal places.
pub fn sqrt_decimal(value: Decimal) -> Decimal {
    if value.is_zero() || value.is_sign_negative() {
        return Decimal::ZERO;
    }
    let mut guess = value / Decimal::from(2);
    if guess.is_zero() {
        guess = value;
    }
    let epsilon = Decimal::new(1, 10);
    for _ in 0..50 {
        let new_guess = (guess + value / guess) / Decimal::from(2);
        if (new_guess - guess).abs() < epsilon {
            return new_guess;
        }
        guess = new_guess;
    }
    guess
}
