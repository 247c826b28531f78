use rust_decimal::Decimal;

/// Wilder RSI over a price series: averages seeded with the SMA of the
/// first `period` gains/losses, then `avg = (prev*(period-1) + curr)/period`.
/// Returns 100 when the average loss is zero. Needs `period + 1` samples.
pub fn rsi(values: &[Decimal], period: usize) -> Option<Decimal> {
    rsi_series(values, period)?.last().copied()
}

/// RSI value series; entry `i` corresponds to input index `period + i`.
pub fn rsi_series(values: &[Decimal], period: usize) -> Option<Vec<Decimal>> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }

    let period_dec = Decimal::from(period as u64);
    let mut gains = Vec::with_capacity(period);
    let mut losses = Vec::with_capacity(period);
    for w in values[..period + 1].windows(2) {
        let change = w[1] - w[0];
        if change > Decimal::ZERO {
            gains.push(change);
            losses.push(Decimal::ZERO);
        } else {
            gains.push(Decimal::ZERO);
            losses.push(change.abs());
        }
    }

    let mut avg_gain: Decimal = gains.iter().sum::<Decimal>() / period_dec;
    let mut avg_loss: Decimal = losses.iter().sum::<Decimal>() / period_dec;

    let mut out = Vec::with_capacity(values.len() - period);
    out.push(rsi_from_averages(avg_gain, avg_loss));

    for w in values[period..].windows(2) {
        let change = w[1] - w[0];
        let (gain, loss) = if change > Decimal::ZERO {
            (change, Decimal::ZERO)
        } else {
            (Decimal::ZERO, change.abs())
        };
        avg_gain = (avg_gain * (period_dec - Decimal::ONE) + gain) / period_dec;
        avg_loss = (avg_loss * (period_dec - Decimal::ONE) + loss) / period_dec;
        out.push(rsi_from_averages(avg_gain, avg_loss));
    }

    Some(out)
}

fn rsi_from_averages(avg_gain: Decimal, avg_loss: Decimal) -> Decimal {
    if avg_loss.is_zero() {
        return Decimal::from(100);
    }
    let rs = avg_gain / avg_loss;
    Decimal::from(100) - Decimal::from(100) / (Decimal::ONE + rs)
}
