use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{ExitReason, Trade};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

/// Aggregate backtest metrics over the trade ledger and equity curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub initial_usdt: Decimal,
    pub final_equity: Decimal,
    pub total_return_pct: Decimal,
    pub max_drawdown_pct: Decimal,
    pub sharpe_ratio: Decimal,

    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub win_rate_pct: Decimal,
    pub profit_factor: Decimal,
    pub average_win: Decimal,
    pub average_loss: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,

    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub net_profit: Decimal,
    pub total_fees: Decimal,
    pub total_funding_paid: Decimal,
    pub exits_by_reason: HashMap<ExitReason, u64>,

    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Trade>,
}

impl BacktestReport {
    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(56));
        println!("                 BACKTEST RESULTS");
        println!("{}", "=".repeat(56));
        println!("Initial:          ${:.2}", self.initial_usdt);
        println!("Final Equity:     ${:.2}", self.final_equity);
        println!("Total Return:     {:.2}%", self.total_return_pct);
        println!("Max Drawdown:     {:.2}%", self.max_drawdown_pct);
        println!("Sharpe Ratio:     {:.2}", self.sharpe_ratio);
        println!("{}", "-".repeat(56));
        println!("Trades:           {}", self.total_trades);
        println!(
            "Win Rate:         {:.1}% ({} / {})",
            self.win_rate_pct, self.winning_trades, self.total_trades
        );
        println!("Profit Factor:    {:.2}", self.profit_factor);
        println!("Avg Win / Loss:   ${:.2} / ${:.2}", self.average_win, self.average_loss);
        println!("Fees Paid:        ${:.2}", self.total_fees);
        println!("Funding Paid:     ${:.2}", self.total_funding_paid);
        for (reason, count) in &self.exits_by_reason {
            println!("  exits via {reason}: {count}");
        }
        println!("{}", "=".repeat(56));
    }
}

pub struct MetricsCalculator;

impl MetricsCalculator {
    pub fn calculate(
        initial_usdt: Decimal,
        final_equity: Decimal,
        trades: Vec<Trade>,
        equity_curve: Vec<EquityPoint>,
        total_fees: Decimal,
        total_funding_paid: Decimal,
    ) -> BacktestReport {
        let total_trades = trades.len() as u64;
        let wins: Vec<Decimal> = trades
            .iter()
            .filter(|t| t.pnl > Decimal::ZERO)
            .map(|t| t.pnl)
            .collect();
        let losses: Vec<Decimal> = trades
            .iter()
            .filter(|t| t.pnl < Decimal::ZERO)
            .map(|t| t.pnl.abs())
            .collect();

        let gross_profit: Decimal = wins.iter().sum();
        let gross_loss: Decimal = losses.iter().sum();
        let net_profit = final_equity - initial_usdt;

        let win_rate_pct = if total_trades > 0 {
            Decimal::from(wins.len() as u64) / Decimal::from(total_trades) * dec!(100)
        } else {
            Decimal::ZERO
        };
        let profit_factor = if gross_loss.is_zero() {
            if gross_profit.is_zero() {
                Decimal::ZERO
            } else {
                dec!(999)
            }
        } else {
            gross_profit / gross_loss
        };

        let avg = |values: &[Decimal]| {
            if values.is_empty() {
                Decimal::ZERO
            } else {
                values.iter().sum::<Decimal>() / Decimal::from(values.len() as u64)
            }
        };

        let total_return_pct = if initial_usdt.is_zero() {
            Decimal::ZERO
        } else {
            net_profit / initial_usdt * dec!(100)
        };

        let mut exits_by_reason: HashMap<ExitReason, u64> = HashMap::new();
        for trade in &trades {
            *exits_by_reason.entry(trade.exit_reason).or_insert(0) += 1;
        }

        BacktestReport {
            initial_usdt,
            final_equity,
            total_return_pct,
            max_drawdown_pct: Self::max_drawdown_pct(&equity_curve),
            sharpe_ratio: Self::sharpe_ratio(&equity_curve),
            total_trades,
            winning_trades: wins.len() as u64,
            losing_trades: losses.len() as u64,
            win_rate_pct,
            profit_factor,
            average_win: avg(&wins),
            average_loss: avg(&losses),
            largest_win: wins.iter().copied().max().unwrap_or(Decimal::ZERO),
            largest_loss: losses.iter().copied().max().unwrap_or(Decimal::ZERO),
            gross_profit,
            gross_loss,
            net_profit,
            total_fees,
            total_funding_paid,
            exits_by_reason,
            equity_curve,
            trades,
        }
    }

    fn max_drawdown_pct(curve: &[EquityPoint]) -> Decimal {
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;
        for point in curve {
            if point.equity > peak {
                peak = point.equity;
            }
            if !peak.is_zero() {
                let dd = (peak - point.equity) / peak * dec!(100);
                if dd > max_dd {
                    max_dd = dd;
                }
            }
        }
        max_dd
    }

    /// Annualized Sharpe over end-of-day equity returns (sqrt(365), zero
    /// risk-free rate). Zero when returns are flat or too few.
    fn sharpe_ratio(curve: &[EquityPoint]) -> Decimal {
        let mut daily_last: Vec<(NaiveDate, f64)> = Vec::new();
        for point in curve {
            let date = point.timestamp.date_naive();
            let equity: f64 = point.equity.try_into().unwrap_or(0.0);
            match daily_last.last_mut() {
                Some((last_date, last_equity)) if *last_date == date => *last_equity = equity,
                _ => daily_last.push((date, equity)),
            }
        }
        if daily_last.len() < 3 {
            return Decimal::ZERO;
        }

        let returns: Vec<f64> = daily_last
            .windows(2)
            .filter(|w| w[0].1 > 0.0)
            .map(|w| (w[1].1 - w[0].1) / w[0].1)
            .collect();
        if returns.len() < 2 {
            return Decimal::ZERO;
        }

        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std = variance.sqrt();
        if std < f64::EPSILON {
            return Decimal::ZERO;
        }
        let sharpe = mean / std * 365f64.sqrt();
        Decimal::try_from(sharpe).unwrap_or(Decimal::ZERO)
    }
}
