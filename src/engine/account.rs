use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::storage::atomic_write_json;
use crate::types::{
    ExitReason, Position, PositionSide, Trade, TradeRecord, TradeSide, TrailingStopState,
};

/// UTC-date-keyed realized loss accumulator; resets on date rollover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyLoss {
    pub date: NaiveDate,
    pub loss: Decimal,
}

impl Default for DailyLoss {
    fn default() -> Self {
        Self {
            date: NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch date"),
            loss: Decimal::ZERO,
        }
    }
}

/// One scenario's account: free balance, open positions (unique per
/// symbol), and the append-only trade ledger. Mutated only by the owning
/// engine loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub initial_usdt: Decimal,
    pub usdt: Decimal,
    pub positions: HashMap<String, Position>,
    pub trades: Vec<Trade>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub daily_loss: DailyLoss,
    #[serde(default)]
    pub funding_paid_by_symbol: HashMap<String, Decimal>,
}

impl Account {
    pub fn new(initial_usdt: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            initial_usdt,
            usdt: initial_usdt,
            positions: HashMap::new(),
            trades: Vec::new(),
            created_at: now,
            updated_at: now,
            daily_loss: DailyLoss::default(),
            funding_paid_by_symbol: HashMap::new(),
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn position_mut(&mut self, symbol: &str) -> Option<&mut Position> {
        self.positions.get_mut(symbol)
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    /// Equity = free balance plus every open position marked at the given
    /// prices (entry price when no mark is known).
    pub fn equity(&self, marks: &HashMap<String, Decimal>) -> Decimal {
        let mut equity = self.usdt;
        for (symbol, pos) in &self.positions {
            let mark = marks.get(symbol).copied().unwrap_or(pos.entry_price);
            equity += pos.mark_value(mark);
        }
        equity
    }

    /// Open a long: debit notional plus fee, record cost as the full
    /// debit.
    #[allow(clippy::too_many_arguments)]
    pub fn open_long(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        entry_price: Decimal,
        fee: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        entry_time: DateTime<Utc>,
        signal_conditions: Vec<String>,
    ) -> Result<()> {
        if self.positions.contains_key(symbol) {
            return Err(anyhow!("position already open for {symbol}"));
        }
        let cost = quantity * entry_price + fee;
        if cost > self.usdt {
            return Err(anyhow!(
                "insufficient balance for {symbol}: need {cost}, have {}",
                self.usdt
            ));
        }
        self.usdt -= cost;
        self.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                side: PositionSide::Long,
                entry_price,
                entry_time,
                quantity,
                cost,
                margin_usdt: None,
                stop_loss,
                take_profit,
                trailing_stop: None,
                trailing_stop_activated: false,
                last_funding_ts: Some(entry_time.timestamp_millis()),
                total_funding_paid: Decimal::ZERO,
                exchange_sl_order_id: None,
                exchange_sl_price: None,
                exit_timeout_count: 0,
                signal_conditions,
            },
        );
        self.updated_at = entry_time;
        debug!(%symbol, %quantity, %entry_price, "long opened");
        Ok(())
    }

    /// Open a short: reserve the notional as margin; the margin carried on
    /// the position is net of the entry fee.
    #[allow(clippy::too_many_arguments)]
    pub fn open_short(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        entry_price: Decimal,
        fee: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        entry_time: DateTime<Utc>,
        signal_conditions: Vec<String>,
    ) -> Result<()> {
        if self.positions.contains_key(symbol) {
            return Err(anyhow!("position already open for {symbol}"));
        }
        let notional = quantity * entry_price;
        if notional > self.usdt {
            return Err(anyhow!(
                "insufficient balance for {symbol}: need {notional}, have {}",
                self.usdt
            ));
        }
        self.usdt -= notional;
        self.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                side: PositionSide::Short,
                entry_price,
                entry_time,
                quantity,
                cost: notional,
                margin_usdt: Some(notional - fee),
                stop_loss,
                take_profit,
                trailing_stop: None,
                trailing_stop_activated: false,
                last_funding_ts: Some(entry_time.timestamp_millis()),
                total_funding_paid: Decimal::ZERO,
                exchange_sl_order_id: None,
                exchange_sl_price: None,
                exit_timeout_count: 0,
                signal_conditions,
            },
        );
        self.updated_at = entry_time;
        debug!(%symbol, %quantity, %entry_price, "short opened");
        Ok(())
    }

    /// Average into an existing position. The entry price becomes the
    /// volume-weighted mean of both fills.
    pub fn add_to_position(
        &mut self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let pos = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| anyhow!("no position to add to for {symbol}"))?;
        let notional = quantity * price;
        let debit = match pos.side {
            PositionSide::Long => notional + fee,
            PositionSide::Short => notional,
        };
        if debit > self.usdt {
            return Err(anyhow!("insufficient balance to scale {symbol}"));
        }

        let old_notional = pos.quantity * pos.entry_price;
        let total_qty = pos.quantity + quantity;
        pos.entry_price = (old_notional + notional) / total_qty;
        pos.quantity = total_qty;
        pos.cost += debit;
        if pos.side == PositionSide::Short {
            if let Some(margin) = pos.margin_usdt.as_mut() {
                *margin += notional - fee;
            }
        }
        self.usdt -= debit;
        self.updated_at = now;
        info!(%symbol, %quantity, %price, "scaled into position");
        Ok(())
    }

    /// Close the position at an effective (post-slippage) exit price and
    /// append the round-trip trade. The ledger entry is immutable.
    pub fn close_position(
        &mut self,
        symbol: &str,
        exit_price: Decimal,
        exit_fee: Decimal,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<Trade> {
        let pos = self
            .positions
            .remove(symbol)
            .ok_or_else(|| anyhow!("no position to close for {symbol}"))?;

        let proceeds = match pos.side {
            PositionSide::Long => pos.quantity * exit_price - exit_fee,
            PositionSide::Short => {
                let margin = pos.margin_usdt.unwrap_or(pos.cost);
                margin + (pos.entry_price - exit_price) * pos.quantity - exit_fee
            }
        };
        let proceeds = proceeds.max(Decimal::ZERO);
        self.usdt += proceeds;

        let pnl = proceeds - pos.cost;
        let pnl_percent = if pos.cost.is_zero() {
            Decimal::ZERO
        } else {
            pnl / pos.cost
        };

        let trade = Trade {
            symbol: symbol.to_string(),
            side: match pos.side {
                PositionSide::Long => TradeSide::Buy,
                PositionSide::Short => TradeSide::Short,
            },
            entry_time: pos.entry_time,
            exit_time,
            entry_price: pos.entry_price,
            exit_price,
            quantity: pos.quantity,
            cost: pos.cost,
            proceeds,
            pnl,
            pnl_percent,
            exit_reason: reason,
        };

        if pnl < Decimal::ZERO {
            self.record_daily_loss(exit_time.date_naive(), -pnl);
        }

        self.trades.push(trade.clone());
        self.updated_at = exit_time;
        info!(%symbol, %pnl, reason = %reason, "position closed");
        Ok(trade)
    }

    /// Apply a funding cash flow to the balance and the per-symbol ledger.
    /// Positive flow credits the account.
    pub fn apply_funding(&mut self, symbol: &str, cash_flow: Decimal, boundary_ts: i64) {
        self.usdt = (self.usdt + cash_flow).max(Decimal::ZERO);
        let paid = -cash_flow;
        *self
            .funding_paid_by_symbol
            .entry(symbol.to_string())
            .or_insert(Decimal::ZERO) += paid;
        if let Some(pos) = self.positions.get_mut(symbol) {
            pos.total_funding_paid += paid;
            pos.last_funding_ts = Some(boundary_ts);
        }
    }

    pub fn record_daily_loss(&mut self, date: NaiveDate, loss: Decimal) {
        if loss <= Decimal::ZERO {
            return;
        }
        if self.daily_loss.date != date {
            self.daily_loss = DailyLoss {
                date,
                loss: Decimal::ZERO,
            };
        }
        self.daily_loss.loss += loss;
    }

    /// Whether today's realized losses exhaust the daily limit.
    pub fn daily_loss_exceeded(&self, date: NaiveDate, limit_percent: Decimal) -> bool {
        if self.daily_loss.date != date || limit_percent.is_zero() {
            return false;
        }
        let limit = self.initial_usdt * limit_percent / Decimal::from(100);
        self.daily_loss.loss >= limit
    }

    /// Protection view over the most recent closed trades.
    pub fn recent_trade_records(&self, max: usize) -> Vec<TradeRecord> {
        let start = self.trades.len().saturating_sub(max);
        self.trades[start..].iter().map(TradeRecord::from_trade).collect()
    }

    pub fn arm_trailing(&mut self, symbol: &str, state: TrailingStopState) {
        if let Some(pos) = self.positions.get_mut(symbol) {
            pos.trailing_stop = Some(state);
            pos.trailing_stop_activated = true;
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }

    /// Load a scenario snapshot, or start fresh when none exists.
    pub fn load_or_new(path: &Path, initial_usdt: Decimal, now: DateTime<Utc>) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(account) => account,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "corrupt account snapshot, starting fresh");
                    Self::new(initial_usdt, now)
                }
            },
            Err(_) => Self::new(initial_usdt, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn account() -> Account {
        Account::new(dec!(10000), t0())
    }

    #[test]
    fn long_round_trip_accounting() {
        let mut acct = account();
        acct.open_long(
            "BTCUSDT",
            dec!(0.1),
            dec!(50000),
            dec!(2),
            dec!(48500),
            dec!(53000),
            t0(),
            Vec::new(),
        )
        .unwrap();
        assert_eq!(acct.usdt, dec!(4998));
        assert_eq!(acct.open_position_count(), 1);

        let trade = acct
            .close_position("BTCUSDT", dec!(52000), dec!(2.08), t0(), ExitReason::TakeProfit)
            .unwrap();
        assert_eq!(acct.open_position_count(), 0);
        // proceeds 5200 - 2.08; cost 5002
        assert_eq!(trade.pnl, dec!(195.92));
        assert_eq!(acct.usdt, dec!(10195.92));
        assert_eq!(acct.trades.len(), 1);
    }

    #[test]
    fn short_round_trip_accounting() {
        let mut acct = account();
        acct.open_short(
            "ETHUSDT",
            dec!(1),
            dec!(3000),
            dec!(1.2),
            dec!(3090),
            dec!(2700),
            t0(),
            Vec::new(),
        )
        .unwrap();
        assert_eq!(acct.usdt, dec!(7000));
        let pos = acct.position("ETHUSDT").unwrap();
        assert_eq!(pos.margin_usdt, Some(dec!(2998.8)));

        let trade = acct
            .close_position("ETHUSDT", dec!(2700), dec!(1.08), t0(), ExitReason::TakeProfit)
            .unwrap();
        // proceeds = 2998.8 + 300 - 1.08 = 3297.72; cost 3000
        assert_eq!(trade.pnl, dec!(297.72));
        assert_eq!(acct.usdt, dec!(10297.72));
    }

    #[test]
    fn one_position_per_symbol() {
        let mut acct = account();
        acct.open_long(
            "BTCUSDT",
            dec!(0.1),
            dec!(50000),
            Decimal::ZERO,
            dec!(48500),
            dec!(53000),
            t0(),
            Vec::new(),
        )
        .unwrap();
        assert!(acct
            .open_long(
                "BTCUSDT",
                dec!(0.1),
                dec!(50000),
                Decimal::ZERO,
                dec!(48500),
                dec!(53000),
                t0(),
                Vec::new(),
            )
            .is_err());
    }

    #[test]
    fn dca_recomputes_weighted_entry() {
        let mut acct = account();
        acct.open_long(
            "BTCUSDT",
            dec!(0.1),
            dec!(50000),
            Decimal::ZERO,
            dec!(48500),
            dec!(53000),
            t0(),
            Vec::new(),
        )
        .unwrap();
        acct.add_to_position("BTCUSDT", dec!(0.1), dec!(40000), Decimal::ZERO, t0())
            .unwrap();
        let pos = acct.position("BTCUSDT").unwrap();
        assert_eq!(pos.quantity, dec!(0.2));
        assert_eq!(pos.entry_price, dec!(45000));
        assert_eq!(pos.cost, dec!(9000));
    }

    #[test]
    fn daily_loss_resets_on_rollover() {
        let mut acct = account();
        let day1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        acct.record_daily_loss(day1, dec!(300));
        acct.record_daily_loss(day1, dec!(250));
        assert_eq!(acct.daily_loss.loss, dec!(550));
        assert!(acct.daily_loss_exceeded(day1, dec!(5)));
        assert!(!acct.daily_loss_exceeded(day2, dec!(5)));

        acct.record_daily_loss(day2, dec!(10));
        assert_eq!(acct.daily_loss.loss, dec!(10));
    }

    #[test]
    fn funding_flows_update_ledgers() {
        let mut acct = account();
        acct.open_long(
            "BTCUSDT",
            dec!(0.1),
            dec!(50000),
            Decimal::ZERO,
            dec!(48500),
            dec!(53000),
            t0(),
            Vec::new(),
        )
        .unwrap();
        // long pays positive funding: cash flow is negative
        acct.apply_funding("BTCUSDT", dec!(-0.5), 1_700_000_400_000);
        assert_eq!(acct.usdt, dec!(4999.5));
        assert_eq!(acct.funding_paid_by_symbol["BTCUSDT"], dec!(0.5));
        let pos = acct.position("BTCUSDT").unwrap();
        assert_eq!(pos.total_funding_paid, dec!(0.5));
        assert_eq!(pos.last_funding_ts, Some(1_700_000_400_000));
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("paper-default.json");
        let mut acct = account();
        acct.open_long(
            "BTCUSDT",
            dec!(0.1),
            dec!(50000),
            dec!(2),
            dec!(48500),
            dec!(53000),
            t0(),
            vec!["ma_bullish".to_string()],
        )
        .unwrap();
        acct.save(&path).unwrap();

        let loaded = Account::load_or_new(&path, dec!(1), t0());
        assert_eq!(loaded.usdt, acct.usdt);
        assert_eq!(loaded.positions.len(), 1);
        assert_eq!(
            loaded.position("BTCUSDT").unwrap().signal_conditions,
            vec!["ma_bullish".to_string()]
        );

        // corrupt snapshot starts fresh
        std::fs::write(&path, b"]broken").unwrap();
        let fresh = Account::load_or_new(&path, dec!(777), t0());
        assert_eq!(fresh.usdt, dec!(777));
    }
}
