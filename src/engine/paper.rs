use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::notifications::{force_exit as force_exit_alert, position_closed, Notifier};
use crate::risk::{resolve_new_stop_loss, should_confirm_exit};
use crate::storage::JsonlAppender;
use crate::strategies::{Strategy, StrategyContext, StrategyRegistry};
use crate::indicators::compute_snapshot;
use crate::types::{
    Candle, ExitReason, FillEvent, PositionSide, SignalKind, Trade, TradeSide,
};

use super::{
    effective_fill_price, price_exit_trigger, update_trailing_stop, Account,
};

/// Paper counterpart of the live executor: the same exit-decision logic
/// applied to the in-memory account, with per-scenario snapshot
/// persistence and a JSONL fill history for the drift analyzer. Under
/// identical inputs and friction parameters its position arithmetic
/// matches the backtest engine exactly.
pub struct PaperEngine {
    config: Config,
    strategy: Arc<dyn Strategy>,
    account: Account,
    snapshot_path: PathBuf,
    fills: JsonlAppender,
}

impl PaperEngine {
    pub fn new(
        config: Config,
        data_dir: &Path,
        registry: Arc<StrategyRegistry>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if let Err(errors) = config.validate() {
            return Err(anyhow!("invalid configuration: {}", errors.join("; ")));
        }
        let strategy = registry
            .resolve(&config)
            .map_err(|err| anyhow!("cannot start paper engine: {err}"))?;

        let scenario = &config.paper.scenario_id;
        let snapshot_path = data_dir.join(format!("paper-{scenario}.json"));
        let fills = JsonlAppender::new(
            data_dir
                .join("logs")
                .join(format!("fills-{scenario}.jsonl")),
        );
        let account = Account::load_or_new(&snapshot_path, config.paper.initial_usdt, now);
        info!(%scenario, usdt = %account.usdt, "paper engine ready");

        Ok(Self {
            config,
            strategy,
            account,
            snapshot_path,
            fills,
        })
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn account_mut(&mut self) -> &mut Account {
        &mut self.account
    }

    pub fn save(&self) -> Result<()> {
        self.account.save(&self.snapshot_path)
    }

    fn fill_price(&self, raw: Decimal, side: PositionSide, entry: bool) -> Decimal {
        effective_fill_price(
            raw,
            side,
            entry,
            self.config.paper.slippage_percent,
            self.config.risk.spread_bps,
        )
    }

    fn record_fill(&self, symbol: &str, side: TradeSide, raw: Decimal, fill: Decimal, qty: Decimal, now: DateTime<Utc>) {
        let event = FillEvent {
            symbol: symbol.to_string(),
            side,
            fill_price: fill,
            quantity: qty,
            slippage_per_unit: (fill - raw).abs(),
            timestamp: now,
        };
        if let Err(err) = self.fills.append(&event) {
            warn!(%symbol, %err, "failed to append fill event");
        }
    }

    /// Simulated entry fill at the current close.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_entry(
        &mut self,
        symbol: &str,
        signal: SignalKind,
        notional_usdt: Decimal,
        close: Decimal,
        stop_loss_percent: Decimal,
        take_profit_percent: Decimal,
        conditions: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let side = match signal {
            SignalKind::Buy => PositionSide::Long,
            SignalKind::Short => PositionSide::Short,
            _ => return Err(anyhow!("not an entry signal: {signal}")),
        };
        if notional_usdt < self.config.execution.min_order_usdt {
            return Err(anyhow!("order below min_order_usdt"));
        }

        let exec_price = self.fill_price(close, side, true);
        let quantity = notional_usdt / exec_price;
        let fee = notional_usdt * self.config.paper.fee_rate;
        let sl_fraction = stop_loss_percent / dec!(100);
        let tp_fraction = take_profit_percent / dec!(100);
        let (stop_loss, take_profit) = match side {
            PositionSide::Long => (
                exec_price * (Decimal::ONE - sl_fraction),
                exec_price * (Decimal::ONE + tp_fraction),
            ),
            PositionSide::Short => (
                exec_price * (Decimal::ONE + sl_fraction),
                exec_price * (Decimal::ONE - tp_fraction),
            ),
        };

        match side {
            PositionSide::Long => self.account.open_long(
                symbol, quantity, exec_price, fee, stop_loss, take_profit, now, conditions,
            )?,
            PositionSide::Short => self.account.open_short(
                symbol, quantity, exec_price, fee, stop_loss, take_profit, now, conditions,
            )?,
        }
        let entry_side = match side {
            PositionSide::Long => TradeSide::Buy,
            PositionSide::Short => TradeSide::Short,
        };
        self.record_fill(symbol, entry_side, close, exec_price, quantity, now);
        self.save()?;
        Ok(())
    }

    /// Run the shared exit-decision cascade for one symbol against its
    /// freshest candle window. Returns the closed trade when an exit
    /// fired and survived confirm-exit.
    pub fn check_exits(
        &mut self,
        symbol: &str,
        window: &[Candle],
        now: DateTime<Utc>,
    ) -> Result<Option<Trade>> {
        let Some(candle) = window.last() else {
            return Ok(None);
        };
        if self.account.position(symbol).is_none() {
            return Ok(None);
        }
        let snapshot = compute_snapshot(window, &self.config.strategy);

        // Strategy exit hook first, routed through confirm-exit.
        if let Some(snapshot) = &snapshot {
            let pos = self.account.position(symbol).expect("checked above").clone();
            let ctx = StrategyContext {
                symbol,
                candles: window,
                indicators: snapshot,
                params: &self.config.strategy,
                signals: &self.config.signals,
                position_side: Some(pos.side),
            };
            if let Some(request) = self.strategy.should_exit(&pos, &ctx) {
                let confirmation = should_confirm_exit(
                    &pos,
                    ExitReason::Signal,
                    pos.profit_ratio(candle.close),
                    self.config.execution.max_exit_price_deviation,
                    Some(self.strategy.as_ref()),
                    Some(&ctx),
                );
                if confirmation.confirmed {
                    debug!(%symbol, reason = %request.reason, "paper strategy exit");
                    return self.close_at(symbol, candle.close, now, ExitReason::Signal).map(Some);
                }
            }
        }

        // Trailing update and stop resolution, identical to the backtest.
        {
            let risk = self.config.risk.clone();
            let pos = self.account.position_mut(symbol).expect("checked above");
            update_trailing_stop(pos, candle.high, candle.low, &risk);
        }
        {
            let pos = self.account.position(symbol).expect("checked above").clone();
            let new_stop = match &snapshot {
                Some(snapshot) => {
                    let ctx = StrategyContext {
                        symbol,
                        candles: window,
                        indicators: snapshot,
                        params: &self.config.strategy,
                        signals: &self.config.signals,
                        position_side: Some(pos.side),
                    };
                    resolve_new_stop_loss(
                        &pos,
                        candle.close,
                        Some(self.strategy.as_ref()),
                        Some(&ctx),
                        &self.config.risk,
                    )
                }
                None => resolve_new_stop_loss(&pos, candle.close, None, None, &self.config.risk),
            };
            if let Some(stop) = new_stop {
                self.account
                    .position_mut(symbol)
                    .expect("checked above")
                    .stop_loss = stop;
            }
        }

        let pos = self.account.position(symbol).expect("checked above").clone();
        let Some(trigger) = price_exit_trigger(&pos, candle, now, &self.config.risk, true) else {
            return Ok(None);
        };
        let confirmation = should_confirm_exit(
            &pos,
            trigger.reason,
            pos.profit_ratio(trigger.price),
            self.config.execution.max_exit_price_deviation,
            Some(self.strategy.as_ref()),
            None,
        );
        if !confirmation.confirmed {
            debug!(%symbol, reason = %trigger.reason, veto = ?confirmation.reason, "paper exit vetoed");
            return Ok(None);
        }
        self.close_at(symbol, trigger.price, now, trigger.reason).map(Some)
    }

    /// Close on a sell/cover signal at the current close, honouring the
    /// confirm-exit veto.
    pub fn close_signal_exit(
        &mut self,
        symbol: &str,
        close: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<Trade>> {
        let Some(pos) = self.account.position(symbol).cloned() else {
            return Ok(None);
        };
        let confirmation = should_confirm_exit(
            &pos,
            ExitReason::Signal,
            pos.profit_ratio(close),
            self.config.execution.max_exit_price_deviation,
            Some(self.strategy.as_ref()),
            None,
        );
        if !confirmation.confirmed {
            debug!(%symbol, veto = ?confirmation.reason, "signal exit vetoed");
            return Ok(None);
        }
        self.close_at(symbol, close, now, ExitReason::Signal).map(Some)
    }

    fn close_at(
        &mut self,
        symbol: &str,
        raw_price: Decimal,
        now: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<Trade> {
        let pos = self
            .account
            .position(symbol)
            .ok_or_else(|| anyhow!("no position to close for {symbol}"))?;
        let side = pos.side;
        let quantity = pos.quantity;

        let exec_price = self.fill_price(raw_price, side, false);
        let fee = quantity * exec_price * self.config.paper.fee_rate;
        let trade = self
            .account
            .close_position(symbol, exec_price, fee, now, reason)?;
        self.strategy.on_trade_closed(&trade);

        let exit_side = match side {
            PositionSide::Long => TradeSide::Sell,
            PositionSide::Short => TradeSide::Cover,
        };
        self.record_fill(symbol, exit_side, raw_price, exec_price, quantity, now);
        self.save()?;
        Ok(trade)
    }

    /// Same semantics as the live force exit: the position is removed
    /// unconditionally and the trade is stamped with the force reason.
    pub async fn force_exit(
        &mut self,
        symbol: &str,
        mark_price: Decimal,
        reason: ExitReason,
        now: DateTime<Utc>,
        notifier: &dyn Notifier,
    ) -> Result<Option<Trade>> {
        debug_assert!(reason.is_force_exit());
        if self.account.position(symbol).is_none() {
            return Ok(None);
        }
        let trade = self.close_at(symbol, mark_price, now, reason)?;
        notifier.notify(force_exit_alert(symbol, reason, true)).await;
        notifier
            .notify(position_closed(
                symbol,
                trade.pnl,
                trade.pnl_percent * dec!(100),
                reason,
            ))
            .await;
        Ok(Some(trade))
    }

    /// Count a simulated exit-order timeout; the third strike force-exits
    /// the position, mirroring the live escalation.
    pub async fn record_exit_timeout(
        &mut self,
        symbol: &str,
        mark_price: Decimal,
        now: DateTime<Utc>,
        notifier: &dyn Notifier,
    ) -> Result<Option<Trade>> {
        let strikes = {
            let Some(pos) = self.account.position_mut(symbol) else {
                return Ok(None);
            };
            pos.exit_timeout_count += 1;
            pos.exit_timeout_count
        };
        if strikes >= 3 {
            return self
                .force_exit(symbol, mark_price, ExitReason::ForceExitTimeout, now, notifier)
                .await;
        }
        self.save()?;
        Ok(None)
    }
}
