use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::exchange::{Broker, BrokerOrderStatus};
use crate::notifications::{force_exit as force_exit_alert, position_opened, Alert, Notifier};
use crate::risk::RejectionLog;
use crate::types::{ExitReason, PositionSide, SignalKind};

use super::Account;

/// Exit-order timeouts escalate to a force exit on the third strike.
const FORCE_EXIT_TIMEOUT_STRIKES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPurpose {
    Entry,
    Exit,
}

/// A broker order the executor is still waiting on.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub symbol: String,
    pub order_id: String,
    pub side: PositionSide,
    pub purpose: OrderPurpose,
    pub quantity: Decimal,
    pub placed_at: DateTime<Utc>,
}

/// Live-execution state machine around broker calls: entries, native
/// stop-loss placement and sync, order-timeout escalation, and the
/// force-exit recovery path. Broker failures are contained here and
/// never reach the decision layer.
pub struct LiveExecutor {
    broker: Arc<dyn Broker>,
    notifier: Arc<dyn Notifier>,
    config: Config,
    pending_orders: Vec<PendingOrder>,
    rejection_log: RejectionLog,
}

impl LiveExecutor {
    pub fn new(broker: Arc<dyn Broker>, notifier: Arc<dyn Notifier>, config: Config) -> Self {
        Self {
            broker,
            notifier,
            config,
            pending_orders: Vec::new(),
            rejection_log: RejectionLog::new(),
        }
    }

    pub fn pending_orders(&self) -> &[PendingOrder] {
        &self.pending_orders
    }

    pub fn track_order(&mut self, order: PendingOrder) {
        self.pending_orders.push(order);
    }

    pub fn rejection_log_mut(&mut self) -> &mut RejectionLog {
        &mut self.rejection_log
    }

    /// Market entry: fill, book the position, then arm the native stop.
    #[allow(clippy::too_many_arguments)]
    pub async fn open_entry(
        &mut self,
        account: &mut Account,
        symbol: &str,
        signal: SignalKind,
        notional_usdt: Decimal,
        mark_price: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        conditions: Vec<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let side = match signal {
            SignalKind::Buy => PositionSide::Long,
            SignalKind::Short => PositionSide::Short,
            _ => return false,
        };
        if mark_price.is_zero() {
            warn!(%symbol, "no mark price, entry skipped");
            return false;
        }

        let report = match side {
            PositionSide::Long => self.broker.market_buy(symbol, notional_usdt).await,
            PositionSide::Short => {
                let qty = notional_usdt / mark_price;
                self.broker.market_sell(symbol, qty).await
            }
        };
        let report = match report {
            Ok(report) if report.executed_qty > Decimal::ZERO => report,
            Ok(_) => {
                warn!(%symbol, "entry order reported zero fill, discarding");
                return false;
            }
            Err(err) => {
                warn!(%symbol, %err, "entry order failed");
                return false;
            }
        };

        let entry_price = if report.avg_price > Decimal::ZERO {
            report.avg_price
        } else {
            mark_price
        };
        let fee = report.executed_qty * entry_price * self.config.paper.fee_rate;

        let booked = match side {
            PositionSide::Long => account.open_long(
                symbol,
                report.executed_qty,
                entry_price,
                fee,
                stop_loss,
                take_profit,
                now,
                conditions,
            ),
            PositionSide::Short => account.open_short(
                symbol,
                report.executed_qty,
                entry_price,
                fee,
                stop_loss,
                take_profit,
                now,
                conditions,
            ),
        };
        if let Err(err) = booked {
            error!(%symbol, %err, "fill could not be booked locally");
            return false;
        }

        info!(%symbol, %side, qty = %report.executed_qty, %entry_price, "live entry filled");
        self.notifier
            .notify(position_opened(
                symbol,
                side.as_str(),
                report.executed_qty,
                entry_price,
            ))
            .await;

        // Exchange-native protection; a failed placement leaves the
        // position unprotected until the next tick retries.
        if let Some(order_id) = self
            .place_exchange_stop_loss(symbol, side, report.executed_qty, stop_loss)
            .await
        {
            if let Some(pos) = account.position_mut(symbol) {
                pos.exchange_sl_order_id = Some(order_id);
                pos.exchange_sl_price = Some(stop_loss);
            }
        }
        true
    }

    /// Place a native stop order. Returns the broker id, or None on any
    /// failure; never propagates.
    pub async fn place_exchange_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        qty: Decimal,
        stop_price: Decimal,
    ) -> Option<String> {
        let order_side = side.closing_order_side();
        match self
            .broker
            .place_stop_loss_order(symbol, order_side, qty, stop_price)
            .await
        {
            Ok(order_id) => {
                debug!(%symbol, %order_id, %stop_price, "native stop placed");
                Some(order_id)
            }
            Err(err) => {
                warn!(%symbol, %err, "native stop placement failed");
                None
            }
        }
    }

    /// Cancel a native stop; a failed cancel (often already gone) only
    /// warns.
    pub async fn cancel_exchange_stop_loss(&self, symbol: &str, order_id: &str) {
        if let Err(err) = self.broker.cancel_order(symbol, order_id).await {
            warn!(%symbol, %order_id, %err, "native stop cancel failed");
        }
    }

    /// Poll every resting native stop and reconcile local state with what
    /// the broker reports. Errors never propagate.
    pub async fn sync_exchange_stop_losses(&self, account: &mut Account, now: DateTime<Utc>) {
        let tracked: Vec<(String, String)> = account
            .positions
            .iter()
            .filter_map(|(symbol, pos)| {
                pos.exchange_sl_order_id
                    .clone()
                    .map(|id| (symbol.clone(), id))
            })
            .collect();

        for (symbol, order_id) in tracked {
            let order = match self.broker.get_order(&symbol, &order_id).await {
                Ok(order) => order,
                Err(err) => {
                    warn!(%symbol, %order_id, %err, "native stop poll failed");
                    continue;
                }
            };
            match order.status {
                BrokerOrderStatus::Filled => {
                    let fill_price = order.average_fill_price().or_else(|| {
                        account
                            .position(&symbol)
                            .and_then(|p| p.exchange_sl_price)
                    });
                    let Some(fill_price) = fill_price else {
                        warn!(%symbol, "stop filled but no price known, skipping sync");
                        continue;
                    };
                    let fee = order.executed_qty * fill_price * self.config.paper.fee_rate;
                    match account.close_position(
                        &symbol,
                        fill_price,
                        fee,
                        now,
                        ExitReason::StopLoss,
                    ) {
                        Ok(trade) => {
                            info!(%symbol, pnl = %trade.pnl, "native stop filled on exchange");
                            self.notifier
                                .notify(Alert::StopLossTriggered {
                                    symbol: symbol.clone(),
                                    price: fill_price.to_string(),
                                    pnl: trade.pnl.to_string(),
                                })
                                .await;
                        }
                        Err(err) => error!(%symbol, %err, "failed to book native stop fill"),
                    }
                }
                BrokerOrderStatus::Canceled | BrokerOrderStatus::Expired => {
                    // Broker inconsistency: position believed open but its
                    // protection is gone. Keep the position; clearing the
                    // id lets the next tick re-place the stop.
                    warn!(%symbol, %order_id, "native stop canceled while position open");
                    if let Some(pos) = account.position_mut(&symbol) {
                        pos.exchange_sl_order_id = None;
                        pos.exchange_sl_price = None;
                    }
                }
                BrokerOrderStatus::New
                | BrokerOrderStatus::PartiallyFilled
                | BrokerOrderStatus::Rejected => {}
            }
        }
    }

    /// Walk pending orders past their timeout. Entry timeouts cancel and
    /// discard the would-be position; the third consecutive exit timeout
    /// triggers the force-exit path.
    pub async fn check_order_timeouts(
        &mut self,
        account: &mut Account,
        marks: &HashMap<String, Decimal>,
        now: DateTime<Utc>,
    ) {
        let timeout_ms = self.config.execution.limit_order_timeout_seconds as i64 * 1000;
        let pending = std::mem::take(&mut self.pending_orders);
        let mut kept = Vec::with_capacity(pending.len());

        for order in pending {
            let age_ms = (now - order.placed_at).num_milliseconds();
            if age_ms < timeout_ms {
                kept.push(order);
                continue;
            }

            // Timed out per local clock; only act when the broker agrees
            // the order is still resting.
            let still_open = match self.broker.get_order(&order.symbol, &order.order_id).await {
                Ok(broker_order) => !broker_order.status.is_final(),
                Err(err) => {
                    warn!(symbol = %order.symbol, %err, "order poll failed, keeping tracked");
                    kept.push(order);
                    continue;
                }
            };
            if !still_open {
                continue;
            }

            warn!(symbol = %order.symbol, order_id = %order.order_id, purpose = ?order.purpose, "order timed out");
            if let Err(err) = self.broker.cancel_order(&order.symbol, &order.order_id).await {
                warn!(symbol = %order.symbol, %err, "cancel of timed-out order failed");
            }

            match order.purpose {
                OrderPurpose::Entry => {
                    debug!(symbol = %order.symbol, "entry order discarded after timeout");
                }
                OrderPurpose::Exit => {
                    let strikes = {
                        let Some(pos) = account.position_mut(&order.symbol) else {
                            continue;
                        };
                        pos.exit_timeout_count += 1;
                        pos.exit_timeout_count
                    };
                    self.notifier
                        .notify(Alert::ExitOrderTimeout {
                            symbol: order.symbol.clone(),
                            timeout_count: strikes,
                        })
                        .await;
                    if strikes >= FORCE_EXIT_TIMEOUT_STRIKES {
                        let mark = marks
                            .get(&order.symbol)
                            .copied()
                            .unwrap_or(Decimal::ZERO);
                        self.force_exit(
                            account,
                            &order.symbol,
                            mark,
                            ExitReason::ForceExitTimeout,
                            now,
                        )
                        .await;
                    }
                }
            }
        }
        self.pending_orders = kept;
    }

    /// Market exit for a signal or take-profit decision. A failed close
    /// counts as an exit-order timeout strike; the third strike escalates
    /// to the force-exit path.
    pub async fn execute_exit(
        &mut self,
        account: &mut Account,
        symbol: &str,
        mark_price: Decimal,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) {
        let Some(pos) = account.position(symbol).cloned() else {
            return;
        };

        if let Some(order_id) = &pos.exchange_sl_order_id {
            self.cancel_exchange_stop_loss(symbol, order_id).await;
            if let Some(live) = account.position_mut(symbol) {
                live.exchange_sl_order_id = None;
                live.exchange_sl_price = None;
            }
        }

        let close_result = match pos.side {
            PositionSide::Long => self.broker.market_sell(symbol, pos.quantity).await,
            PositionSide::Short => self.broker.market_buy_by_qty(symbol, pos.quantity).await,
        };

        match close_result {
            Ok(report) if report.executed_qty > Decimal::ZERO => {
                let exit_price = if report.avg_price > Decimal::ZERO {
                    report.avg_price
                } else {
                    mark_price
                };
                let fee = report.executed_qty * exit_price * self.config.paper.fee_rate;
                match account.close_position(symbol, exit_price, fee, now, reason) {
                    Ok(trade) => {
                        info!(%symbol, reason = %reason, pnl = %trade.pnl, "live exit filled");
                        self.notifier
                            .notify(Alert::PositionClosed {
                                symbol: symbol.to_string(),
                                pnl: trade.pnl.to_string(),
                                pnl_percent: trade.pnl_percent.to_string(),
                                reason: reason.to_string(),
                            })
                            .await;
                    }
                    Err(err) => error!(%symbol, %err, "exit fill could not be booked"),
                }
            }
            other => {
                if let Err(err) = other {
                    warn!(%symbol, %err, "exit order failed");
                } else {
                    warn!(%symbol, "exit order reported zero fill");
                }
                let strikes = {
                    let Some(live) = account.position_mut(symbol) else {
                        return;
                    };
                    live.exit_timeout_count += 1;
                    live.exit_timeout_count
                };
                self.notifier
                    .notify(Alert::ExitOrderTimeout {
                        symbol: symbol.to_string(),
                        timeout_count: strikes,
                    })
                    .await;
                if strikes >= FORCE_EXIT_TIMEOUT_STRIKES {
                    self.force_exit(account, symbol, mark_price, ExitReason::ForceExitTimeout, now)
                        .await;
                }
            }
        }
    }

    /// Last-resort close: cancel the native stop best-effort, fire a
    /// closing market order, and remove the position locally whether or
    /// not the order succeeded. Residual local state is worse than a
    /// notional trade record.
    pub async fn force_exit(
        &mut self,
        account: &mut Account,
        symbol: &str,
        mark_price: Decimal,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) {
        debug_assert!(reason.is_force_exit());
        let Some(pos) = account.position(symbol).cloned() else {
            warn!(%symbol, "force exit requested but no position held");
            return;
        };

        if let Some(order_id) = &pos.exchange_sl_order_id {
            self.cancel_exchange_stop_loss(symbol, order_id).await;
        }

        let close_result = match pos.side {
            PositionSide::Long => self.broker.market_sell(symbol, pos.quantity).await,
            PositionSide::Short => self.broker.market_buy_by_qty(symbol, pos.quantity).await,
        };

        let (exit_price, order_placed) = match &close_result {
            Ok(report) if report.avg_price > Decimal::ZERO => (report.avg_price, true),
            Ok(_) => (
                if mark_price > Decimal::ZERO {
                    mark_price
                } else {
                    pos.entry_price
                },
                true,
            ),
            Err(err) => {
                error!(%symbol, %err, "force-exit market order failed, removing position anyway");
                (
                    if mark_price > Decimal::ZERO {
                        mark_price
                    } else {
                        pos.entry_price
                    },
                    false,
                )
            }
        };

        let fee = pos.quantity * exit_price * self.config.paper.fee_rate;
        match account.close_position(symbol, exit_price, fee, now, reason) {
            Ok(trade) => {
                info!(%symbol, reason = %reason, pnl = %trade.pnl, order_placed, "force exit completed");
            }
            Err(err) => error!(%symbol, %err, "force exit could not remove position"),
        }
        self.pending_orders.retain(|o| o.symbol != symbol);
        self.notifier
            .notify(force_exit_alert(symbol, reason, order_placed))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{BrokerOrder, ExecutionReport, MockBroker, OrderFill};
    use crate::notifications::NoopNotifier;
    use chrono::TimeZone;
    use mockall::predicate::eq;
    use rust_decimal_macros::dec;

    fn t(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(seconds * 1000).unwrap()
    }

    fn account_with_long(symbol: &str) -> Account {
        let mut account = Account::new(dec!(10000), t(0));
        account
            .open_long(
                symbol,
                dec!(0.1),
                dec!(50000),
                Decimal::ZERO,
                dec!(48000),
                dec!(55000),
                t(0),
                Vec::new(),
            )
            .unwrap();
        account
    }

    fn executor(broker: MockBroker) -> LiveExecutor {
        LiveExecutor::new(Arc::new(broker), Arc::new(NoopNotifier), Config::default())
    }

    fn resting_order(order_id: &str) -> BrokerOrder {
        BrokerOrder {
            order_id: order_id.to_string(),
            status: BrokerOrderStatus::New,
            executed_qty: Decimal::ZERO,
            fills: Vec::new(),
        }
    }

    #[tokio::test]
    async fn force_exit_removes_position_even_when_order_fails() {
        let mut broker = MockBroker::new();
        broker
            .expect_market_sell()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("exchange down")));
        let mut executor = executor(broker);
        let mut account = account_with_long("BTCUSDT");

        executor
            .force_exit(
                &mut account,
                "BTCUSDT",
                dec!(49000),
                ExitReason::ForceExit,
                t(100),
            )
            .await;

        assert!(account.position("BTCUSDT").is_none());
        assert_eq!(account.trades.len(), 1);
        let trade = &account.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::ForceExit);
        // exit price approximated from the last observed close
        assert_eq!(trade.exit_price, dec!(49000));
    }

    #[tokio::test]
    async fn third_exit_timeout_escalates_to_force_exit_once() {
        let mut broker = MockBroker::new();
        broker
            .expect_get_order()
            .with(eq("BTCUSDT"), eq("exit-1"))
            .times(1)
            .returning(|_, order_id| Ok(resting_order(order_id)));
        broker
            .expect_cancel_order()
            .with(eq("BTCUSDT"), eq("exit-1"))
            .times(1)
            .returning(|_, _| Ok(()));
        // the force-exit market order fires exactly once and succeeds
        broker
            .expect_market_sell()
            .with(eq("BTCUSDT"), eq(dec!(0.1)))
            .times(1)
            .returning(|_, qty| {
                Ok(ExecutionReport {
                    order_id: "fx-1".to_string(),
                    executed_qty: qty,
                    avg_price: dec!(48800),
                })
            });

        let mut executor = executor(broker);
        let mut account = account_with_long("BTCUSDT");
        account.position_mut("BTCUSDT").unwrap().exit_timeout_count = 2;

        executor.track_order(PendingOrder {
            symbol: "BTCUSDT".to_string(),
            order_id: "exit-1".to_string(),
            side: PositionSide::Long,
            purpose: OrderPurpose::Exit,
            quantity: dec!(0.1),
            placed_at: t(0),
        });

        let mut marks = HashMap::new();
        marks.insert("BTCUSDT".to_string(), dec!(48900));
        // default timeout is 30s; poll at t=120s
        executor
            .check_order_timeouts(&mut account, &marks, t(120))
            .await;

        assert!(account.position("BTCUSDT").is_none());
        assert!(executor.pending_orders().is_empty());
        assert_eq!(account.trades.len(), 1);
        assert_eq!(account.trades[0].exit_reason, ExitReason::ForceExitTimeout);
        assert_eq!(account.trades[0].exit_price, dec!(48800));
    }

    #[tokio::test]
    async fn first_exit_timeout_only_increments_counter() {
        let mut broker = MockBroker::new();
        broker
            .expect_get_order()
            .times(1)
            .returning(|_, order_id| Ok(resting_order(order_id)));
        broker
            .expect_cancel_order()
            .times(1)
            .returning(|_, _| Ok(()));

        let mut executor = executor(broker);
        let mut account = account_with_long("BTCUSDT");
        executor.track_order(PendingOrder {
            symbol: "BTCUSDT".to_string(),
            order_id: "exit-1".to_string(),
            side: PositionSide::Long,
            purpose: OrderPurpose::Exit,
            quantity: dec!(0.1),
            placed_at: t(0),
        });

        executor
            .check_order_timeouts(&mut account, &HashMap::new(), t(120))
            .await;

        let pos = account.position("BTCUSDT").unwrap();
        assert_eq!(pos.exit_timeout_count, 1);
        assert!(account.trades.is_empty());
    }

    #[tokio::test]
    async fn entry_timeout_cancels_without_touching_positions() {
        let mut broker = MockBroker::new();
        broker
            .expect_get_order()
            .times(1)
            .returning(|_, order_id| Ok(resting_order(order_id)));
        broker
            .expect_cancel_order()
            .times(1)
            .returning(|_, _| Ok(()));

        let mut executor = executor(broker);
        let mut account = Account::new(dec!(10000), t(0));
        executor.track_order(PendingOrder {
            symbol: "ETHUSDT".to_string(),
            order_id: "entry-1".to_string(),
            side: PositionSide::Long,
            purpose: OrderPurpose::Entry,
            quantity: dec!(1),
            placed_at: t(0),
        });

        executor
            .check_order_timeouts(&mut account, &HashMap::new(), t(120))
            .await;

        assert!(executor.pending_orders().is_empty());
        assert!(account.positions.is_empty());
        assert!(account.trades.is_empty());
    }

    #[tokio::test]
    async fn repeated_exit_failures_escalate_to_force_exit() {
        let mut broker = MockBroker::new();
        // three failed signal exits plus the final force-exit attempt
        broker
            .expect_market_sell()
            .times(4)
            .returning(|_, _| Err(anyhow::anyhow!("timeout")));
        let mut executor = executor(broker);
        let mut account = account_with_long("BTCUSDT");

        for i in 0..3 {
            executor
                .execute_exit(
                    &mut account,
                    "BTCUSDT",
                    dec!(49500),
                    ExitReason::Signal,
                    t(10 + i),
                )
                .await;
        }

        // removed on the third strike despite every order failing
        assert!(account.position("BTCUSDT").is_none());
        assert_eq!(account.trades.len(), 1);
        assert_eq!(account.trades[0].exit_reason, ExitReason::ForceExitTimeout);
    }

    #[tokio::test]
    async fn sync_closes_position_on_native_stop_fill() {
        let mut broker = MockBroker::new();
        broker
            .expect_get_order()
            .with(eq("BTCUSDT"), eq("sl-1"))
            .times(1)
            .returning(|_, _| {
                Ok(BrokerOrder {
                    order_id: "sl-1".to_string(),
                    status: BrokerOrderStatus::Filled,
                    executed_qty: dec!(0.1),
                    fills: vec![OrderFill {
                        price: dec!(47990),
                        qty: dec!(0.1),
                        commission: Decimal::ZERO,
                    }],
                })
            });

        let executor = executor(broker);
        let mut account = account_with_long("BTCUSDT");
        {
            let pos = account.position_mut("BTCUSDT").unwrap();
            pos.exchange_sl_order_id = Some("sl-1".to_string());
            pos.exchange_sl_price = Some(dec!(48000));
        }

        executor.sync_exchange_stop_losses(&mut account, t(60)).await;

        assert!(account.position("BTCUSDT").is_none());
        assert_eq!(account.trades.len(), 1);
        let trade = &account.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert_eq!(trade.exit_price, dec!(47990));
    }

    #[tokio::test]
    async fn sync_keeps_position_when_stop_was_canceled() {
        let mut broker = MockBroker::new();
        broker
            .expect_get_order()
            .times(1)
            .returning(|_, _| {
                Ok(BrokerOrder {
                    order_id: "sl-1".to_string(),
                    status: BrokerOrderStatus::Canceled,
                    executed_qty: Decimal::ZERO,
                    fills: Vec::new(),
                })
            });

        let executor = executor(broker);
        let mut account = account_with_long("BTCUSDT");
        account.position_mut("BTCUSDT").unwrap().exchange_sl_order_id = Some("sl-1".to_string());

        executor.sync_exchange_stop_losses(&mut account, t(60)).await;

        // orphaned but kept; id cleared so the next tick re-arms it
        let pos = account.position("BTCUSDT").unwrap();
        assert!(pos.exchange_sl_order_id.is_none());
        assert!(account.trades.is_empty());
    }

    #[tokio::test]
    async fn entry_failure_leaves_no_state_behind() {
        let mut broker = MockBroker::new();
        broker
            .expect_market_buy()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("rate limited")));

        let mut executor = executor(broker);
        let mut account = Account::new(dec!(10000), t(0));

        let opened = executor
            .open_entry(
                &mut account,
                "BTCUSDT",
                SignalKind::Buy,
                dec!(2000),
                dec!(50000),
                dec!(48000),
                dec!(55000),
                Vec::new(),
                t(10),
            )
            .await;

        assert!(!opened);
        assert!(account.positions.is_empty());
        assert_eq!(account.usdt, dec!(10000));
    }

    #[tokio::test]
    async fn entry_books_position_and_arms_native_stop() {
        let mut broker = MockBroker::new();
        broker
            .expect_market_buy()
            .with(eq("BTCUSDT"), eq(dec!(2000)))
            .times(1)
            .returning(|_, _| {
                Ok(ExecutionReport {
                    order_id: "e-1".to_string(),
                    executed_qty: dec!(0.04),
                    avg_price: dec!(50010),
                })
            });
        broker
            .expect_place_stop_loss_order()
            .withf(|symbol, side, qty, stop| {
                symbol == "BTCUSDT"
                    && *side == crate::types::OrderSide::Sell
                    && *qty == dec!(0.04)
                    && *stop == dec!(48000)
            })
            .times(1)
            .returning(|_, _, _, _| Ok("sl-9".to_string()));

        let mut executor = executor(broker);
        let mut account = Account::new(dec!(10000), t(0));

        let opened = executor
            .open_entry(
                &mut account,
                "BTCUSDT",
                SignalKind::Buy,
                dec!(2000),
                dec!(50000),
                dec!(48000),
                dec!(55000),
                Vec::new(),
                t(10),
            )
            .await;

        assert!(opened);
        let pos = account.position("BTCUSDT").unwrap();
        assert_eq!(pos.entry_price, dec!(50010));
        assert_eq!(pos.exchange_sl_order_id.as_deref(), Some("sl-9"));
        assert_eq!(pos.exchange_sl_price, Some(dec!(48000)));
    }
}
