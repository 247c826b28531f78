use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::engine::{
    effective_fill_price, price_exit_trigger, update_trailing_stop, Account, BacktestReport,
    EquityPoint, MetricsCalculator,
};
use crate::indicators::{compute_snapshot, ema};
use crate::risk::{resolve_new_stop_loss, should_confirm_exit};
use crate::signal::{ExternalContext, SignalEngine};
use crate::strategies::{Strategy, StrategyContext, StrategyRegistry};
use crate::types::{Candle, CandleBuffer, ExitReason, PositionSide, SignalKind};

const FUNDING_INTERVAL_MS: i64 = 8 * 3_600_000;

/// One funding-rate sample from the per-symbol history feed.
#[derive(Debug, Clone, Copy)]
pub struct FundingPoint {
    pub ts: i64,
    /// Fraction per 8h settlement (-0.0001 = -0.01%).
    pub rate: Decimal,
}

/// Simulator knobs independent of the trading config.
#[derive(Clone)]
pub struct BacktestOptions {
    pub initial_usdt: Decimal,
    pub fee_rate: Decimal,
    pub slippage_percent: Decimal,
    /// Evaluate exits against highs/lows; off collapses to closes.
    pub intracandle: bool,
    /// Enable 8h funding accrual.
    pub futures: bool,
    pub avg_funding_rate_per_8h: Option<Decimal>,
    pub funding_history: HashMap<String, Vec<FundingPoint>>,
    /// Higher-timeframe series per symbol for the MTF entry filter.
    pub higher_timeframe: HashMap<String, Vec<Candle>>,
    pub warmup_candles: usize,
}

impl Default for BacktestOptions {
    fn default() -> Self {
        Self {
            initial_usdt: dec!(10000),
            fee_rate: dec!(0.0004),
            slippage_percent: dec!(0.05),
            intracandle: true,
            futures: false,
            avg_funding_rate_per_8h: None,
            funding_history: HashMap::new(),
            higher_timeframe: HashMap::new(),
            warmup_candles: 60,
        }
    }
}

/// Settlement boundaries strictly after `last_ms` up to and including
/// `now_ms`, on the fixed 00:00/08:00/16:00 UTC grid.
pub fn funding_boundaries(last_ms: i64, now_ms: i64) -> Vec<i64> {
    let mut out = Vec::new();
    let mut t = (last_ms.div_euclid(FUNDING_INTERVAL_MS) + 1) * FUNDING_INTERVAL_MS;
    while t <= now_ms {
        out.push(t);
        t += FUNDING_INTERVAL_MS;
    }
    out
}

/// Latest exact-history rate at or before `ts`, else the uniform average,
/// else zero.
fn funding_rate_at(
    history: Option<&Vec<FundingPoint>>,
    avg: Option<Decimal>,
    ts: i64,
) -> Decimal {
    if let Some(points) = history {
        let idx = points.partition_point(|p| p.ts <= ts);
        if idx > 0 {
            return points[idx - 1].rate;
        }
    }
    avg.unwrap_or(Decimal::ZERO)
}

/// Multi-symbol, shared-account simulator. Strictly single-threaded and
/// deterministic: the output is a pure function of candles and config.
pub struct BacktestEngine {
    config: Config,
    options: BacktestOptions,
    signal_engine: SignalEngine,
    strategy: Arc<dyn Strategy>,
    account: Account,
    windows: HashMap<String, CandleBuffer>,
    marks: HashMap<String, Decimal>,
    equity_curve: Vec<EquityPoint>,
    total_fees: Decimal,
    /// Symbols whose position closed at the current tick; re-entry waits
    /// for the next candle.
    exited_at: HashMap<String, i64>,
}

impl BacktestEngine {
    pub fn new(config: Config, options: BacktestOptions) -> Result<Self> {
        Self::with_registry(config, options, Arc::new(StrategyRegistry::with_builtins()))
    }

    /// Startup is the one place configuration errors are fatal: an
    /// invalid config or unknown strategy id refuses to construct.
    pub fn with_registry(
        config: Config,
        options: BacktestOptions,
        registry: Arc<StrategyRegistry>,
    ) -> Result<Self> {
        if let Err(errors) = config.validate() {
            return Err(anyhow!("invalid configuration: {}", errors.join("; ")));
        }
        let strategy = registry
            .resolve(&config)
            .map_err(|err| anyhow!("cannot start backtest: {err}"))?;

        let account = Account::new(
            options.initial_usdt,
            DateTime::<Utc>::from_timestamp_millis(0).expect("epoch"),
        );
        Ok(Self {
            signal_engine: SignalEngine::new(registry),
            strategy,
            account,
            windows: HashMap::new(),
            marks: HashMap::new(),
            equity_curve: Vec::new(),
            total_fees: Decimal::ZERO,
            exited_at: HashMap::new(),
            config,
            options,
        })
    }

    pub fn run(&mut self, data: HashMap<String, Vec<Candle>>) -> Result<BacktestReport> {
        let mut symbols: Vec<String> = data.keys().cloned().collect();
        symbols.sort();
        if symbols.is_empty() {
            return Err(anyhow!("no candle data supplied"));
        }

        for symbol in &symbols {
            self.windows.insert(
                symbol.clone(),
                CandleBuffer::new(self.options.warmup_candles * 2),
            );
        }

        // Timeline: the sorted union of open times across all symbols.
        let mut timeline: BTreeSet<i64> = BTreeSet::new();
        let mut by_time: HashMap<(i64, &str), &Candle> = HashMap::new();
        for symbol in &symbols {
            for candle in &data[symbol] {
                let ts = candle.open_time.timestamp_millis();
                timeline.insert(ts);
                by_time.insert((ts, symbol.as_str()), candle);
            }
        }
        info!(
            symbols = symbols.len(),
            ticks = timeline.len(),
            "backtest timeline built"
        );

        let mut last_close_time: Option<DateTime<Utc>> = None;
        for ts in timeline {
            let now = DateTime::<Utc>::from_timestamp_millis(ts)
                .ok_or_else(|| anyhow!("bad timeline timestamp {ts}"))?;

            // 1. Advance windows.
            for symbol in &symbols {
                if let Some(candle) = by_time.get(&(ts, symbol.as_str())) {
                    self.windows
                        .get_mut(symbol)
                        .expect("window exists per symbol")
                        .push((*candle).clone());
                    self.marks.insert(symbol.clone(), candle.close);
                    last_close_time = Some(candle.close_time.max(now));
                }
            }

            // 2. Funding accrual before any exit can fire.
            if self.options.futures {
                self.settle_funding(&symbols, ts);
            }

            // 3. Exits strictly precede entries at the same timestamp.
            for symbol in &symbols {
                if let Some(candle) = by_time.get(&(ts, symbol.as_str())) {
                    if self.account.position(symbol).is_some() {
                        self.check_exits(symbol, candle, now)?;
                    }
                }
            }

            // 4. Entries.
            for symbol in &symbols {
                if let Some(candle) = by_time.get(&(ts, symbol.as_str())) {
                    if self.account.position(symbol).is_none() {
                        self.try_entry(symbol, candle, now)?;
                    }
                }
            }

            // 5. Equity snapshot.
            let equity = self.account.equity(&self.marks);
            self.equity_curve.push(EquityPoint {
                timestamp: now,
                equity,
            });
        }

        // Force-close whatever is still open at the last observed close.
        let end_time = last_close_time.unwrap_or_else(Utc::now);
        let open_symbols: Vec<String> = self.account.positions.keys().cloned().collect();
        for symbol in open_symbols {
            let price = self.marks.get(&symbol).copied();
            if let Some(price) = price {
                self.close_at(&symbol, price, end_time, ExitReason::EndOfData)?;
            }
        }

        let final_equity = self.account.equity(&self.marks);
        let total_funding: Decimal = self.account.funding_paid_by_symbol.values().copied().sum();
        Ok(MetricsCalculator::calculate(
            self.options.initial_usdt,
            final_equity,
            self.account.trades.clone(),
            std::mem::take(&mut self.equity_curve),
            self.total_fees,
            total_funding,
        ))
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    fn fill_price(&self, raw: Decimal, side: PositionSide, entry: bool) -> Decimal {
        effective_fill_price(
            raw,
            side,
            entry,
            self.options.slippage_percent,
            self.config.risk.spread_bps,
        )
    }

    fn settle_funding(&mut self, symbols: &[String], now_ms: i64) {
        for symbol in symbols {
            let Some(pos) = self.account.position(symbol) else {
                continue;
            };
            let last = pos
                .last_funding_ts
                .unwrap_or_else(|| pos.entry_time.timestamp_millis());
            let side = pos.side;
            let quantity = pos.quantity;
            let mark = self.marks.get(symbol).copied().unwrap_or(pos.entry_price);

            for boundary in funding_boundaries(last, now_ms) {
                let rate = funding_rate_at(
                    self.options.funding_history.get(symbol),
                    self.options.avg_funding_rate_per_8h,
                    boundary,
                );
                let notional = quantity * mark;
                let cash_flow = match side {
                    PositionSide::Short => rate * notional,
                    PositionSide::Long => -rate * notional,
                };
                self.account.apply_funding(symbol, cash_flow, boundary);
            }
        }
    }

    fn check_exits(&mut self, symbol: &str, candle: &Candle, now: DateTime<Utc>) -> Result<()> {
        let window = self.windows[symbol].as_slice().to_vec();
        let snapshot = compute_snapshot(&window, &self.config.strategy);

        // 3a. Strategy exit hook, routed through confirm-exit.
        if let Some(snapshot) = &snapshot {
            let pos = self.account.position(symbol).expect("caller checked").clone();
            let ctx = StrategyContext {
                symbol,
                candles: &window,
                indicators: snapshot,
                params: &self.config.strategy,
                signals: &self.config.signals,
                position_side: Some(pos.side),
            };
            if let Some(request) = self.strategy.should_exit(&pos, &ctx) {
                let profit = pos.profit_ratio(candle.close);
                let confirmation = should_confirm_exit(
                    &pos,
                    ExitReason::Signal,
                    profit,
                    self.config.execution.max_exit_price_deviation,
                    Some(self.strategy.as_ref()),
                    Some(&ctx),
                );
                if confirmation.confirmed {
                    debug!(%symbol, reason = %request.reason, "strategy exit");
                    self.close_at(symbol, candle.close, now, ExitReason::Signal)?;
                    return Ok(());
                }
                debug!(%symbol, veto = ?confirmation.reason, "strategy exit vetoed");
            }
        }

        // 3b. Trailing stop bookkeeping on the candle extremes.
        {
            let risk = self.config.risk.clone();
            let (high, low) = if self.options.intracandle {
                (candle.high, candle.low)
            } else {
                (candle.close, candle.close)
            };
            let pos = self.account.position_mut(symbol).expect("caller checked");
            update_trailing_stop(pos, high, low, &risk);
        }

        // 3c. Break-even / custom stop resolution.
        {
            let pos = self.account.position(symbol).expect("caller checked").clone();
            let new_stop = match &snapshot {
                Some(snapshot) => {
                    let ctx = StrategyContext {
                        symbol,
                        candles: &window,
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
                    .expect("caller checked")
                    .stop_loss = stop;
            }
        }

        // 3d. Intra-candle exit priority.
        let pos = self.account.position(symbol).expect("caller checked").clone();
        let trigger = price_exit_trigger(
            &pos,
            candle,
            now,
            &self.config.risk,
            self.options.intracandle,
        );
        if let Some(trigger) = trigger {
            let profit = pos.profit_ratio(trigger.price);
            let confirmation = match &snapshot {
                Some(snapshot) => {
                    let ctx = StrategyContext {
                        symbol,
                        candles: &window,
                        indicators: snapshot,
                        params: &self.config.strategy,
                        signals: &self.config.signals,
                        position_side: Some(pos.side),
                    };
                    should_confirm_exit(
                        &pos,
                        trigger.reason,
                        profit,
                        self.config.execution.max_exit_price_deviation,
                        Some(self.strategy.as_ref()),
                        Some(&ctx),
                    )
                }
                None => should_confirm_exit(
                    &pos,
                    trigger.reason,
                    profit,
                    self.config.execution.max_exit_price_deviation,
                    None,
                    None,
                ),
            };
            if confirmation.confirmed {
                self.close_at(symbol, trigger.price, now, trigger.reason)?;
            } else {
                debug!(%symbol, reason = %trigger.reason, veto = ?confirmation.reason, "exit vetoed, position persists");
            }
        }
        Ok(())
    }

    fn close_at(
        &mut self,
        symbol: &str,
        raw_price: Decimal,
        now: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<()> {
        let pos = self
            .account
            .position(symbol)
            .ok_or_else(|| anyhow!("no position to close for {symbol}"))?;
        let side = pos.side;
        let quantity = pos.quantity;

        let exec_price = self.fill_price(raw_price, side, false);
        let fee = quantity * exec_price * self.options.fee_rate;
        self.total_fees += fee;
        let trade = self
            .account
            .close_position(symbol, exec_price, fee, now, reason)?;
        self.exited_at
            .insert(symbol.to_string(), now.timestamp_millis());
        self.strategy.on_trade_closed(&trade);
        Ok(())
    }

    /// Higher-timeframe trend gate: entries must agree with the EMA
    /// fast/slow relation on the higher series; absent data passes.
    fn mtf_allows(&self, symbol: &str, kind: SignalKind, now: DateTime<Utc>) -> bool {
        let Some(series) = self.options.higher_timeframe.get(symbol) else {
            return true;
        };
        let closes: Vec<Decimal> = series
            .iter()
            .filter(|c| c.open_time <= now)
            .map(|c| c.close)
            .collect();
        let (Some(fast), Some(slow)) = (
            ema(&closes, self.config.strategy.ma.short),
            ema(&closes, self.config.strategy.ma.long),
        ) else {
            return true;
        };
        match kind {
            SignalKind::Buy => fast > slow,
            SignalKind::Short => fast < slow,
            _ => true,
        }
    }

    fn try_entry(&mut self, symbol: &str, candle: &Candle, now: DateTime<Utc>) -> Result<()> {
        if self.exited_at.get(symbol) == Some(&now.timestamp_millis()) {
            return Ok(());
        }
        if self.account.open_position_count() >= self.config.risk.max_positions {
            return Ok(());
        }
        if self
            .account
            .daily_loss_exceeded(now.date_naive(), self.config.risk.daily_loss_limit_percent)
        {
            return Ok(());
        }

        let window = self.windows[symbol].as_slice().to_vec();
        let held: Vec<(String, &[Candle])> = self
            .account
            .positions
            .keys()
            .filter(|held_symbol| held_symbol.as_str() != symbol)
            .filter_map(|held_symbol| {
                self.windows
                    .get(held_symbol)
                    .map(|buf| (held_symbol.clone(), buf.as_slice()))
            })
            .collect();

        let external = ExternalContext {
            position_side: None,
            held_klines: held,
            ..ExternalContext::default()
        };
        let recent = self.account.recent_trade_records(200);
        let recent_trades = if self.config.protections.any_enabled() {
            Some(recent.as_slice())
        } else {
            None
        };

        let result = self.signal_engine.process_signal(
            symbol,
            &window,
            &self.config,
            &external,
            now,
            recent_trades,
        );

        if result.rejected || !result.signal.is_entry() {
            if let Some(reason) = &result.rejection_reason {
                debug!(%symbol, %reason, "entry not taken");
            }
            return Ok(());
        }
        if !self.mtf_allows(symbol, result.signal, now) {
            debug!(%symbol, signal = %result.signal, "entry blocked by higher timeframe");
            return Ok(());
        }

        let ratio = result
            .effective_position_ratio
            .unwrap_or(result.effective_risk.position_ratio);
        let equity = self.account.equity(&self.marks);
        let notional = equity * ratio;
        if notional < self.config.execution.min_order_usdt {
            debug!(%symbol, %notional, "entry below min order size");
            return Ok(());
        }

        let side = match result.signal {
            SignalKind::Buy => PositionSide::Long,
            SignalKind::Short => PositionSide::Short,
            _ => unreachable!("only entries reach sizing"),
        };
        let exec_price = self.fill_price(candle.close, side, true);
        if exec_price.is_zero() {
            return Ok(());
        }
        let quantity = notional / exec_price;
        let fee = notional * self.options.fee_rate;

        let risk = &result.effective_risk;
        let sl_fraction = risk.stop_loss_percent / dec!(100);
        let tp_fraction = risk.take_profit_percent / dec!(100);
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

        let conditions = match result.signal {
            SignalKind::Buy => self.config.signals.buy.clone(),
            SignalKind::Short => self.config.signals.short.clone(),
            _ => Vec::new(),
        };

        let opened = match side {
            PositionSide::Long => self.account.open_long(
                symbol,
                quantity,
                exec_price,
                fee,
                stop_loss,
                take_profit,
                now,
                conditions,
            ),
            PositionSide::Short => self.account.open_short(
                symbol,
                quantity,
                exec_price,
                fee,
                stop_loss,
                take_profit,
                now,
                conditions,
            ),
        };
        match opened {
            Ok(()) => {
                self.total_fees += fee;
                debug!(%symbol, %side, %quantity, %exec_price, "entry filled");
            }
            Err(err) => debug!(%symbol, %err, "entry skipped"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hourly_candle(i: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            open_time: Utc.timestamp_millis_opt(i * 3_600_000).unwrap(),
            close_time: Utc.timestamp_millis_opt((i + 1) * 3_600_000 - 1).unwrap(),
            open,
            high,
            low,
            close,
            volume: dec!(1000),
        }
    }

    fn frictionless(config: &mut Config) -> BacktestOptions {
        config.strategy.macd.enabled = false;
        BacktestOptions {
            slippage_percent: Decimal::ZERO,
            fee_rate: Decimal::ZERO,
            ..BacktestOptions::default()
        }
    }

    struct AlwaysBuy;

    impl Strategy for AlwaysBuy {
        fn id(&self) -> &str {
            "always-buy"
        }

        fn populate_signal(&self, _ctx: &StrategyContext) -> SignalKind {
            SignalKind::Buy
        }
    }

    #[test]
    fn funding_boundaries_on_8h_grid() {
        // last settled mid-interval, now two boundaries later
        let eight_h = 8 * 3_600_000;
        let bounds = funding_boundaries(eight_h + 100, 3 * eight_h);
        assert_eq!(bounds, vec![2 * eight_h, 3 * eight_h]);
        // boundary exactly at last: excluded
        let bounds = funding_boundaries(eight_h, 2 * eight_h);
        assert_eq!(bounds, vec![2 * eight_h]);
        assert!(funding_boundaries(eight_h, eight_h + 100).is_empty());
    }

    #[test]
    fn steady_rise_without_oversold_rsi_never_buys() {
        let mut config = Config::default();
        config.symbols = vec!["BTCUSDT".to_string()];
        config.strategy.ma.short = 5;
        config.strategy.ma.long = 10;
        config.signals.buy = vec!["ma_bullish".to_string(), "rsi_oversold".to_string()];
        let options = frictionless(&mut config);

        let candles: Vec<Candle> = (0..30)
            .map(|i| {
                let close = Decimal::from(100 + i);
                hourly_candle(i, close - dec!(1), close + dec!(1), close - dec!(2), close)
            })
            .collect();
        let mut data = HashMap::new();
        data.insert("BTCUSDT".to_string(), candles);

        let mut engine = BacktestEngine::new(config, options).unwrap();
        let report = engine.run(data).unwrap();

        // RSI on a monotonic rise never dips below 30: zero trades
        assert_eq!(report.total_trades, 0);
        assert_eq!(report.sharpe_ratio, Decimal::ZERO);
        assert_eq!(report.final_equity, report.initial_usdt);
    }

    #[test]
    fn short_take_profit_fills_at_target() {
        let mut config = Config::default();
        config.symbols = vec!["BTCUSDT".to_string()];
        config.strategy.ma.short = 5;
        config.strategy.ma.long = 10;
        config.signals.buy = Vec::new();
        config.signals.short = vec!["ma_bearish".to_string()];
        config.signals.cover = Vec::new();
        config.risk.take_profit_percent = dec!(10);
        config.risk.stop_loss_percent = dec!(5);
        let options = frictionless(&mut config);

        // flat warmup, then a drop to 95 that flips the MAs bearish, then
        // the crash candle that trades through the 10% take profit
        let mut candles: Vec<Candle> = (0..40)
            .map(|i| hourly_candle(i, dec!(100), dec!(100), dec!(100), dec!(100)))
            .collect();
        candles.push(hourly_candle(40, dec!(100), dec!(100), dec!(94), dec!(95)));
        candles.push(hourly_candle(41, dec!(95), dec!(96), dec!(84), dec!(95)));

        let mut data = HashMap::new();
        data.insert("BTCUSDT".to_string(), candles);

        let mut engine = BacktestEngine::new(config, options).unwrap();
        let report = engine.run(data).unwrap();

        assert_eq!(report.total_trades, 1, "expected exactly the short round trip");
        let trade = &report.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert_eq!(trade.entry_price, dec!(95));
        assert_eq!(trade.exit_price, dec!(85.5));
        assert!(trade.pnl > Decimal::ZERO);
    }

    #[test]
    fn funding_accrues_at_each_boundary_for_longs() {
        let mut config = Config::default();
        config.symbols = vec!["BTCUSDT".to_string()];
        config.strategy_id = "always-buy".to_string();
        config.risk.position_ratio = dec!(0.2);
        config.risk.stop_loss_percent = dec!(50);
        config.risk.take_profit_percent = dec!(500);
        let mut options = frictionless(&mut config);
        options.futures = true;
        options.avg_funding_rate_per_8h = Some(dec!(0.0001));

        let mut registry = StrategyRegistry::with_builtins();
        registry.register(Arc::new(AlwaysBuy));

        // constant price 100; warmup for default ma(7,25) is 25 candles,
        // so the entry lands at hour 24 and holds through hours 32/40/48
        let candles: Vec<Candle> = (0..49)
            .map(|i| hourly_candle(i, dec!(100), dec!(100), dec!(100), dec!(100)))
            .collect();
        let mut data = HashMap::new();
        data.insert("BTCUSDT".to_string(), candles);

        let mut engine =
            BacktestEngine::with_registry(config, options, Arc::new(registry)).unwrap();
        let report = engine.run(data).unwrap();

        // notional 2000 at rate 0.0001 over three boundaries: 0.6 paid
        assert_eq!(report.total_funding_paid, dec!(0.6));
        assert_eq!(report.trades.len(), 1);
        assert_eq!(report.trades[0].exit_reason, ExitReason::EndOfData);
    }

    #[test]
    fn mtf_filter_blocks_countertrend_buy() {
        let mut config = Config::default();
        config.symbols = vec!["BTCUSDT".to_string()];
        config.strategy_id = "always-buy".to_string();
        let options_base = frictionless(&mut config);

        let mut registry = StrategyRegistry::with_builtins();
        registry.register(Arc::new(AlwaysBuy));
        let registry = Arc::new(registry);

        let candles: Vec<Candle> = (0..40)
            .map(|i| hourly_candle(i, dec!(100), dec!(100), dec!(100), dec!(100)))
            .collect();
        let mut data = HashMap::new();
        data.insert("BTCUSDT".to_string(), candles.clone());

        // bearish higher timeframe: falling closes
        let higher: Vec<Candle> = (0..40)
            .map(|i| {
                let close = Decimal::from(200 - i);
                hourly_candle(i, close, close, close, close)
            })
            .collect();
        let mut options = options_base.clone();
        options
            .higher_timeframe
            .insert("BTCUSDT".to_string(), higher);

        let mut engine =
            BacktestEngine::with_registry(config.clone(), options, registry.clone()).unwrap();
        let report = engine.run(data.clone()).unwrap();
        assert_eq!(report.total_trades, 0, "bearish MTF must block the buy");

        // without the higher series the same run opens a position
        let mut engine =
            BacktestEngine::with_registry(config, options_base, registry).unwrap();
        let report = engine.run(data).unwrap();
        assert_eq!(report.total_trades, 1);
    }

    #[test]
    fn pessimistic_ordering_prefers_stop_loss_end_to_end() {
        let mut config = Config::default();
        config.symbols = vec!["BTCUSDT".to_string()];
        config.strategy_id = "always-buy".to_string();
        config.risk.stop_loss_percent = dec!(5);
        config.risk.take_profit_percent = dec!(5);
        let options = frictionless(&mut config);

        let mut registry = StrategyRegistry::with_builtins();
        registry.register(Arc::new(AlwaysBuy));

        let mut candles: Vec<Candle> = (0..26)
            .map(|i| hourly_candle(i, dec!(100), dec!(100), dec!(100), dec!(100)))
            .collect();
        // one candle that touches both the stop (95) and the target (105)
        candles.push(hourly_candle(26, dec!(100), dec!(106), dec!(94), dec!(100)));

        let mut data = HashMap::new();
        data.insert("BTCUSDT".to_string(), candles);

        let mut engine =
            BacktestEngine::with_registry(config, options, Arc::new(registry)).unwrap();
        let report = engine.run(data).unwrap();

        assert_eq!(report.trades.len(), 1);
        assert_eq!(report.trades[0].exit_reason, ExitReason::StopLoss);
        assert_eq!(report.trades[0].exit_price, dec!(95));
    }
}
