use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::events::{evaluate_event_risk, EconomicEvent, EventPhase};
use crate::exchange::Broker;
use crate::notifications::Notifier;
use crate::risk::exposure_summary;
use crate::signal::{ExternalContext, SignalEngine};
use crate::strategies::StrategyRegistry;
use crate::types::{Candle, ExitReason, PositionSide, SignalKind};

use super::{LiveExecutor, PaperEngine};

/// What one monitor pass decided for one symbol.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: SignalKind,
    pub size_usdt: Decimal,
    pub reason: String,
}

/// Where decisions are applied: the simulated account or the live
/// executor with its local account mirror.
pub enum ExecutionTarget {
    Paper(PaperEngine),
    Live {
        executor: LiveExecutor,
        account: super::Account,
    },
}

/// Periodically drives the signal pipeline per symbol against fresh
/// candles and applies the resulting decisions. Symbols are processed
/// strictly sequentially: the shared account is a single resource and
/// its mutations must stay totally ordered.
pub struct MonitorLoop {
    config: Config,
    broker: Arc<dyn Broker>,
    signal_engine: SignalEngine,
    target: ExecutionTarget,
    notifier: Arc<dyn Notifier>,
    events: Vec<EconomicEvent>,
    poll_interval: Duration,
    kline_limit: u32,
    windows: HashMap<String, Vec<Candle>>,
}

impl MonitorLoop {
    pub fn new(
        config: Config,
        broker: Arc<dyn Broker>,
        registry: Arc<StrategyRegistry>,
        target: ExecutionTarget,
        notifier: Arc<dyn Notifier>,
        events: Vec<EconomicEvent>,
    ) -> Self {
        let poll_interval = Duration::from_secs(60.min(config.timeframe.to_minutes() * 60));
        Self {
            signal_engine: SignalEngine::new(registry),
            config,
            broker,
            target,
            notifier,
            events,
            poll_interval,
            kline_limit: 200,
            windows: HashMap::new(),
        }
    }

    pub fn target(&self) -> &ExecutionTarget {
        &self.target
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(
            symbols = self.config.symbols.len(),
            timeframe = %self.config.timeframe,
            "monitor loop started"
        );
        loop {
            if let Err(err) = self.tick(Utc::now()).await {
                warn!(%err, "monitor tick failed");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One full pass: refresh candles, maintenance, then decisions per
    /// symbol in a fixed order.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        let symbols = self.config.symbols.clone();

        // Refresh candle windows; a failed fetch keeps the stale window.
        for symbol in &symbols {
            match self
                .broker
                .get_klines(symbol, self.config.timeframe, self.kline_limit)
                .await
            {
                Ok(candles) if !candles.is_empty() => {
                    self.windows.insert(symbol.clone(), candles);
                }
                Ok(_) => warn!(%symbol, "empty kline response"),
                Err(err) => warn!(%symbol, %err, "kline fetch failed"),
            }
        }
        let marks: HashMap<String, Decimal> = self
            .windows
            .iter()
            .filter_map(|(symbol, candles)| {
                candles.last().map(|c| (symbol.clone(), c.close))
            })
            .collect();

        // Live maintenance before any new decision: reconcile native
        // stops, then escalate timed-out orders.
        if let ExecutionTarget::Live { executor, account } = &mut self.target {
            executor.sync_exchange_stop_losses(account, now).await;
            executor.check_order_timeouts(account, &marks, now).await;
        }

        let event_risk = evaluate_event_risk(&self.events, now);
        if event_risk.phase != EventPhase::None {
            debug!(phase = ?event_risk.phase, "event-calendar throttle active");
        }

        for symbol in &symbols {
            let multiplier = event_risk.position_ratio_multiplier;
            if let Err(err) = self.process_symbol(symbol, &marks, multiplier, now).await {
                warn!(%symbol, %err, "symbol processing failed");
            }
        }

        self.log_exposure(&marks);
        if let ExecutionTarget::Paper(paper) = &self.target {
            paper.save()?;
        }
        Ok(())
    }

    /// Aggregate book exposure, logged once the account holds two or
    /// more positions.
    fn log_exposure(&self, marks: &HashMap<String, Decimal>) {
        let account = match &self.target {
            ExecutionTarget::Paper(paper) => paper.account(),
            ExecutionTarget::Live { account, .. } => account,
        };
        if account.open_position_count() < 2 {
            return;
        }
        let positions: Vec<(PositionSide, Decimal, &[Candle])> = account
            .positions
            .iter()
            .filter_map(|(symbol, pos)| {
                let mark = marks.get(symbol)?;
                let window = self.windows.get(symbol)?;
                Some((pos.side, pos.notional(*mark), window.as_slice()))
            })
            .collect();
        let summary = exposure_summary(account.equity(marks), &positions);
        info!(
            positions = summary.position_count,
            gross = %summary.gross_exposure_ratio,
            net = %summary.net_exposure_ratio,
            avg_correlation = ?summary.avg_abs_correlation,
            "portfolio exposure"
        );
    }

    async fn process_symbol(
        &mut self,
        symbol: &str,
        marks: &HashMap<String, Decimal>,
        event_multiplier: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(window) = self.windows.get(symbol).cloned() else {
            return Ok(());
        };

        // Exit checks run first in paper mode (live price exits are the
        // exchange's native stop's job).
        if let ExecutionTarget::Paper(paper) = &mut self.target {
            paper.check_exits(symbol, &window, now)?;
        }

        let (position_side, held, recent) = match &self.target {
            ExecutionTarget::Paper(paper) => (
                paper.account().position(symbol).map(|p| p.side),
                self.held_windows(symbol, paper.account().positions.keys()),
                paper.account().recent_trade_records(200),
            ),
            ExecutionTarget::Live { account, .. } => (
                account.position(symbol).map(|p| p.side),
                self.held_windows(symbol, account.positions.keys()),
                account.recent_trade_records(200),
            ),
        };

        let external = ExternalContext {
            position_side,
            held_klines: held
                .iter()
                .map(|(s, w)| (s.clone(), w.as_slice()))
                .collect(),
            ..ExternalContext::default()
        };
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

        if result.rejected {
            if let Some(reason) = &result.rejection_reason {
                debug!(%symbol, %reason, "signal rejected");
            }
            return Ok(());
        }

        let decision = self.build_decision(&result, marks, event_multiplier, now);
        self.apply_decision(symbol, decision, &result, marks, now)
            .await
    }

    fn held_windows<'a>(
        &self,
        exclude: &str,
        held_symbols: impl Iterator<Item = &'a String>,
    ) -> Vec<(String, Vec<Candle>)> {
        held_symbols
            .filter(|s| s.as_str() != exclude)
            .filter_map(|s| self.windows.get(s).map(|w| (s.clone(), w.clone())))
            .collect()
    }

    fn build_decision(
        &self,
        result: &crate::signal::EngineResult,
        marks: &HashMap<String, Decimal>,
        event_multiplier: Decimal,
        now: DateTime<Utc>,
    ) -> Decision {
        if !result.signal.is_entry() {
            return Decision {
                action: result.signal,
                size_usdt: Decimal::ZERO,
                reason: format!("{} signal", result.signal),
            };
        }

        let account = match &self.target {
            ExecutionTarget::Paper(paper) => paper.account(),
            ExecutionTarget::Live { account, .. } => account,
        };
        if account.open_position_count() >= self.config.risk.max_positions {
            return Decision {
                action: SignalKind::None,
                size_usdt: Decimal::ZERO,
                reason: "max positions reached".to_string(),
            };
        }
        if account.daily_loss_exceeded(
            now.date_naive(),
            self.config.risk.daily_loss_limit_percent,
        ) {
            return Decision {
                action: SignalKind::None,
                size_usdt: Decimal::ZERO,
                reason: "daily loss limit reached".to_string(),
            };
        }

        let ratio = result
            .effective_position_ratio
            .unwrap_or(result.effective_risk.position_ratio);
        let size = account.equity(marks) * ratio * event_multiplier;
        if size < self.config.execution.min_order_usdt {
            return Decision {
                action: SignalKind::None,
                size_usdt: Decimal::ZERO,
                reason: "sized below min order".to_string(),
            };
        }
        Decision {
            action: result.signal,
            size_usdt: size,
            reason: format!("{} entry", result.signal),
        }
    }

    async fn apply_decision(
        &mut self,
        symbol: &str,
        decision: Decision,
        result: &crate::signal::EngineResult,
        marks: &HashMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mark = marks.get(symbol).copied().unwrap_or(Decimal::ZERO);
        match decision.action {
            SignalKind::None => Ok(()),
            SignalKind::Buy | SignalKind::Short => {
                let conditions = match decision.action {
                    SignalKind::Buy => self.config.signals.buy.clone(),
                    _ => self.config.signals.short.clone(),
                };
                match &mut self.target {
                    ExecutionTarget::Paper(paper) => {
                        if let Err(err) = paper.apply_entry(
                            symbol,
                            decision.action,
                            decision.size_usdt,
                            mark,
                            result.effective_risk.stop_loss_percent,
                            result.effective_risk.take_profit_percent,
                            conditions,
                            now,
                        ) {
                            debug!(%symbol, %err, "paper entry skipped");
                        }
                    }
                    ExecutionTarget::Live { executor, account } => {
                        let sl_fraction =
                            result.effective_risk.stop_loss_percent / Decimal::from(100);
                        let tp_fraction =
                            result.effective_risk.take_profit_percent / Decimal::from(100);
                        let (stop_loss, take_profit) = match decision.action {
                            SignalKind::Buy => (
                                mark * (Decimal::ONE - sl_fraction),
                                mark * (Decimal::ONE + tp_fraction),
                            ),
                            _ => (
                                mark * (Decimal::ONE + sl_fraction),
                                mark * (Decimal::ONE - tp_fraction),
                            ),
                        };
                        executor
                            .open_entry(
                                account,
                                symbol,
                                decision.action,
                                decision.size_usdt,
                                mark,
                                stop_loss,
                                take_profit,
                                conditions,
                                now,
                            )
                            .await;
                    }
                }
                Ok(())
            }
            SignalKind::Sell | SignalKind::Cover => {
                match &mut self.target {
                    ExecutionTarget::Paper(paper) => {
                        // signal exits fill at the current close
                        if mark > Decimal::ZERO {
                            paper.close_signal_exit(symbol, mark, now)?;
                        }
                    }
                    ExecutionTarget::Live { executor, account } => {
                        if account.position(symbol).is_some() {
                            executor
                                .execute_exit(account, symbol, mark, ExitReason::Signal, now)
                                .await;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }
}
