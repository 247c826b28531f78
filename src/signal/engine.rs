use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::debug;

use crate::config::{Config, RiskConfig};
use crate::indicators::{compute_snapshot, IndicatorSnapshot};
use crate::regime::{classify_regime, should_allow_signal, RegimeAnalysis, SignalFilter};
use crate::risk::{binary_gate_multiplier, ProtectionManager, ProtectionReason};
use crate::strategies::{StrategyContext, StrategyRegistry};
use crate::types::{Candle, PositionSide, SignalKind, TradeRecord};

use super::check_risk_reward;

/// External scalars and cross-symbol state injected into one
/// `process_signal` call. Everything the engine needs beyond the candle
/// window arrives through here, which keeps the call itself a pure
/// function of its inputs.
#[derive(Default)]
pub struct ExternalContext<'a> {
    pub position_side: Option<PositionSide>,
    pub cvd: Option<Decimal>,
    pub funding_rate: Option<Decimal>,
    pub btc_dominance: Option<Decimal>,
    pub btc_dom_change: Option<Decimal>,
    /// Candle windows of symbols currently held, for the correlation gate.
    pub held_klines: Vec<(String, &'a [Candle])>,
    /// External support/resistance pivot overriding the R:R window.
    pub pivot: Option<(Decimal, Decimal)>,
}

/// Structured rejection reasons, logged verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectionReason {
    InsufficientData,
    UnknownStrategy(String),
    RegimeFilter {
        regime: String,
        confidence: Decimal,
    },
    RiskReward {
        ratio: Option<Decimal>,
        min_rr: Decimal,
    },
    Protection(ProtectionReason),
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::InsufficientData => write!(f, "insufficient data"),
            RejectionReason::UnknownStrategy(id) => write!(f, "unknown strategy '{id}'"),
            RejectionReason::RegimeFilter { regime, confidence } => {
                write!(f, "regime filter: {regime} (confidence {confidence})")
            }
            RejectionReason::RiskReward { ratio, min_rr } => match ratio {
                Some(ratio) => write!(f, "risk:reward {ratio} below minimum {min_rr}"),
                None => write!(f, "risk:reward below minimum {min_rr}"),
            },
            RejectionReason::Protection(reason) => write!(f, "protection: {reason}"),
        }
    }
}

/// Outcome of one signal-pipeline pass.
pub struct EngineResult {
    pub indicators: Option<IndicatorSnapshot>,
    pub signal: SignalKind,
    pub effective_risk: RiskConfig,
    /// Equity fraction to commit; present for accepted entries.
    pub effective_position_ratio: Option<Decimal>,
    pub rejected: bool,
    pub rejection_reason: Option<RejectionReason>,
    pub regime: Option<RegimeAnalysis>,
}

impl EngineResult {
    fn rejected(reason: RejectionReason, risk: RiskConfig) -> Self {
        Self {
            indicators: None,
            signal: SignalKind::None,
            effective_risk: risk,
            effective_position_ratio: None,
            rejected: true,
            rejection_reason: Some(reason),
            regime: None,
        }
    }
}

/// The decision pipeline: indicators -> strategy -> regime gate -> R:R
/// filter -> correlation gate -> protections. Exits short-circuit past
/// every entry filter.
pub struct SignalEngine {
    registry: Arc<StrategyRegistry>,
}

impl SignalEngine {
    pub fn new(registry: Arc<StrategyRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn process_signal(
        &self,
        symbol: &str,
        klines: &[Candle],
        config: &Config,
        external: &ExternalContext,
        now: DateTime<Utc>,
        recent_trades: Option<&[TradeRecord]>,
    ) -> EngineResult {
        // 1. Indicator snapshot; warmup not met is a quiet non-signal.
        let Some(mut indicators) = compute_snapshot(klines, &config.strategy) else {
            return EngineResult::rejected(RejectionReason::InsufficientData, config.risk.clone());
        };

        // 2. External scalars take precedence over window-derived values.
        if external.cvd.is_some() {
            indicators.cvd = external.cvd;
        }
        indicators.funding_rate = external.funding_rate;
        indicators.btc_dominance = external.btc_dominance;
        indicators.btc_dom_change = external.btc_dom_change;

        // 3. Resolve and run the strategy.
        let strategy = match self.registry.resolve(config) {
            Ok(strategy) => strategy,
            Err(err) => {
                return EngineResult::rejected(
                    RejectionReason::UnknownStrategy(err.to_string()),
                    config.risk.clone(),
                );
            }
        };
        let ctx = StrategyContext {
            symbol,
            candles: klines,
            indicators: &indicators,
            params: &config.strategy,
            signals: &config.signals,
            position_side: external.position_side,
        };
        let signal = strategy.populate_signal(&ctx);

        // 4. Exits and non-signals bypass the entry filter chain.
        if !signal.is_entry() {
            return EngineResult {
                indicators: Some(indicators),
                signal,
                effective_risk: config.risk.clone(),
                effective_position_ratio: None,
                rejected: false,
                rejection_reason: None,
                regime: None,
            };
        }

        // 5. Regime gate and risk overrides.
        let regime = classify_regime(klines);
        let mut effective_risk = config.risk.clone();
        let mut position_ratio = config.risk.position_ratio;
        if let Some(analysis) = &regime {
            if analysis.confidence >= dec!(60) && !should_allow_signal(analysis, signal) {
                debug!(%symbol, regime = %analysis.regime, "entry rejected by regime filter");
                let mut result = EngineResult::rejected(
                    RejectionReason::RegimeFilter {
                        regime: analysis.regime.to_string(),
                        confidence: analysis.confidence,
                    },
                    effective_risk,
                );
                result.indicators = Some(indicators);
                result.regime = regime.clone();
                return result;
            }
            effective_risk = config.risk_for_filter(analysis.signal_filter.as_str());
            position_ratio = effective_risk.position_ratio;
            if analysis.signal_filter == SignalFilter::ReducedSize {
                position_ratio *= dec!(0.5);
            }
        }

        // 6. Risk:reward against recent structure.
        if effective_risk.min_rr > Decimal::ZERO {
            let check = check_risk_reward(
                klines,
                signal,
                indicators.price,
                effective_risk.min_rr,
                external.pivot,
            );
            if !check.passed {
                debug!(%symbol, ratio = ?check.ratio, "entry rejected by risk:reward filter");
                let mut result = EngineResult::rejected(
                    RejectionReason::RiskReward {
                        ratio: check.ratio,
                        min_rr: effective_risk.min_rr,
                    },
                    effective_risk,
                );
                result.indicators = Some(indicators);
                result.regime = regime;
                return result;
            }
        }

        // 7. Correlation gate against the held book.
        if effective_risk.correlation_filter.enabled && !external.held_klines.is_empty() {
            let held: Vec<(&str, &[Candle])> = external
                .held_klines
                .iter()
                .map(|(symbol, candles)| (symbol.as_str(), *candles))
                .collect();
            let multiplier = binary_gate_multiplier(
                klines,
                &held,
                effective_risk.correlation_filter.threshold,
            );
            position_ratio *= multiplier;
        }

        // 8. Protection gates over recent closed trades.
        if config.protections.any_enabled() {
            if let Some(trades) = recent_trades {
                let verdict = ProtectionManager::check(
                    symbol,
                    now,
                    trades,
                    &config.protections,
                    config.timeframe.candle_ms(),
                );
                if !verdict.allowed {
                    let reason = verdict
                        .reason
                        .expect("blocked protection result always carries a reason");
                    debug!(%symbol, %reason, "entry rejected by protections");
                    let mut result = EngineResult::rejected(
                        RejectionReason::Protection(reason),
                        effective_risk,
                    );
                    result.indicators = Some(indicators);
                    result.regime = regime;
                    return result;
                }
            }
        }

        EngineResult {
            indicators: Some(indicators),
            signal,
            effective_risk,
            effective_position_ratio: Some(position_ratio),
            rejected: false,
            rejection_reason: None,
            regime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CooldownConfig;
    use crate::strategies::Strategy;
    use crate::types::TimeFrame;
    use chrono::TimeZone;

    struct AlwaysBuy;

    impl Strategy for AlwaysBuy {
        fn id(&self) -> &str {
            "always-buy"
        }

        fn populate_signal(&self, _ctx: &StrategyContext) -> SignalKind {
            SignalKind::Buy
        }
    }

    struct AlwaysSell;

    impl Strategy for AlwaysSell {
        fn id(&self) -> &str {
            "always-sell"
        }

        fn populate_signal(&self, _ctx: &StrategyContext) -> SignalKind {
            SignalKind::Sell
        }
    }

    fn engine() -> SignalEngine {
        let mut registry = StrategyRegistry::with_builtins();
        registry.register(Arc::new(AlwaysBuy));
        registry.register(Arc::new(AlwaysSell));
        SignalEngine::new(Arc::new(registry))
    }

    fn candle(i: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        let t = Utc.timestamp_millis_opt(i * 3_600_000).unwrap();
        Candle {
            open_time: t,
            close_time: t,
            open,
            high,
            low,
            close,
            volume: dec!(1000),
        }
    }

    fn flat_candles(n: usize) -> Vec<Candle> {
        (0..n as i64)
            .map(|i| {
                let wiggle = Decimal::from(i % 2);
                candle(
                    i,
                    dec!(100) + wiggle,
                    dec!(101) + wiggle,
                    dec!(99) + wiggle,
                    dec!(100) + wiggle,
                )
            })
            .collect()
    }

    fn trending_candles(n: usize) -> Vec<Candle> {
        (0..n as i64)
            .map(|i| {
                let base = Decimal::from(100 + 3 * i);
                candle(i, base, base + dec!(4), base - dec!(1), base + dec!(3))
            })
            .collect()
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(500 * 3_600_000).unwrap()
    }

    #[test]
    fn insufficient_data_rejects_quietly() {
        let engine = engine();
        let config = Config::default();
        let result = engine.process_signal(
            "BTCUSDT",
            &flat_candles(10),
            &config,
            &ExternalContext::default(),
            now(),
            None,
        );
        assert!(result.rejected);
        assert_eq!(result.signal, SignalKind::None);
        assert_eq!(
            result.rejection_reason,
            Some(RejectionReason::InsufficientData)
        );
    }

    #[test]
    fn exits_bypass_entry_filters() {
        let engine = engine();
        let mut config = Config::default();
        config.strategy_id = "always-sell".to_string();
        // breakout-watch regime would reject entries; sells must pass
        let external = ExternalContext {
            position_side: Some(PositionSide::Long),
            ..ExternalContext::default()
        };
        let result = engine.process_signal(
            "BTCUSDT",
            &flat_candles(80),
            &config,
            &external,
            now(),
            None,
        );
        assert!(!result.rejected);
        assert_eq!(result.signal, SignalKind::Sell);
    }

    #[test]
    fn breakout_watch_regime_rejects_confident_entries() {
        let engine = engine();
        let mut config = Config::default();
        config.strategy_id = "always-buy".to_string();
        let result = engine.process_signal(
            "BTCUSDT",
            &flat_candles(80),
            &config,
            &ExternalContext::default(),
            now(),
            None,
        );
        assert!(result.rejected);
        assert!(matches!(
            result.rejection_reason,
            Some(RejectionReason::RegimeFilter { .. })
        ));
        assert!(result.regime.is_some());
    }

    #[test]
    fn trending_market_accepts_buy_with_ratio() {
        let engine = engine();
        let mut config = Config::default();
        config.strategy_id = "always-buy".to_string();
        let result = engine.process_signal(
            "BTCUSDT",
            &trending_candles(80),
            &config,
            &ExternalContext::default(),
            now(),
            None,
        );
        assert!(!result.rejected, "reason: {:?}", result.rejection_reason);
        assert_eq!(result.signal, SignalKind::Buy);
        assert_eq!(
            result.effective_position_ratio,
            Some(config.risk.position_ratio)
        );
    }

    #[test]
    fn cooldown_protection_rejects_entry() {
        let engine = engine();
        let mut config = Config::default();
        config.strategy_id = "always-buy".to_string();
        config.timeframe = TimeFrame::H1;
        config.protections.cooldown = Some(CooldownConfig {
            enabled: true,
            stop_duration_candles: 5,
        });
        let trades = vec![TradeRecord {
            symbol: "BTCUSDT".to_string(),
            closed_at: now() - chrono::Duration::hours(2),
            pnl_ratio: dec!(-0.03),
            was_stop_loss: true,
        }];
        let result = engine.process_signal(
            "BTCUSDT",
            &trending_candles(80),
            &config,
            &ExternalContext::default(),
            now(),
            Some(&trades),
        );
        assert!(result.rejected);
        assert!(matches!(
            result.rejection_reason,
            Some(RejectionReason::Protection(ProtectionReason::CooldownPeriod { .. }))
        ));
    }

    #[test]
    fn correlation_gate_halves_position_ratio() {
        let engine = engine();
        let mut config = Config::default();
        config.strategy_id = "always-buy".to_string();
        config.risk.correlation_filter.enabled = true;
        config.risk.correlation_filter.threshold = dec!(0.7);
        let klines = trending_candles(80);
        let held = trending_candles(80);
        let external = ExternalContext {
            held_klines: vec![("ETHUSDT".to_string(), held.as_slice())],
            ..ExternalContext::default()
        };
        let result =
            engine.process_signal("BTCUSDT", &klines, &config, &external, now(), None);
        assert!(!result.rejected);
        assert_eq!(
            result.effective_position_ratio,
            Some(config.risk.position_ratio * dec!(0.5))
        );
    }

    #[test]
    fn process_signal_is_deterministic() {
        let engine = engine();
        let mut config = Config::default();
        config.strategy_id = "always-buy".to_string();
        let klines = trending_candles(80);
        let a = engine.process_signal(
            "BTCUSDT",
            &klines,
            &config,
            &ExternalContext::default(),
            now(),
            None,
        );
        let b = engine.process_signal(
            "BTCUSDT",
            &klines,
            &config,
            &ExternalContext::default(),
            now(),
            None,
        );
        assert_eq!(a.signal, b.signal);
        assert_eq!(a.rejected, b.rejected);
        assert_eq!(a.effective_position_ratio, b.effective_position_ratio);
    }
}
