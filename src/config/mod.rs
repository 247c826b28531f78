use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::types::TimeFrame;

/// Root configuration tree. Every recognized option has a typed field; the
/// loader never drops unknown semantics into a side map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub strategy_id: String,
    pub symbols: Vec<String>,
    pub timeframe: TimeFrame,
    pub strategy: StrategyParams,
    pub signals: SignalsConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub protections: ProtectionsConfig,
    /// Partial risk overrides merged on top of `risk` per regime signal
    /// filter (e.g. "breakout_watch", "reduced_size").
    pub regime_overrides: HashMap<String, RiskOverrides>,
    pub ensemble: Option<EnsembleConfig>,
    pub paper: PaperConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strategy_id: "default".to_string(),
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            timeframe: TimeFrame::H1,
            strategy: StrategyParams::default(),
            signals: SignalsConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            protections: ProtectionsConfig::default(),
            regime_overrides: HashMap::new(),
            ensemble: None,
            paper: PaperConfig::default(),
        }
    }
}

impl Config {
    /// Load from a YAML/TOML/JSON file, falling back to defaults for any
    /// missing section.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg: Config = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .with_context(|| format!("reading config {}", path.display()))?
            .try_deserialize()
            .context("deserializing config")?;
        if let Err(errors) = cfg.validate() {
            anyhow::bail!("invalid configuration: {}", errors.join("; "));
        }
        Ok(cfg)
    }

    /// Startup validation. Any error here is fatal; the engine refuses to
    /// start on a config it cannot honour.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.symbols.is_empty() {
            errors.push("symbols must not be empty".to_string());
        }
        if self.strategy.ma.short >= self.strategy.ma.long {
            errors.push("strategy.ma.short must be < strategy.ma.long".to_string());
        }
        if self.strategy.macd.enabled && self.strategy.macd.fast >= self.strategy.macd.slow {
            errors.push("strategy.macd.fast must be < strategy.macd.slow".to_string());
        }
        if self.risk.stop_loss_percent <= Decimal::ZERO {
            errors.push("risk.stop_loss_percent must be > 0".to_string());
        }
        if self.risk.position_ratio <= Decimal::ZERO || self.risk.position_ratio > Decimal::ONE {
            errors.push("risk.position_ratio must be in (0, 1]".to_string());
        }
        if self.risk.max_positions == 0 {
            errors.push("risk.max_positions must be > 0".to_string());
        }
        if self.risk.min_rr < Decimal::ZERO {
            errors.push("risk.min_rr must be >= 0".to_string());
        }
        if self.execution.min_order_usdt < Decimal::ZERO {
            errors.push("execution.min_order_usdt must be >= 0".to_string());
        }
        if self.execution.max_exit_price_deviation <= Decimal::ZERO {
            errors.push("execution.max_exit_price_deviation must be > 0".to_string());
        }
        if let Some(ensemble) = &self.ensemble {
            if ensemble.strategies.is_empty() {
                errors.push("ensemble.strategies must not be empty".to_string());
            }
            if ensemble.threshold <= Decimal::ZERO || ensemble.threshold > Decimal::ONE {
                errors.push("ensemble.threshold must be in (0, 1]".to_string());
            }
            for member in &ensemble.strategies {
                if member.weight <= Decimal::ZERO {
                    errors.push(format!("ensemble weight for '{}' must be > 0", member.id));
                }
            }
        }
        if self.paper.initial_usdt <= Decimal::ZERO {
            errors.push("paper.initial_usdt must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Risk view for a given regime signal filter: the matching override
    /// (if any) merged field-by-field on top of the base risk config.
    pub fn risk_for_filter(&self, filter: &str) -> RiskConfig {
        match self.regime_overrides.get(filter) {
            Some(overrides) => overrides.apply(&self.risk),
            None => self.risk.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParams {
    pub ma: MaParams,
    pub rsi: RsiParams,
    pub macd: MacdParams,
    pub volume: VolumeParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaParams {
    pub short: usize,
    pub long: usize,
}

impl Default for MaParams {
    fn default() -> Self {
        Self { short: 7, long: 25 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RsiParams {
    pub period: usize,
    pub oversold: Decimal,
    pub overbought: Decimal,
}

impl Default for RsiParams {
    fn default() -> Self {
        Self {
            period: 14,
            oversold: dec!(30),
            overbought: dec!(70),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MacdParams {
    pub enabled: bool,
    pub fast: usize,
    pub slow: usize,
    pub signal: usize,
}

impl Default for MacdParams {
    fn default() -> Self {
        Self {
            enabled: true,
            fast: 12,
            slow: 26,
            signal: 9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeParams {
    pub surge_ratio: Decimal,
    pub low_ratio: Decimal,
}

impl Default for VolumeParams {
    fn default() -> Self {
        Self {
            surge_ratio: dec!(2.0),
            low_ratio: dec!(0.5),
        }
    }
}

/// Ordered condition-name lists per signal class. A class fires only when
/// every listed condition is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    pub buy: Vec<String>,
    pub sell: Vec<String>,
    pub short: Vec<String>,
    pub cover: Vec<String>,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            buy: vec!["ma_bullish".to_string(), "rsi_oversold".to_string()],
            sell: vec!["ma_bearish".to_string()],
            short: Vec::new(),
            cover: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Hard stop distance from entry, in percent.
    pub stop_loss_percent: Decimal,
    pub take_profit_percent: Decimal,
    /// Fraction of equity committed per entry.
    pub position_ratio: Decimal,
    pub max_positions: usize,
    pub max_position_per_symbol: usize,
    pub daily_loss_limit_percent: Decimal,
    pub max_total_loss_percent: Decimal,
    /// Minimum reward:risk against recent structure; 0 disables the filter.
    pub min_rr: Decimal,
    /// Quoted spread in basis points; entries pay half of it.
    pub spread_bps: Decimal,
    /// Close stale unprofitable positions after this many hours; 0 disables.
    pub time_stop_hours: u64,
    /// Minimum-hold-ms -> profit-threshold table.
    pub minimal_roi: BTreeMap<i64, Decimal>,
    pub take_profit_stages: Vec<TakeProfitStage>,
    /// Profit ratio at which the stop moves toward break-even; None disables.
    pub break_even_profit: Option<Decimal>,
    /// Offset from entry for the break-even stop, as a fraction.
    pub break_even_stop: Decimal,
    pub trailing_stop: TrailingStopConfig,
    /// Widened callback once the positive offset is reached.
    pub trailing_stop_positive: Option<Decimal>,
    pub trailing_stop_positive_offset: Decimal,
    pub trailing_only_offset_is_reached: bool,
    pub correlation_filter: CorrelationFilterConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_percent: dec!(3),
            take_profit_percent: dec!(6),
            position_ratio: dec!(0.2),
            max_positions: 5,
            max_position_per_symbol: 1,
            daily_loss_limit_percent: dec!(5),
            max_total_loss_percent: dec!(30),
            min_rr: dec!(0),
            spread_bps: dec!(2),
            time_stop_hours: 0,
            minimal_roi: BTreeMap::new(),
            take_profit_stages: Vec::new(),
            break_even_profit: None,
            break_even_stop: dec!(0.002),
            trailing_stop: TrailingStopConfig::default(),
            trailing_stop_positive: None,
            trailing_stop_positive_offset: Decimal::ZERO,
            trailing_only_offset_is_reached: false,
            correlation_filter: CorrelationFilterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitStage {
    pub at_percent: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingStopConfig {
    pub enabled: bool,
    /// Profit percent required before the trail arms.
    pub activation_percent: Decimal,
    /// Distance of the trail from the best price, in percent.
    pub callback_percent: Decimal,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            activation_percent: dec!(2),
            callback_percent: dec!(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationFilterConfig {
    pub enabled: bool,
    pub threshold: Decimal,
    /// Weighted-heat block level.
    pub max_heat: Decimal,
}

impl Default for CorrelationFilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: dec!(0.7),
            max_heat: dec!(0.85),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub order_type: OrderExecutionType,
    pub limit_order_offset_percent: Decimal,
    pub min_order_usdt: Decimal,
    pub limit_order_timeout_seconds: u64,
    /// Flash-crash guard: reject non-forced stop-loss exits whose loss
    /// exceeds this fraction.
    pub max_exit_price_deviation: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_type: OrderExecutionType::Market,
            limit_order_offset_percent: dec!(0.05),
            min_order_usdt: dec!(10),
            limit_order_timeout_seconds: 30,
            max_exit_price_deviation: dec!(0.15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderExecutionType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionsConfig {
    pub cooldown: Option<CooldownConfig>,
    pub stoploss_guard: Option<StoplossGuardConfig>,
    pub max_drawdown: Option<MaxDrawdownConfig>,
    pub low_profit_pairs: Option<LowProfitPairsConfig>,
}

impl ProtectionsConfig {
    pub fn any_enabled(&self) -> bool {
        self.cooldown.as_ref().is_some_and(|c| c.enabled)
            || self.stoploss_guard.as_ref().is_some_and(|c| c.enabled)
            || self.max_drawdown.as_ref().is_some_and(|c| c.enabled)
            || self.low_profit_pairs.as_ref().is_some_and(|c| c.enabled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    pub enabled: bool,
    pub stop_duration_candles: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stop_duration_candles: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoplossGuardConfig {
    pub enabled: bool,
    pub lookback_period_candles: u64,
    pub trade_limit: usize,
    pub only_per_pair: bool,
}

impl Default for StoplossGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_period_candles: 24,
            trade_limit: 4,
            only_per_pair: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxDrawdownConfig {
    pub enabled: bool,
    pub lookback_period_candles: u64,
    pub trade_limit: usize,
    /// Negative fraction; cumulative pnl ratio at or below this blocks all
    /// entries.
    pub max_allowed_drawdown: Decimal,
}

impl Default for MaxDrawdownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_period_candles: 48,
            trade_limit: 10,
            max_allowed_drawdown: dec!(-0.1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LowProfitPairsConfig {
    pub enabled: bool,
    pub lookback_period_candles: u64,
    pub trade_limit: usize,
    pub required_profit: Decimal,
}

impl Default for LowProfitPairsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_period_candles: 72,
            trade_limit: 6,
            required_profit: dec!(0.0),
        }
    }
}

/// Partial risk config for regime overrides. Present fields replace the
/// base; `trailing_stop` is deep-merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskOverrides {
    pub stop_loss_percent: Option<Decimal>,
    pub take_profit_percent: Option<Decimal>,
    pub position_ratio: Option<Decimal>,
    pub min_rr: Option<Decimal>,
    pub time_stop_hours: Option<u64>,
    pub break_even_profit: Option<Decimal>,
    pub break_even_stop: Option<Decimal>,
    pub trailing_stop: Option<TrailingStopOverrides>,
    pub trailing_stop_positive: Option<Decimal>,
    pub trailing_stop_positive_offset: Option<Decimal>,
    pub trailing_only_offset_is_reached: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingStopOverrides {
    pub enabled: Option<bool>,
    pub activation_percent: Option<Decimal>,
    pub callback_percent: Option<Decimal>,
}

impl RiskOverrides {
    pub fn apply(&self, base: &RiskConfig) -> RiskConfig {
        let mut merged = base.clone();
        if let Some(v) = self.stop_loss_percent {
            merged.stop_loss_percent = v;
        }
        if let Some(v) = self.take_profit_percent {
            merged.take_profit_percent = v;
        }
        if let Some(v) = self.position_ratio {
            merged.position_ratio = v;
        }
        if let Some(v) = self.min_rr {
            merged.min_rr = v;
        }
        if let Some(v) = self.time_stop_hours {
            merged.time_stop_hours = v;
        }
        if let Some(v) = self.break_even_profit {
            merged.break_even_profit = Some(v);
        }
        if let Some(v) = self.break_even_stop {
            merged.break_even_stop = v;
        }
        if let Some(ts) = &self.trailing_stop {
            if let Some(v) = ts.enabled {
                merged.trailing_stop.enabled = v;
            }
            if let Some(v) = ts.activation_percent {
                merged.trailing_stop.activation_percent = v;
            }
            if let Some(v) = ts.callback_percent {
                merged.trailing_stop.callback_percent = v;
            }
        }
        if let Some(v) = self.trailing_stop_positive {
            merged.trailing_stop_positive = Some(v);
        }
        if let Some(v) = self.trailing_stop_positive_offset {
            merged.trailing_stop_positive_offset = v;
        }
        if let Some(v) = self.trailing_only_offset_is_reached {
            merged.trailing_only_offset_is_reached = v;
        }
        merged
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub strategies: Vec<EnsembleMember>,
    pub threshold: Decimal,
    pub unanimous: bool,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            strategies: Vec::new(),
            threshold: dec!(0.5),
            unanimous: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleMember {
    pub id: String,
    #[serde(default = "default_weight")]
    pub weight: Decimal,
}

fn default_weight() -> Decimal {
    Decimal::ONE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub scenario_id: String,
    pub initial_usdt: Decimal,
    pub fee_rate: Decimal,
    pub slippage_percent: Decimal,
    pub report_interval_hours: u64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            scenario_id: "default".to_string(),
            initial_usdt: dec!(10000),
            fee_rate: dec!(0.0004),
            slippage_percent: dec!(0.05),
            report_interval_hours: 24,
        }
    }
}
