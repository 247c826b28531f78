use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::EngineError;

use super::{EnsembleStrategy, RuleStrategy, Strategy};

/// Process-wide id -> strategy mapping. Read-only after initialization;
/// lookups fail loudly so callers decide whether to fall back.
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in strategies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RuleStrategy::new()));
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        self.strategies
            .insert(strategy.id().to_string(), strategy);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Strategy>, EngineError> {
        self.strategies
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStrategy(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.strategies.contains_key(id)
    }

    /// Resolve the active strategy for a config. `ensemble` is assembled
    /// on demand from its configured voters.
    pub fn resolve(&self, config: &Config) -> Result<Arc<dyn Strategy>, EngineError> {
        if config.strategy_id == "ensemble" {
            let ensemble_cfg = config
                .ensemble
                .as_ref()
                .ok_or_else(|| EngineError::UnknownStrategy("ensemble (unconfigured)".into()))?;
            return Ok(Arc::new(EnsembleStrategy::from_config(ensemble_cfg, self)));
        }
        self.get(&config.strategy_id)
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
