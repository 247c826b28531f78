use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::warn;

use crate::config::EnsembleConfig;
use crate::types::SignalKind;

use super::{Strategy, StrategyContext, StrategyRegistry};

/// One resolved voter.
struct Voter {
    strategy: Arc<dyn Strategy>,
    weight: Decimal,
}

#[derive(Debug, Clone)]
pub struct EnsembleVote {
    pub strategy_id: String,
    pub signal: SignalKind,
    pub weight: Decimal,
}

/// Full ensemble result: winning class plus per-class scores and the raw
/// votes, for logging and tests.
#[derive(Debug, Clone)]
pub struct EnsembleOutcome {
    pub signal: SignalKind,
    pub buy_score: Decimal,
    pub sell_score: Decimal,
    pub short_score: Decimal,
    pub cover_score: Decimal,
    pub votes: Vec<EnsembleVote>,
    /// True when the resolved vote set is homogeneous, all-none included.
    pub unanimous: bool,
    /// Winner's score, or the top losing score when the result is none.
    pub confidence: Decimal,
}

impl EnsembleOutcome {
    pub fn score(&self, kind: SignalKind) -> Decimal {
        match kind {
            SignalKind::Buy => self.buy_score,
            SignalKind::Sell => self.sell_score,
            SignalKind::Short => self.short_score,
            SignalKind::Cover => self.cover_score,
            SignalKind::None => Decimal::ZERO,
        }
    }

    fn empty() -> Self {
        Self {
            signal: SignalKind::None,
            buy_score: Decimal::ZERO,
            sell_score: Decimal::ZERO,
            short_score: Decimal::ZERO,
            cover_score: Decimal::ZERO,
            votes: Vec::new(),
            unanimous: true,
            confidence: Decimal::ZERO,
        }
    }
}

/// Weighted vote over sub-strategies. Each voter's weight counts toward
/// the denominator whether or not it produced a signal, so scores stay
/// comparable across configurations.
pub struct EnsembleStrategy {
    voters: Vec<Voter>,
    threshold: Decimal,
    unanimous_mode: bool,
}

impl EnsembleStrategy {
    /// Resolve voters against the registry. Unknown ids are skipped with a
    /// warning and do not contribute to the denominator.
    pub fn from_config(config: &EnsembleConfig, registry: &StrategyRegistry) -> Self {
        let mut voters = Vec::with_capacity(config.strategies.len());
        for member in &config.strategies {
            match registry.get(&member.id) {
                Ok(strategy) => voters.push(Voter {
                    strategy,
                    weight: member.weight,
                }),
                Err(_) => {
                    warn!(strategy_id = %member.id, "ensemble voter not registered, skipping");
                }
            }
        }
        Self {
            voters,
            threshold: config.threshold,
            unanimous_mode: config.unanimous,
        }
    }

    pub fn evaluate(&self, ctx: &StrategyContext) -> EnsembleOutcome {
        if self.voters.is_empty() {
            return EnsembleOutcome::empty();
        }

        let mut votes = Vec::with_capacity(self.voters.len());
        let mut total_weight = Decimal::ZERO;
        for voter in &self.voters {
            let signal = voter.strategy.populate_signal(ctx);
            total_weight += voter.weight;
            votes.push(EnsembleVote {
                strategy_id: voter.strategy.id().to_string(),
                signal,
                weight: voter.weight,
            });
        }

        let class_score = |kind: SignalKind| -> Decimal {
            let sum: Decimal = votes
                .iter()
                .filter(|v| v.signal == kind)
                .map(|v| v.weight)
                .sum();
            if total_weight.is_zero() {
                Decimal::ZERO
            } else {
                sum / total_weight
            }
        };

        let buy_score = class_score(SignalKind::Buy);
        let sell_score = class_score(SignalKind::Sell);
        let short_score = class_score(SignalKind::Short);
        let cover_score = class_score(SignalKind::Cover);

        let score_of = |kind: SignalKind| match kind {
            SignalKind::Buy => buy_score,
            SignalKind::Sell => sell_score,
            SignalKind::Short => short_score,
            SignalKind::Cover => cover_score,
            SignalKind::None => Decimal::ZERO,
        };

        // Highest score wins; ties break in the fixed buy/sell/short/cover
        // order, so strict `>` over that enumeration suffices.
        let mut top_kind = SignalKind::None;
        let mut top_score = Decimal::ZERO;
        for kind in SignalKind::vote_order() {
            let score = score_of(kind);
            if score > top_score {
                top_score = score;
                top_kind = kind;
            }
        }

        let unanimous = votes.windows(2).all(|w| w[0].signal == w[1].signal);

        let winner = if self.unanimous_mode {
            if unanimous
                && top_kind != SignalKind::None
                && top_score >= self.threshold
            {
                top_kind
            } else {
                SignalKind::None
            }
        } else if top_score >= self.threshold {
            top_kind
        } else {
            SignalKind::None
        };

        let confidence = if winner != SignalKind::None {
            score_of(winner)
        } else {
            top_score
        };

        EnsembleOutcome {
            signal: winner,
            buy_score,
            sell_score,
            short_score,
            cover_score,
            votes,
            unanimous,
            confidence,
        }
    }
}

impl Strategy for EnsembleStrategy {
    fn id(&self) -> &str {
        "ensemble"
    }

    fn populate_signal(&self, ctx: &StrategyContext) -> SignalKind {
        self.evaluate(ctx).signal
    }
}
