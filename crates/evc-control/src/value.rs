//! Value-function pipeline: `combiner(outcome_agg(outcome), cost_agg(costs))`.
//!
//! User callables are wrapped once, at configuration time, into the uniform
//! `(context, ...) -> f64` shape. The selector calls every stage the same
//! way regardless of which are custom.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EvcError;

/// What a value-function stage may inspect about the candidate it scores.
#[derive(Debug, Clone, Copy)]
pub struct ValueContext<'a> {
    /// Outer trial index.
    pub trial: u64,
    /// Row of the candidate in the sample space.
    pub row: usize,
    /// Candidate allocation policy.
    pub policy: &'a [f64],
    /// Intensities committed on the previous trial, one per signal.
    pub committed_intensities: &'a [f64],
}

pub type OutcomeFn = Arc<dyn Fn(&ValueContext<'_>, f64) -> f64 + Send + Sync>;
pub type CostFn = Arc<dyn Fn(&ValueContext<'_>, &[f64]) -> f64 + Send + Sync>;
pub type CombineFn = Arc<dyn Fn(&ValueContext<'_>, f64, f64) -> f64 + Send + Sync>;

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeAggregator {
    #[default]
    Identity,
    #[serde(skip)]
    Custom(OutcomeFn),
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostAggregator {
    #[default]
    Sum,
    /// `Σ wⱼ · cⱼ^{eⱼ}`.
    Weighted {
        weights: Vec<f64>,
        exponents: Vec<f64>,
    },
    #[serde(skip)]
    Custom(CostFn),
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Combiner {
    /// `outcome − cost`.
    #[default]
    Difference,
    #[serde(skip)]
    Custom(CombineFn),
}

impl fmt::Debug for OutcomeAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => f.write_str("Identity"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl fmt::Debug for CostAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum => f.write_str("Sum"),
            Self::Weighted { weights, exponents } => f
                .debug_struct("Weighted")
                .field("weights", weights)
                .field("exponents", exponents)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl fmt::Debug for Combiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Difference => f.write_str("Difference"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Scored breakdown of one candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Valuation {
    pub outcome: f64,
    pub cost: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueFunction {
    pub outcome: OutcomeAggregator,
    pub cost: CostAggregator,
    pub combiner: Combiner,
}

impl ValueFunction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_outcome_aggregator(
        mut self,
        f: impl Fn(&ValueContext<'_>, f64) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.outcome = OutcomeAggregator::Custom(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_cost_aggregator(
        mut self,
        f: impl Fn(&ValueContext<'_>, &[f64]) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.cost = CostAggregator::Custom(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_cost_weights(mut self, weights: Vec<f64>, exponents: Vec<f64>) -> Self {
        self.cost = CostAggregator::Weighted { weights, exponents };
        self
    }

    #[must_use]
    pub fn with_combiner(
        mut self,
        f: impl Fn(&ValueContext<'_>, f64, f64) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.combiner = Combiner::Custom(Arc::new(f));
        self
    }

    /// Check stage parameters against the number of control signals.
    pub fn validate(&self, num_signals: usize) -> Result<(), EvcError> {
        if let CostAggregator::Weighted { weights, exponents } = &self.cost {
            if weights.len() != num_signals || exponents.len() != num_signals {
                return Err(EvcError::config(format!(
                    "cost weights ({}) and exponents ({}) must match {num_signals} control signals",
                    weights.len(),
                    exponents.len()
                )));
            }
            if weights.iter().chain(exponents).any(|v| !v.is_finite()) {
                return Err(EvcError::config("cost weights and exponents must be finite"));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn aggregate_outcome(&self, ctx: &ValueContext<'_>, outcome: f64) -> f64 {
        match &self.outcome {
            OutcomeAggregator::Identity => outcome,
            OutcomeAggregator::Custom(f) => f(ctx, outcome),
        }
    }

    #[must_use]
    pub fn aggregate_cost(&self, ctx: &ValueContext<'_>, costs: &[f64]) -> f64 {
        match &self.cost {
            CostAggregator::Sum => costs.iter().sum(),
            CostAggregator::Weighted { weights, exponents } => costs
                .iter()
                .zip(weights)
                .zip(exponents)
                .map(|((c, w), e)| w * c.powf(*e))
                .sum(),
            CostAggregator::Custom(f) => f(ctx, costs),
        }
    }

    #[must_use]
    pub fn combine(&self, ctx: &ValueContext<'_>, outcome: f64, cost: f64) -> f64 {
        match &self.combiner {
            Combiner::Difference => outcome - cost,
            Combiner::Custom(f) => f(ctx, outcome, cost),
        }
    }

    /// Run all three stages.
    #[must_use]
    pub fn evaluate(&self, ctx: &ValueContext<'_>, outcome: f64, costs: &[f64]) -> Valuation {
        let outcome = self.aggregate_outcome(ctx, outcome);
        let cost = self.aggregate_cost(ctx, costs);
        Valuation {
            outcome,
            cost,
            value: self.combine(ctx, outcome, cost),
        }
    }
}
