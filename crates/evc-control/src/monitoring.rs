//! Objective mechanism: weighted, exponentiated monitored outputs reduced
//! to one scalar outcome.
//!
//! Each entry contributes `vᵢ = wᵢ · oᵢ^{eᵢ}` elementwise. The product
//! reduction multiplies the `vᵢ` elementwise and sums the result; the sum
//! reduction adds everything. Length-1 outputs broadcast against longer
//! ones under the product reduction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EvcError;
use crate::graph::{OutputId, Value};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MonitoringError {
    #[error("monitored output '{output}' has width {actual}, expected {expected}")]
    ShapeMismatch {
        output: OutputId,
        expected: usize,
        actual: usize,
    },
    #[error("monitored output '{output}' element {index} is negative ({base}) under non-integer exponent {exponent}")]
    NegativeBase {
        output: OutputId,
        index: usize,
        base: f64,
        exponent: f64,
    },
    #[error("monitored output '{0}' is missing from the graph result")]
    MissingOutput(OutputId),
    #[error("outcome is not finite ({0})")]
    NonFiniteOutcome(f64),
    #[error("value function returned NaN")]
    NanValue,
}

fn unit() -> f64 {
    1.0
}

/// One `(output, weight, exponent)` triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredOutput {
    pub output: OutputId,
    #[serde(default = "unit")]
    pub weight: f64,
    #[serde(default = "unit")]
    pub exponent: f64,
}

impl MonitoredOutput {
    #[must_use]
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: OutputId::new(output),
            weight: 1.0,
            exponent: 1.0,
        }
    }

    #[must_use]
    pub fn weighted(output: impl Into<String>, weight: f64, exponent: f64) -> Self {
        Self {
            output: OutputId::new(output),
            weight,
            exponent,
        }
    }

    /// Zip parallel output/weight/exponent lists into triples.
    pub fn from_parallel(
        outputs: &[&str],
        weights: &[f64],
        exponents: &[f64],
    ) -> Result<Vec<Self>, EvcError> {
        if weights.len() != outputs.len() || exponents.len() != outputs.len() {
            return Err(EvcError::config(format!(
                "monitoring spec lists {} outputs but {} weights and {} exponents",
                outputs.len(),
                weights.len(),
                exponents.len()
            )));
        }
        Ok(outputs
            .iter()
            .zip(weights)
            .zip(exponents)
            .map(|((o, w), e)| Self::weighted(*o, *w, *e))
            .collect())
    }
}

/// Reduction applied across monitored entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeReduction {
    #[default]
    Product,
    Sum,
}

impl OutcomeReduction {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "product" | "prod" | "multiply" => Some(Self::Product),
            "sum" | "add" => Some(Self::Sum),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ResolvedEntry {
    output: OutputId,
    index: usize,
    weight: f64,
    exponent: f64,
}

/// Monitoring mechanism resolved against a graph's output ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringMechanism {
    entries: Vec<ResolvedEntry>,
    reduction: OutcomeReduction,
}

impl MonitoringMechanism {
    pub fn new(
        spec: &[MonitoredOutput],
        graph_outputs: &[OutputId],
        reduction: OutcomeReduction,
    ) -> Result<Self, EvcError> {
        if spec.is_empty() {
            return Err(EvcError::config(
                "monitor_for_control must name at least one output",
            ));
        }
        let mut entries = Vec::with_capacity(spec.len());
        for m in spec {
            let index = graph_outputs
                .iter()
                .position(|o| *o == m.output)
                .ok_or_else(|| {
                    EvcError::config(format!(
                        "monitored output '{}' is not produced by the graph",
                        m.output
                    ))
                })?;
            if !m.weight.is_finite() || !m.exponent.is_finite() {
                return Err(EvcError::config(format!(
                    "monitored output '{}' has a non-finite weight or exponent",
                    m.output
                )));
            }
            entries.push(ResolvedEntry {
                output: m.output.clone(),
                index,
                weight: m.weight,
                exponent: m.exponent,
            });
        }
        Ok(Self { entries, reduction })
    }

    #[must_use]
    pub fn reduction(&self) -> OutcomeReduction {
        self.reduction
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reduce one trial's graph outputs to a scalar outcome.
    pub fn evaluate(&self, outputs: &[Value]) -> Result<f64, MonitoringError> {
        let mut terms: Vec<Value> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let raw = outputs
                .get(entry.index)
                .ok_or_else(|| MonitoringError::MissingOutput(entry.output.clone()))?;
            terms.push(weighted_power(entry, raw)?);
        }

        let outcome: f64 = match self.reduction {
            OutcomeReduction::Sum => terms.iter().flatten().sum(),
            OutcomeReduction::Product => {
                let width = terms.iter().map(Vec::len).max().unwrap_or(0);
                let mut acc = vec![1.0; width];
                for (entry, term) in self.entries.iter().zip(&terms) {
                    match term.len() {
                        1 => acc.iter_mut().for_each(|a| *a *= term[0]),
                        n if n == width => {
                            acc.iter_mut().zip(term).for_each(|(a, t)| *a *= t);
                        }
                        n => {
                            return Err(MonitoringError::ShapeMismatch {
                                output: entry.output.clone(),
                                expected: width,
                                actual: n,
                            });
                        }
                    }
                }
                acc.iter().sum()
            }
        };

        if outcome.is_finite() {
            Ok(outcome)
        } else {
            Err(MonitoringError::NonFiniteOutcome(outcome))
        }
    }
}

fn weighted_power(entry: &ResolvedEntry, raw: &[f64]) -> Result<Value, MonitoringError> {
    raw.iter()
        .enumerate()
        .map(|(index, &o)| {
            if o < 0.0 && entry.exponent.fract() != 0.0 {
                return Err(MonitoringError::NegativeBase {
                    output: entry.output.clone(),
                    index,
                    base: o,
                    exponent: entry.exponent,
                });
            }
            let powered = if entry.exponent == 1.0 {
                o
            } else {
                o.powf(entry.exponent)
            };
            Ok(entry.weight * powered)
        })
        .collect()
}
