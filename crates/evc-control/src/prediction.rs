//! Prediction mechanisms: one running estimate per external input.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{InputId, InputPort, Value};

/// Default update rate of the exponential moving average.
pub const DEFAULT_PREDICTION_RATE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredictionError {
    #[error("input '{input}' expects width {expected}, observed {actual}")]
    ShapeMismatch {
        input: InputId,
        expected: usize,
        actual: usize,
    },
    #[error("input '{input}' observed a non-finite value at element {index}")]
    NonFinite { input: InputId, index: usize },
    #[error("expected {expected} trial inputs, got {actual}")]
    InputCount { expected: usize, actual: usize },
}

/// Update/query contract shared by all estimators.
pub trait InputEstimator: Send + Sync + fmt::Debug {
    /// Fold one observation into the estimate.
    fn observe(&mut self, x: &[f64]);

    /// Current estimate. Must not mutate.
    fn predict(&self) -> &[f64];
}

/// `μ ← (1 − r)·μ + r·x`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialAverage {
    rate: f64,
    mean: Vec<f64>,
}

impl ExponentialAverage {
    /// Starts at zero. `rate` must lie in `(0, 1]`.
    #[must_use]
    pub fn new(width: usize, rate: f64) -> Self {
        Self {
            rate,
            mean: vec![0.0; width],
        }
    }

    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl InputEstimator for ExponentialAverage {
    fn observe(&mut self, x: &[f64]) {
        let r = self.rate;
        for (m, v) in self.mean.iter_mut().zip(x) {
            *m = (1.0 - r) * *m + r * v;
        }
    }

    fn predict(&self) -> &[f64] {
        &self.mean
    }
}

/// Arithmetic mean of every observation so far.
#[derive(Debug, Clone, PartialEq)]
pub struct CumulativeAverage {
    count: u64,
    mean: Vec<f64>,
}

impl CumulativeAverage {
    #[must_use]
    pub fn new(width: usize) -> Self {
        Self {
            count: 0,
            mean: vec![0.0; width],
        }
    }
}

impl InputEstimator for CumulativeAverage {
    fn observe(&mut self, x: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for (m, v) in self.mean.iter_mut().zip(x) {
            *m += (v - *m) / n;
        }
    }

    fn predict(&self) -> &[f64] {
        &self.mean
    }
}

/// Built-in estimator families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    #[default]
    ExponentialAverage,
    CumulativeAverage,
}

impl EstimatorKind {
    #[must_use]
    pub fn build(self, width: usize, rate: f64) -> Box<dyn InputEstimator> {
        match self {
            Self::ExponentialAverage => Box::new(ExponentialAverage::new(width, rate)),
            Self::CumulativeAverage => Box::new(CumulativeAverage::new(width)),
        }
    }
}

/// Estimator bound to one external input of the graph.
#[derive(Debug)]
pub struct PredictionMechanism {
    input: InputId,
    width: usize,
    observations: u64,
    estimator: Box<dyn InputEstimator>,
}

impl PredictionMechanism {
    #[must_use]
    pub fn new(port: &InputPort, estimator: Box<dyn InputEstimator>) -> Self {
        Self {
            input: port.id.clone(),
            width: port.width,
            observations: 0,
            estimator,
        }
    }

    #[must_use]
    pub fn exponential(port: &InputPort, rate: f64) -> Self {
        Self::new(port, Box::new(ExponentialAverage::new(port.width, rate)))
    }

    /// Reject observations the estimator must not see.
    pub fn check(&self, x: &[f64]) -> Result<(), PredictionError> {
        if x.len() != self.width {
            return Err(PredictionError::ShapeMismatch {
                input: self.input.clone(),
                expected: self.width,
                actual: x.len(),
            });
        }
        if let Some(index) = x.iter().position(|v| !v.is_finite()) {
            return Err(PredictionError::NonFinite {
                input: self.input.clone(),
                index,
            });
        }
        Ok(())
    }

    pub fn observe(&mut self, x: &[f64]) -> Result<(), PredictionError> {
        self.check(x)?;
        self.estimator.observe(x);
        self.observations += 1;
        Ok(())
    }

    #[must_use]
    pub fn predict(&self) -> Value {
        self.estimator.predict().to_vec()
    }

    #[must_use]
    pub fn input(&self) -> &InputId {
        &self.input
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn observations(&self) -> u64 {
        self.observations
    }
}
