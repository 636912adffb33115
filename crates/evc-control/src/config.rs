//! Controller configuration.
//!
//! Built programmatically through the `with_*` methods, or deserialized from
//! JSON for scenario fixtures. Closures in the value function and in control
//! signal transfer functions cannot come from JSON; they default to the
//! built-ins and are set in code.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::control_signal::ControlSignalSpec;
use crate::error::EvcError;
use crate::graph::InputId;
use crate::ledger::DEFAULT_LEDGER_CAPACITY;
use crate::monitoring::{MonitoredOutput, OutcomeReduction};
use crate::prediction::{DEFAULT_PREDICTION_RATE, EstimatorKind};
use crate::selector::SearchStrategy;
use crate::value::ValueFunction;

/// Controller id used in logs when none is configured.
pub const DEFAULT_CONTROLLER_NAME: &str = "evc";

/// Prediction update rate: one for all inputs, or per-input overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredictionRate {
    Uniform(f64),
    PerInput {
        #[serde(default = "default_rate")]
        default: f64,
        overrides: BTreeMap<InputId, f64>,
    },
}

fn default_rate() -> f64 {
    DEFAULT_PREDICTION_RATE
}

impl PredictionRate {
    #[must_use]
    pub fn rate_for(&self, input: &InputId) -> f64 {
        match self {
            Self::Uniform(r) => *r,
            Self::PerInput { default, overrides } => {
                overrides.get(input).copied().unwrap_or(*default)
            }
        }
    }

    fn rates(&self) -> Vec<f64> {
        match self {
            Self::Uniform(r) => vec![*r],
            Self::PerInput { default, overrides } => {
                std::iter::once(*default).chain(overrides.values().copied()).collect()
            }
        }
    }
}

impl Default for PredictionRate {
    fn default() -> Self {
        Self::Uniform(DEFAULT_PREDICTION_RATE)
    }
}

fn default_name() -> String {
    DEFAULT_CONTROLLER_NAME.to_string()
}

fn default_ledger_capacity() -> usize {
    DEFAULT_LEDGER_CAPACITY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Controller id used in logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Control signals in canonical policy order.
    pub control_signals: Vec<ControlSignalSpec>,
    pub monitor_for_control: Vec<MonitoredOutput>,
    #[serde(default)]
    pub prediction_rate: PredictionRate,
    #[serde(default)]
    pub prediction_estimator: EstimatorKind,
    #[serde(default)]
    pub save_all_policies_and_values: bool,
    /// Per-trial search budget in seconds. Unbounded when absent.
    #[serde(default)]
    pub time_budget_secs: Option<f64>,
    #[serde(default)]
    pub outcome_reduction: OutcomeReduction,
    #[serde(default)]
    pub skip_failed_policies: bool,
    #[serde(default)]
    pub search: SearchStrategy,
    #[serde(default = "default_ledger_capacity")]
    pub ledger_capacity: usize,
    #[serde(default)]
    pub value_function: ValueFunction,
}

impl ControllerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: default_name(),
            control_signals: Vec::new(),
            monitor_for_control: Vec::new(),
            prediction_rate: PredictionRate::default(),
            prediction_estimator: EstimatorKind::default(),
            save_all_policies_and_values: false,
            time_budget_secs: None,
            outcome_reduction: OutcomeReduction::default(),
            skip_failed_policies: false,
            search: SearchStrategy::default(),
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            value_function: ValueFunction::default(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, EvcError> {
        serde_json::from_str(json).map_err(|e| EvcError::config(format!("invalid config: {e}")))
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_signal(mut self, spec: ControlSignalSpec) -> Self {
        self.control_signals.push(spec);
        self
    }

    #[must_use]
    pub fn with_monitor(mut self, output: impl Into<String>, weight: f64, exponent: f64) -> Self {
        self.monitor_for_control
            .push(MonitoredOutput::weighted(output, weight, exponent));
        self
    }

    #[must_use]
    pub fn with_prediction_rate(mut self, rate: PredictionRate) -> Self {
        self.prediction_rate = rate;
        self
    }

    #[must_use]
    pub fn with_estimator(mut self, kind: EstimatorKind) -> Self {
        self.prediction_estimator = kind;
        self
    }

    #[must_use]
    pub fn with_save_all(mut self, on: bool) -> Self {
        self.save_all_policies_and_values = on;
        self
    }

    #[must_use]
    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget_secs = Some(budget.as_secs_f64());
        self
    }

    #[must_use]
    pub fn with_outcome_reduction(mut self, reduction: OutcomeReduction) -> Self {
        self.outcome_reduction = reduction;
        self
    }

    #[must_use]
    pub fn with_skip_failed(mut self, on: bool) -> Self {
        self.skip_failed_policies = on;
        self
    }

    #[must_use]
    pub fn with_search(mut self, search: SearchStrategy) -> Self {
        self.search = search;
        self
    }

    #[must_use]
    pub fn with_ledger_capacity(mut self, capacity: usize) -> Self {
        self.ledger_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_value_function(mut self, value_function: ValueFunction) -> Self {
        self.value_function = value_function;
        self
    }

    /// Parsed time budget.
    pub fn time_budget(&self) -> Result<Option<Duration>, EvcError> {
        self.time_budget_secs
            .map(|secs| {
                Duration::try_from_secs_f64(secs).map_err(|_| {
                    EvcError::config(format!(
                        "time budget must be a finite non-negative number of seconds, got {secs}"
                    ))
                })
            })
            .transpose()
    }

    /// Checks that do not need the graph.
    pub fn validate(&self) -> Result<(), EvcError> {
        if self.name.trim().is_empty() {
            return Err(EvcError::config("controller name must not be empty"));
        }
        if self.control_signals.is_empty() {
            return Err(EvcError::config("control_signals must not be empty"));
        }
        if self.monitor_for_control.is_empty() {
            return Err(EvcError::config("monitor_for_control must not be empty"));
        }
        if let Some(bad) = self
            .prediction_rate
            .rates()
            .into_iter()
            .find(|r| !(*r > 0.0 && *r <= 1.0))
        {
            return Err(EvcError::config(format!(
                "prediction rate {bad} is outside (0, 1]"
            )));
        }
        if self.ledger_capacity == 0 {
            return Err(EvcError::config("ledger_capacity must be at least 1"));
        }
        self.time_budget()?;
        self.value_function.validate(self.control_signals.len())
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new()
    }
}
