//! Scenario fixture loading.

use evc_control::ControllerConfig;
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::graph::GraphSpec;

fn default_tolerance() -> f64 {
    1e-9
}

/// What the runner drives the controller through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioMode {
    /// `step` once per trial input.
    #[default]
    Step,
    /// `execute_trial` once per trial input.
    Execute,
    /// `step` once per trial input, then one `select` without commit.
    Select,
}

/// Expected results. Absent fields are not checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Expectation {
    /// Policy committed by the last step, or chosen by the final select.
    pub policy: Option<Vec<f64>>,
    pub row: Option<usize>,
    pub value: Option<f64>,
    /// Value of every row in row order; needs `save_all_policies_and_values`.
    pub row_values: Option<Vec<f64>>,
    pub predicted_inputs: Option<Vec<Vec<f64>>>,
    /// `ErrorKind` name of the first failing call.
    pub error_kind: Option<String>,
    pub poisoned: Option<bool>,
    /// Graph state digest equal before and after the final select.
    pub state_unchanged: Option<bool>,
    pub tolerance: f64,
}

impl Default for Expectation {
    fn default() -> Self {
        Self {
            policy: None,
            row: None,
            value: None,
            row_values: None,
            predicted_inputs: None,
            error_kind: None,
            poisoned: None,
            state_unchanged: None,
            tolerance: default_tolerance(),
        }
    }
}

/// A single scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioCase {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub graph: GraphSpec,
    /// Initial integrator values, in declaration order.
    #[serde(default)]
    pub accumulators: Option<Vec<f64>>,
    pub controller: ControllerConfig,
    #[serde(default)]
    pub mode: ScenarioMode,
    /// One entry per outer trial: one value per graph input.
    #[serde(default)]
    pub trials: Vec<Vec<Vec<f64>>>,
    pub expect: Expectation,
}

/// A collection of scenarios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSet {
    pub version: String,
    pub family: String,
    pub captured_at: String,
    pub cases: Vec<ScenarioCase>,
}

impl ScenarioSet {
    pub fn from_json(json: &str) -> Result<Self, HarnessError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, HarnessError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, HarnessError> {
        let content = std::fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        Self::from_json(&content)
    }
}
