//! Declarative processing graph for scenario fixtures.
//!
//! Nodes are scalar and listed in evaluation order: a node may only read
//! nodes declared before it. `integrator` nodes carry state across trials,
//! and that state (plus the trial counters) is what a snapshot covers.

use std::collections::{BTreeMap, HashMap};

use evc_control::{
    GraphError, InputId, InputPort, OutputId, ParameterId, ParameterOverrides, ProcessingGraph,
    Value,
};
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

/// Operation computed by one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NodeOp {
    /// Reads a width-1 graph input.
    Input { input: String },
    Constant { value: f64 },
    /// Current value of a named parameter, after overrides.
    Parameter { parameter: String },
    /// `parameter * source`.
    Scale { source: String, parameter: String },
    Sum { sources: Vec<String> },
    Product { sources: Vec<String> },
    /// `1 / (1 + exp(-gain * (source - bias)))`.
    Logistic { source: String, gain: f64, bias: f64 },
    /// `acc += rate * source`; reports `acc`.
    Integrator { source: String, rate: f64 },
    /// Passes `source` through; the trial fails once it exceeds `max`.
    Guard { source: String, max: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(flatten)]
    pub op: NodeOp,
}

/// Serializable graph description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    /// Input names, each width 1, in canonical order.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Parameters and their stored values.
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    pub nodes: Vec<NodeSpec>,
    /// Node names reported as outputs, in canonical order.
    pub outputs: Vec<String>,
    /// Make every restore fail, for rollback scenarios.
    #[serde(default)]
    pub fail_restore: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Input(usize),
    Constant(f64),
    Parameter(usize),
    Scale { source: usize, parameter: usize },
    Sum(Vec<usize>),
    Product(Vec<usize>),
    Logistic { source: usize, gain: f64, bias: f64 },
    Integrator { source: usize, rate: f64, slot: usize },
    Guard { source: usize, max: f64 },
}

/// Mutable state of a [`ScenarioGraph`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphState {
    pub accumulators: Vec<f64>,
    /// Every executed trial, simulated or not.
    pub trials: u64,
    /// Trials run with `simulation = false`.
    pub real_trials: u64,
}

#[derive(Debug, Clone)]
pub struct ScenarioGraph {
    inputs: Vec<InputId>,
    parameters: Vec<(ParameterId, f64)>,
    ops: Vec<Op>,
    names: Vec<String>,
    outputs: Vec<(OutputId, usize)>,
    fail_restore: bool,
    state: GraphState,
}

impl ScenarioGraph {
    pub fn from_spec(spec: &GraphSpec) -> Result<Self, HarnessError> {
        let inputs: Vec<InputId> = spec.inputs.iter().map(InputId::new).collect();
        let parameters: Vec<(ParameterId, f64)> = spec
            .parameters
            .iter()
            .map(|(k, v)| (ParameterId::new(k.as_str()), *v))
            .collect();
        if let Some((id, v)) = parameters.iter().find(|(_, v)| !v.is_finite()) {
            return Err(HarnessError::Graph(format!(
                "parameter '{id}' has non-finite value {v}"
            )));
        }

        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut ops = Vec::with_capacity(spec.nodes.len());
        let mut slots = 0;
        for node in &spec.nodes {
            let source = |name: &str| {
                index.get(name).copied().ok_or_else(|| {
                    HarnessError::Graph(format!(
                        "node '{}' reads '{name}', which is not declared before it",
                        node.name
                    ))
                })
            };
            let parameter = |name: &str| {
                parameters
                    .iter()
                    .position(|(id, _)| id.as_str() == name)
                    .ok_or_else(|| {
                        HarnessError::Graph(format!(
                            "node '{}' uses unknown parameter '{name}'",
                            node.name
                        ))
                    })
            };
            let op = match &node.op {
                NodeOp::Input { input } => Op::Input(
                    inputs
                        .iter()
                        .position(|id| id.as_str() == input)
                        .ok_or_else(|| {
                            HarnessError::Graph(format!(
                                "node '{}' reads unknown input '{input}'",
                                node.name
                            ))
                        })?,
                ),
                NodeOp::Constant { value } => Op::Constant(*value),
                NodeOp::Parameter { parameter: p } => Op::Parameter(parameter(p.as_str())?),
                NodeOp::Scale {
                    source: s,
                    parameter: p,
                } => Op::Scale {
                    source: source(s.as_str())?,
                    parameter: parameter(p.as_str())?,
                },
                NodeOp::Sum { sources } => Op::Sum(
                    sources
                        .iter()
                        .map(|s| source(s.as_str()))
                        .collect::<Result<_, _>>()?,
                ),
                NodeOp::Product { sources } => Op::Product(
                    sources
                        .iter()
                        .map(|s| source(s.as_str()))
                        .collect::<Result<_, _>>()?,
                ),
                NodeOp::Logistic {
                    source: s,
                    gain,
                    bias,
                } => Op::Logistic {
                    source: source(s.as_str())?,
                    gain: *gain,
                    bias: *bias,
                },
                NodeOp::Integrator { source: s, rate } => {
                    slots += 1;
                    Op::Integrator {
                        source: source(s.as_str())?,
                        rate: *rate,
                        slot: slots - 1,
                    }
                }
                NodeOp::Guard { source: s, max } => Op::Guard {
                    source: source(s.as_str())?,
                    max: *max,
                },
            };
            if index.insert(node.name.as_str(), ops.len()).is_some() {
                return Err(HarnessError::Graph(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
            ops.push(op);
        }

        let outputs = spec
            .outputs
            .iter()
            .map(|name| {
                index
                    .get(name.as_str())
                    .map(|&i| (OutputId::new(name.as_str()), i))
                    .ok_or_else(|| HarnessError::Graph(format!("unknown output node '{name}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if outputs.is_empty() {
            return Err(HarnessError::Graph("graph reports no outputs".into()));
        }

        Ok(Self {
            inputs,
            parameters,
            ops,
            names: spec.nodes.iter().map(|n| n.name.clone()).collect(),
            outputs,
            fail_restore: spec.fail_restore,
            state: GraphState {
                accumulators: vec![0.0; slots],
                trials: 0,
                real_trials: 0,
            },
        })
    }

    pub fn from_json(json: &str) -> Result<Self, HarnessError> {
        let spec: GraphSpec = serde_json::from_str(json)?;
        Self::from_spec(&spec)
    }

    #[must_use]
    pub fn state(&self) -> &GraphState {
        &self.state
    }

    /// Seed integrator accumulators, in declaration order.
    pub fn set_accumulators(&mut self, values: &[f64]) -> Result<(), HarnessError> {
        if values.len() != self.state.accumulators.len() {
            return Err(HarnessError::Graph(format!(
                "graph has {} integrators, got {} initial values",
                self.state.accumulators.len(),
                values.len()
            )));
        }
        self.state.accumulators.copy_from_slice(values);
        Ok(())
    }

    /// BLAKE3 digest of the mutable state, as lowercase hex.
    #[must_use]
    pub fn state_digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for acc in &self.state.accumulators {
            hasher.update(&acc.to_bits().to_le_bytes());
        }
        hasher.update(&self.state.trials.to_le_bytes());
        hasher.update(&self.state.real_trials.to_le_bytes());
        hasher.finalize().to_hex().to_string()
    }

    fn parameter_values(&self, overrides: &ParameterOverrides) -> Result<Vec<f64>, GraphError> {
        if let Some(id) = overrides
            .keys()
            .find(|id| !self.parameters.iter().any(|(p, _)| p == *id))
        {
            return Err(GraphError::UnknownParameter(id.clone()));
        }
        Ok(self
            .parameters
            .iter()
            .map(|(id, v)| overrides.get(id).copied().unwrap_or(*v))
            .collect())
    }
}

impl ProcessingGraph for ScenarioGraph {
    type Snapshot = GraphState;

    fn inputs(&self) -> Vec<InputPort> {
        self.inputs
            .iter()
            .map(|id| InputPort::new(id.as_str(), 1))
            .collect()
    }

    fn outputs(&self) -> Vec<OutputId> {
        self.outputs.iter().map(|(id, _)| id.clone()).collect()
    }

    fn has_parameter(&self, id: &ParameterId) -> bool {
        self.parameters.iter().any(|(p, _)| p == id)
    }

    fn execute(
        &mut self,
        inputs: &[Value],
        overrides: &ParameterOverrides,
        simulation: bool,
    ) -> Result<Vec<Value>, GraphError> {
        evc_control::graph::check_inputs(&self.inputs(), inputs)?;
        let params = self.parameter_values(overrides)?;

        let mut accumulators = self.state.accumulators.clone();
        let mut vals: Vec<f64> = Vec::with_capacity(self.ops.len());
        for (i, op) in self.ops.iter().enumerate() {
            let v = match op {
                Op::Input(k) => inputs[*k][0],
                Op::Constant(c) => *c,
                Op::Parameter(p) => params[*p],
                Op::Scale { source, parameter } => params[*parameter] * vals[*source],
                Op::Sum(sources) => sources.iter().map(|s| vals[*s]).sum(),
                Op::Product(sources) => sources.iter().map(|s| vals[*s]).product(),
                Op::Logistic { source, gain, bias } => {
                    1.0 / (1.0 + (-gain * (vals[*source] - bias)).exp())
                }
                Op::Integrator { source, rate, slot } => {
                    accumulators[*slot] += rate * vals[*source];
                    accumulators[*slot]
                }
                Op::Guard { source, max } => {
                    if vals[*source] > *max {
                        return Err(GraphError::Execution(format!(
                            "node '{}' saw {} above limit {max}",
                            self.names[i], vals[*source]
                        )));
                    }
                    vals[*source]
                }
            };
            if !v.is_finite() {
                return Err(GraphError::Execution(format!(
                    "node '{}' produced non-finite value {v}",
                    self.names[i]
                )));
            }
            vals.push(v);
        }

        self.state.accumulators = accumulators;
        self.state.trials += 1;
        if !simulation {
            self.state.real_trials += 1;
        }
        Ok(self.outputs.iter().map(|(_, i)| vec![vals[*i]]).collect())
    }

    fn snapshot(&self) -> Self::Snapshot {
        self.state.clone()
    }

    fn restore(&mut self, snapshot: &Self::Snapshot) -> Result<(), GraphError> {
        if self.fail_restore {
            return Err(GraphError::Restore("restore disabled for this graph".into()));
        }
        self.state = snapshot.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STROOP: &str = r#"{
        "inputs": ["color"],
        "parameters": {"gain": 1.0},
        "nodes": [
            {"name": "color", "op": "input", "input": "color"},
            {"name": "scaled", "op": "scale", "source": "color", "parameter": "gain"},
            {"name": "evidence", "op": "integrator", "source": "scaled", "rate": 0.5},
            {"name": "response", "op": "logistic", "source": "evidence", "gain": 1.0, "bias": 0.0}
        ],
        "outputs": ["evidence", "response"]
    }"#;

    fn overrides(gain: f64) -> ParameterOverrides {
        let mut o = ParameterOverrides::new();
        o.insert(ParameterId::new("gain"), gain);
        o
    }

    #[test]
    fn parses_and_reports_ports() {
        let g = ScenarioGraph::from_json(STROOP).unwrap();
        assert_eq!(g.inputs(), vec![InputPort::new("color", 1)]);
        assert_eq!(
            g.outputs(),
            vec![OutputId::new("evidence"), OutputId::new("response")]
        );
        assert!(g.has_parameter(&ParameterId::new("gain")));
        assert!(!g.has_parameter(&ParameterId::new("bias")));
    }

    #[test]
    fn integrator_accumulates_with_override() {
        let mut g = ScenarioGraph::from_json(STROOP).unwrap();
        let out = g.execute(&[vec![2.0]], &overrides(3.0), false).unwrap();
        assert_eq!(out[0], vec![3.0]);
        assert!((out[1][0] - 1.0 / (1.0 + (-3.0_f64).exp())).abs() < 1e-12);
        let out = g.execute(&[vec![2.0]], &ParameterOverrides::new(), false).unwrap();
        assert_eq!(out[0], vec![4.0]);
        assert_eq!(g.state().real_trials, 2);
    }

    #[test]
    fn sum_product_and_logistic_nodes() {
        let mut g = ScenarioGraph::from_json(
            r#"{
                "inputs": ["a", "b"],
                "nodes": [
                    {"name": "a", "op": "input", "input": "a"},
                    {"name": "b", "op": "input", "input": "b"},
                    {"name": "total", "op": "sum", "sources": ["a", "b"]},
                    {"name": "both", "op": "product", "sources": ["a", "b"]},
                    {"name": "squash", "op": "logistic", "source": "total", "gain": 2.0, "bias": 5.0}
                ],
                "outputs": ["total", "both", "squash"]
            }"#,
        )
        .unwrap();
        let out = g
            .execute(&[vec![2.0], vec![3.0]], &ParameterOverrides::new(), false)
            .unwrap();
        assert_eq!(out[0], vec![5.0]);
        assert_eq!(out[1], vec![6.0]);
        assert_eq!(out[2], vec![0.5]);
    }

    #[test]
    fn snapshot_restore_round_trip_changes_digest_back() {
        let mut g = ScenarioGraph::from_json(STROOP).unwrap();
        let digest = g.state_digest();
        let snap = g.snapshot();
        g.execute(&[vec![1.0]], &overrides(1.0), true).unwrap();
        assert_ne!(g.state_digest(), digest);
        g.restore(&snap).unwrap();
        assert_eq!(g.state_digest(), digest);
    }

    #[test]
    fn simulated_trials_do_not_count_as_real() {
        let mut g = ScenarioGraph::from_json(STROOP).unwrap();
        g.execute(&[vec![1.0]], &overrides(1.0), true).unwrap();
        assert_eq!(g.state().trials, 1);
        assert_eq!(g.state().real_trials, 0);
    }

    #[test]
    fn rejects_forward_references() {
        let err = ScenarioGraph::from_json(
            r#"{
                "nodes": [
                    {"name": "a", "op": "sum", "sources": ["b"]},
                    {"name": "b", "op": "constant", "value": 1.0}
                ],
                "outputs": ["a"]
            }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not declared before"));
    }

    #[test]
    fn rejects_unknown_names() {
        let unknown_param = r#"{
            "nodes": [{"name": "p", "op": "parameter", "parameter": "missing"}],
            "outputs": ["p"]
        }"#;
        assert!(ScenarioGraph::from_json(unknown_param).is_err());
        let unknown_output = r#"{
            "nodes": [{"name": "c", "op": "constant", "value": 1.0}],
            "outputs": ["nope"]
        }"#;
        assert!(ScenarioGraph::from_json(unknown_output).is_err());
    }

    #[test]
    fn unknown_override_is_rejected() {
        let mut g = ScenarioGraph::from_json(STROOP).unwrap();
        let mut o = ParameterOverrides::new();
        o.insert(ParameterId::new("bias"), 1.0);
        assert_eq!(
            g.execute(&[vec![1.0]], &o, true).unwrap_err(),
            GraphError::UnknownParameter(ParameterId::new("bias"))
        );
    }

    #[test]
    fn guard_fails_trial_without_counting_it() {
        let mut g = ScenarioGraph::from_json(
            r#"{
                "parameters": {"gain": 0.0},
                "nodes": [
                    {"name": "g", "op": "parameter", "parameter": "gain"},
                    {"name": "checked", "op": "guard", "source": "g", "max": 0.5}
                ],
                "outputs": ["checked"]
            }"#,
        )
        .unwrap();
        let mut o = ParameterOverrides::new();
        o.insert(ParameterId::new("gain"), 0.9);
        assert!(matches!(
            g.execute(&[], &o, true),
            Err(GraphError::Execution(_))
        ));
        assert_eq!(g.state().trials, 0);
    }

    #[test]
    fn seeded_accumulators_checked() {
        let mut g = ScenarioGraph::from_json(STROOP).unwrap();
        g.set_accumulators(&[2.5]).unwrap();
        assert_eq!(g.state().accumulators, vec![2.5]);
        assert!(g.set_accumulators(&[1.0, 2.0]).is_err());
    }
}
