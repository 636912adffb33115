#![allow(dead_code)]

use evc_control::{
    GraphError, InputPort, OutputId, ParameterId, ParameterOverrides, ProcessingGraph, Value,
};

#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1_u64 << 53) as f64
    }
}

pub fn gain(j: usize) -> ParameterId {
    ParameterId::new(format!("gain{j}"))
}

/// `out_j = gain_j`. Real trials are appended to `history`; simulated ones
/// only bump `trials`, which snapshots cover.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityGraph {
    pub gains: Vec<f64>,
    pub trials: u64,
    pub history: Vec<Vec<f64>>,
}

impl IdentityGraph {
    pub fn new(n: usize) -> Self {
        Self {
            gains: vec![0.0; n],
            trials: 0,
            history: Vec::new(),
        }
    }
}

impl ProcessingGraph for IdentityGraph {
    type Snapshot = IdentityGraph;

    fn inputs(&self) -> Vec<InputPort> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<OutputId> {
        (0..self.gains.len())
            .map(|j| OutputId::new(format!("out{j}")))
            .collect()
    }

    fn has_parameter(&self, id: &ParameterId) -> bool {
        (0..self.gains.len()).any(|j| gain(j) == *id)
    }

    fn execute(
        &mut self,
        _inputs: &[Value],
        overrides: &ParameterOverrides,
        simulation: bool,
    ) -> Result<Vec<Value>, GraphError> {
        self.trials += 1;
        let out: Vec<f64> = (0..self.gains.len())
            .map(|j| overrides.get(&gain(j)).copied().unwrap_or(self.gains[j]))
            .collect();
        if !simulation {
            self.history.push(out.clone());
        }
        Ok(out.into_iter().map(|v| vec![v]).collect())
    }

    fn snapshot(&self) -> Self::Snapshot {
        self.clone()
    }

    fn restore(&mut self, snapshot: &Self::Snapshot) -> Result<(), GraphError> {
        *self = snapshot.clone();
        Ok(())
    }
}

/// One input `stimulus`, one parameter `gain0`, integrating
/// `acc += gain0 * stimulus`; reports `acc` as `out0`.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatorGraph {
    pub acc: f64,
    pub executions: u64,
}

impl AccumulatorGraph {
    pub fn new(acc: f64) -> Self {
        Self { acc, executions: 0 }
    }
}

impl ProcessingGraph for AccumulatorGraph {
    type Snapshot = (f64, u64);

    fn inputs(&self) -> Vec<InputPort> {
        vec![InputPort::new("stimulus", 1)]
    }

    fn outputs(&self) -> Vec<OutputId> {
        vec![OutputId::new("out0")]
    }

    fn has_parameter(&self, id: &ParameterId) -> bool {
        *id == gain(0)
    }

    fn execute(
        &mut self,
        inputs: &[Value],
        overrides: &ParameterOverrides,
        _simulation: bool,
    ) -> Result<Vec<Value>, GraphError> {
        evc_control::graph::check_inputs(&self.inputs(), inputs)?;
        let g = overrides.get(&gain(0)).copied().unwrap_or(1.0);
        self.acc += g * inputs[0][0];
        self.executions += 1;
        Ok(vec![vec![self.acc]])
    }

    fn snapshot(&self) -> Self::Snapshot {
        (self.acc, self.executions)
    }

    fn restore(&mut self, snapshot: &Self::Snapshot) -> Result<(), GraphError> {
        (self.acc, self.executions) = *snapshot;
        Ok(())
    }
}
