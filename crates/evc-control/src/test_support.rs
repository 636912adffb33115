//! Small deterministic graphs for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::graph::{
    GraphError, InputPort, OutputId, ParameterId, ParameterOverrides, ProcessingGraph, Value,
    check_inputs,
};

fn param(j: usize) -> ParameterId {
    ParameterId::new(format!("gain{j}"))
}

fn output(j: usize) -> OutputId {
    OutputId::new(format!("out{j}"))
}

/// `out_j = gain_j`. No inputs.
#[derive(Debug, Clone)]
pub struct GainGraph {
    gains: Vec<f64>,
    trials: u64,
    calls: Arc<AtomicUsize>,
}

impl GainGraph {
    pub fn new(n: usize) -> Self {
        Self {
            gains: vec![0.0; n],
            trials: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Executions across every clone, simulated or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn trials(&self) -> u64 {
        self.trials
    }
}

impl ProcessingGraph for GainGraph {
    type Snapshot = (Vec<f64>, u64);

    fn inputs(&self) -> Vec<InputPort> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<OutputId> {
        (0..self.gains.len()).map(output).collect()
    }

    fn has_parameter(&self, id: &ParameterId) -> bool {
        (0..self.gains.len()).any(|j| param(j) == *id)
    }

    fn execute(
        &mut self,
        inputs: &[Value],
        overrides: &ParameterOverrides,
        _simulation: bool,
    ) -> Result<Vec<Value>, GraphError> {
        check_inputs(&self.inputs(), inputs)?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.trials += 1;
        Ok((0..self.gains.len())
            .map(|j| vec![overrides.get(&param(j)).copied().unwrap_or(self.gains[j])])
            .collect())
    }

    fn snapshot(&self) -> Self::Snapshot {
        (self.gains.clone(), self.trials)
    }

    fn restore(&mut self, snapshot: &Self::Snapshot) -> Result<(), GraphError> {
        self.gains.clone_from(&snapshot.0);
        self.trials = snapshot.1;
        Ok(())
    }
}

/// One input, one parameter; `acc += rate * gain0 * stimulus`, `out0 = acc`.
#[derive(Debug, Clone)]
pub struct IntegratorGraph {
    rate: f64,
    acc: f64,
    executions: u64,
}

impl IntegratorGraph {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            acc: 0.0,
            executions: 0,
        }
    }

    pub fn accumulator(&self) -> f64 {
        self.acc
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }
}

impl ProcessingGraph for IntegratorGraph {
    type Snapshot = (f64, u64);

    fn inputs(&self) -> Vec<InputPort> {
        vec![InputPort::new("stimulus", 1)]
    }

    fn outputs(&self) -> Vec<OutputId> {
        vec![output(0)]
    }

    fn has_parameter(&self, id: &ParameterId) -> bool {
        *id == param(0)
    }

    fn execute(
        &mut self,
        inputs: &[Value],
        overrides: &ParameterOverrides,
        _simulation: bool,
    ) -> Result<Vec<Value>, GraphError> {
        check_inputs(&self.inputs(), inputs)?;
        let gain = overrides.get(&param(0)).copied().unwrap_or(1.0);
        self.acc += self.rate * gain * inputs[0][0];
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

/// Mutates a counter, then fails when `gain0` is one of `fail_on`.
/// `out0 = gain0` otherwise.
#[derive(Debug, Clone)]
pub struct FailingGraph {
    fail_on: Vec<f64>,
    counter: u64,
    broken_restore: bool,
    /// Sleep per execution; `None` as gain matches every execution.
    delays: Vec<(Option<f64>, Duration)>,
}

impl FailingGraph {
    pub fn new(fail_on: Vec<f64>) -> Self {
        Self {
            fail_on,
            counter: 0,
            broken_restore: false,
            delays: Vec::new(),
        }
    }

    /// Sleep for `pause` on every execution.
    pub fn with_pace(mut self, pause: Duration) -> Self {
        self.delays.push((None, pause));
        self
    }

    /// Sleep for `pause` whenever `gain0 == gain`.
    pub fn with_delay_on(mut self, gain: f64, pause: Duration) -> Self {
        self.delays.push((Some(gain), pause));
        self
    }

    pub fn with_broken_restore(mut self) -> Self {
        self.broken_restore = true;
        self
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl ProcessingGraph for FailingGraph {
    type Snapshot = u64;

    fn inputs(&self) -> Vec<InputPort> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<OutputId> {
        vec![output(0)]
    }

    fn has_parameter(&self, id: &ParameterId) -> bool {
        *id == param(0)
    }

    fn execute(
        &mut self,
        _inputs: &[Value],
        overrides: &ParameterOverrides,
        _simulation: bool,
    ) -> Result<Vec<Value>, GraphError> {
        self.counter += 1;
        let gain = overrides.get(&param(0)).copied().unwrap_or(0.0);
        for (on, pause) in &self.delays {
            if on.is_none_or(|g| g == gain) {
                std::thread::sleep(*pause);
            }
        }
        if self.fail_on.contains(&gain) {
            return Err(GraphError::Execution(format!("gain {gain} diverged")));
        }
        Ok(vec![vec![gain]])
    }

    fn snapshot(&self) -> Self::Snapshot {
        self.counter
    }

    fn restore(&mut self, snapshot: &Self::Snapshot) -> Result<(), GraphError> {
        if self.broken_restore {
            return Err(GraphError::Restore("snapshot store unavailable".into()));
        }
        self.counter = *snapshot;
        Ok(())
    }
}
