//! Snapshot-isolated evaluation of one candidate policy.
//!
//! Sequence per call: snapshot graph and signals, `apply` the policy (never
//! `commit`), run one trial on the predicted inputs with `simulation = true`,
//! score outputs and costs, restore. Restoration runs on every exit path; a
//! failed restore outranks whatever the trial itself produced.

use crate::control_signal::ControlSignal;
use crate::graph::{GraphError, ParameterOverrides, ProcessingGraph, SharedGraph, Value};
use crate::monitoring::{MonitoringError, MonitoringMechanism};

/// Outcome and per-signal costs of one simulated trial.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOutcome {
    pub outcome: f64,
    pub costs: Vec<f64>,
}

/// Why a simulation produced no outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationFailure {
    /// The graph rejected or failed the trial; state was restored.
    Graph(GraphError),
    /// Outputs could not be reduced to an outcome; state was restored.
    Monitoring(MonitoringError),
    /// The graph could not be restored. Its state is unknown.
    Rollback(GraphError),
}

/// Runs candidate policies against a graph under snapshot isolation.
#[derive(Debug, Clone, Copy)]
pub struct SimulationDriver<'a> {
    monitoring: &'a MonitoringMechanism,
    predicted: &'a [Value],
}

impl<'a> SimulationDriver<'a> {
    /// `predicted` holds one value per graph input in canonical order.
    #[must_use]
    pub fn new(monitoring: &'a MonitoringMechanism, predicted: &'a [Value]) -> Self {
        Self {
            monitoring,
            predicted,
        }
    }

    /// Simulate `policy` on a graph the caller already holds exclusively.
    pub fn simulate<G: ProcessingGraph>(
        &self,
        graph: &mut G,
        signals: &mut [ControlSignal],
        policy: &[f64],
    ) -> Result<SimulationOutcome, SimulationFailure> {
        debug_assert_eq!(signals.len(), policy.len());
        let graph_snapshot = graph.snapshot();
        let signal_snapshot: Vec<_> = signals.iter().map(ControlSignal::state).collect();

        let mut overrides = ParameterOverrides::new();
        for (signal, &allocation) in signals.iter_mut().zip(policy) {
            let intensity = signal.apply(allocation);
            overrides.insert(signal.target().clone(), intensity);
        }

        let result = graph
            .execute(self.predicted, &overrides, true)
            .map_err(SimulationFailure::Graph)
            .and_then(|outputs| {
                self.monitoring
                    .evaluate(&outputs)
                    .map_err(SimulationFailure::Monitoring)
            })
            .map(|outcome| SimulationOutcome {
                outcome,
                costs: signals
                    .iter()
                    .zip(policy)
                    .map(|(signal, &a)| signal.cost(a))
                    .collect(),
            });

        for (signal, state) in signals.iter_mut().zip(signal_snapshot) {
            signal.restore_state(state);
        }
        graph
            .restore(&graph_snapshot)
            .map_err(SimulationFailure::Rollback)?;
        result
    }

    /// Simulate against a shared graph, holding its lock from snapshot to
    /// restore.
    pub fn simulate_shared<G: ProcessingGraph>(
        &self,
        graph: &SharedGraph<G>,
        signals: &mut [ControlSignal],
        policy: &[f64],
    ) -> Result<SimulationOutcome, SimulationFailure> {
        let mut guard = graph.lock();
        self.simulate(&mut *guard, signals, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_signal::{ControlSignalSpec, CostOptions};
    use crate::graph::OutputId;
    use crate::monitoring::{MonitoredOutput, OutcomeReduction};
    use crate::test_support::{FailingGraph, GainGraph, IntegratorGraph};
    use std::sync::Arc;

    fn signals(n: usize) -> Vec<ControlSignal> {
        (0..n)
            .map(|j| {
                ControlSignal::from_spec(
                    &ControlSignalSpec::new(format!("gain{j}"))
                        .with_default_allocation(0.0)
                        .with_samples(vec![0.0, 1.0])
                        .with_cost_options(CostOptions::ADJUSTMENT),
                )
                .unwrap()
            })
            .collect()
    }

    fn monitor(outputs: &[OutputId]) -> MonitoringMechanism {
        let spec: Vec<_> = outputs.iter().map(|o| MonitoredOutput::new(o.as_str())).collect();
        MonitoringMechanism::new(&spec, outputs, OutcomeReduction::Product).unwrap()
    }

    #[test]
    fn returns_outcome_and_costs() {
        let mut graph = GainGraph::new(2);
        let mon = monitor(&graph.outputs());
        let mut sigs = signals(2);
        let out = SimulationDriver::new(&mon, &[])
            .simulate(&mut graph, &mut sigs, &[0.5, 1.0])
            .unwrap();
        assert_eq!(out.outcome, 0.5);
        assert_eq!(out.costs, vec![0.5, 1.0]);
    }

    #[test]
    fn graph_state_restored_after_success() {
        let mut graph = IntegratorGraph::new(0.25);
        let before = graph.accumulator();
        let mon = monitor(&graph.outputs());
        let mut sigs = signals(1);
        let predicted = [vec![1.0]];
        let driver = SimulationDriver::new(&mon, &predicted);
        for policy in [[1.0], [0.0], [1.0]] {
            driver.simulate(&mut graph, &mut sigs, &policy).unwrap();
            assert_eq!(graph.accumulator().to_bits(), before.to_bits());
        }
        assert_eq!(graph.executions(), 0);
    }

    #[test]
    fn signals_untouched_after_simulation() {
        let mut graph = GainGraph::new(1);
        let mon = monitor(&graph.outputs());
        let mut sigs = signals(1);
        let before = sigs[0].state();
        SimulationDriver::new(&mon, &[])
            .simulate(&mut graph, &mut sigs, &[1.0])
            .unwrap();
        assert_eq!(sigs[0].state(), before);
        assert_eq!(sigs[0].last_allocation(), 0.0);
    }

    #[test]
    fn graph_failure_restores_and_reports() {
        let mut graph = FailingGraph::new(vec![1.0]);
        let mon = monitor(&graph.outputs());
        let mut sigs = signals(1);
        let before = graph.counter();
        let err = SimulationDriver::new(&mon, &[])
            .simulate(&mut graph, &mut sigs, &[1.0])
            .unwrap_err();
        assert!(matches!(err, SimulationFailure::Graph(GraphError::Execution(_))));
        assert_eq!(graph.counter(), before);
    }

    #[test]
    fn restore_failure_is_rollback() {
        let mut graph = FailingGraph::new(Vec::new()).with_broken_restore();
        let mon = monitor(&graph.outputs());
        let mut sigs = signals(1);
        let err = SimulationDriver::new(&mon, &[])
            .simulate(&mut graph, &mut sigs, &[0.0])
            .unwrap_err();
        assert!(matches!(err, SimulationFailure::Rollback(GraphError::Restore(_))));
    }

    #[test]
    fn shared_graph_lock_released() {
        let graph = Arc::new(parking_lot::Mutex::new(GainGraph::new(1)));
        let outputs = graph.lock().outputs();
        let mon = monitor(&outputs);
        let mut sigs = signals(1);
        SimulationDriver::new(&mon, &[])
            .simulate_shared(&graph, &mut sigs, &[1.0])
            .unwrap();
        assert!(graph.try_lock().is_some());
    }
}
