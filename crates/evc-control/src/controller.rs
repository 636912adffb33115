//! EVC controller: owns the signals, predictions and objective, and runs
//! the per-trial cycle
//! `Idle → UpdatingPredictions → Searching → Committing → Idle`.
//!
//! Recoverable failures (simulation, execution, monitoring, timeout) return
//! the controller to `Idle` with nothing committed. Prediction and rollback
//! failures poison it: every later call returns [`EvcError::Poisoned`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::allocation::{AllocationSampleSpace, AllocationSamples};
use crate::config::ControllerConfig;
use crate::control_signal::{ControlSignal, CostOptions};
use crate::error::EvcError;
use crate::graph::{
    InputPort, ParameterOverrides, ProcessingGraph, SharedGraph, Value, check_inputs,
};
use crate::ledger::{DecisionLedger, DecisionRecord};
use crate::monitoring::MonitoringMechanism;
use crate::prediction::{PredictionError, PredictionMechanism};
use crate::selector::{PolicySelector, SearchRequest, Selection};
use crate::structured_log::{LogEmitter, LogEntry, LogLevel};
use crate::value::ValueFunction;

/// Where the controller is in its per-trial cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerPhase {
    /// Between trials. The only phase in which the host may run the graph.
    #[default]
    Idle,
    UpdatingPredictions,
    Searching,
    Committing,
    /// A fatal failure occurred; the controller must be rebuilt.
    Poisoned,
}

impl ControllerPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::UpdatingPredictions => "updating_predictions",
            Self::Searching => "searching",
            Self::Committing => "committing",
            Self::Poisoned => "poisoned",
        }
    }
}

/// Result of [`EvcController::execute_trial`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrialReport {
    pub trial: u64,
    /// Policy in force while the trial ran.
    pub policy: Vec<f64>,
    /// Graph outputs in canonical order.
    pub outputs: Vec<Value>,
    /// Monitored outcome of the trial.
    pub outcome: f64,
    /// Policy committed for the next trial.
    pub next_policy: Vec<f64>,
}

/// Snapshot of controller state for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSummary {
    pub name: String,
    pub phase: ControllerPhase,
    /// Trials stepped so far.
    pub trials: u64,
    pub committed_policy: Vec<f64>,
    /// Value of the most recent selection (the EVC max).
    pub last_value: Option<f64>,
    pub decisions_recorded: u64,
    pub log_write_failures: u64,
}

pub struct EvcController<G: ProcessingGraph> {
    name: String,
    graph: SharedGraph<G>,
    inputs: Vec<InputPort>,
    signals: Vec<ControlSignal>,
    predictions: Vec<PredictionMechanism>,
    monitoring: MonitoringMechanism,
    value_fn: ValueFunction,
    selector: PolicySelector,
    space: Option<AllocationSampleSpace>,
    phase: ControllerPhase,
    trial: u64,
    poisoned_at: Option<u64>,
    last_selection: Option<Selection>,
    last_outcome: Option<f64>,
    ledger: DecisionLedger,
    log: Option<LogEmitter>,
    log_write_failures: u64,
}

impl<G: ProcessingGraph> std::fmt::Debug for EvcController<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvcController")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("trial", &self.trial)
            .field("signals", &self.signals.len())
            .field("predictions", &self.predictions.len())
            .finish_non_exhaustive()
    }
}

fn build_space(signals: &[ControlSignal]) -> Result<AllocationSampleSpace, EvcError> {
    let samples: Vec<&AllocationSamples> = signals.iter().map(ControlSignal::samples).collect();
    AllocationSampleSpace::build(&samples)
}

impl<G: ProcessingGraph> EvcController<G> {
    /// Take ownership of `graph` and build a controller for it.
    pub fn new(graph: G, config: ControllerConfig) -> Result<Self, EvcError> {
        Self::from_shared(Arc::new(Mutex::new(graph)), config)
    }

    /// Build a controller over a graph the host also holds.
    pub fn from_shared(graph: SharedGraph<G>, config: ControllerConfig) -> Result<Self, EvcError> {
        config.validate()?;

        let (inputs, outputs) = {
            let g = graph.lock();
            if let Some(spec) = config
                .control_signals
                .iter()
                .find(|s| !g.has_parameter(&s.target))
            {
                return Err(EvcError::config(format!(
                    "control signal targets unknown parameter '{}'",
                    spec.target
                )));
            }
            (g.inputs(), g.outputs())
        };

        let mut targets = BTreeSet::new();
        for spec in &config.control_signals {
            if !targets.insert(&spec.target) {
                return Err(EvcError::config(format!(
                    "parameter '{}' is driven by more than one control signal",
                    spec.target
                )));
            }
        }

        if let crate::config::PredictionRate::PerInput { overrides, .. } = &config.prediction_rate
            && let Some(unknown) = overrides.keys().find(|id| !inputs.iter().any(|p| &p.id == *id))
        {
            return Err(EvcError::config(format!(
                "prediction rate override names unknown input '{unknown}'"
            )));
        }

        let signals = config
            .control_signals
            .iter()
            .map(ControlSignal::from_spec)
            .collect::<Result<Vec<_>, _>>()?;
        let predictions = inputs
            .iter()
            .map(|port| {
                let rate = config.prediction_rate.rate_for(&port.id);
                PredictionMechanism::new(port, config.prediction_estimator.build(port.width, rate))
            })
            .collect();
        let monitoring = MonitoringMechanism::new(
            &config.monitor_for_control,
            &outputs,
            config.outcome_reduction,
        )?;
        let selector = PolicySelector::new(config.search)?
            .retain_all(config.save_all_policies_and_values)
            .skip_failed(config.skip_failed_policies)
            .time_budget(config.time_budget()?);
        let space = build_space(&signals)?;

        Ok(Self {
            name: config.name,
            graph,
            inputs,
            signals,
            predictions,
            monitoring,
            value_fn: config.value_function,
            selector,
            space: Some(space),
            phase: ControllerPhase::Idle,
            trial: 0,
            poisoned_at: None,
            last_selection: None,
            last_outcome: None,
            ledger: DecisionLedger::new(config.ledger_capacity),
            log: None,
            log_write_failures: 0,
        })
    }

    /// Attach a structured log sink.
    #[must_use]
    pub fn with_log_emitter(mut self, emitter: LogEmitter) -> Self {
        self.log = Some(emitter);
        self
    }

    pub fn set_log_emitter(&mut self, emitter: Option<LogEmitter>) -> Option<LogEmitter> {
        std::mem::replace(&mut self.log, emitter)
    }

    pub fn flush_log(&mut self) -> std::io::Result<()> {
        match self.log.as_mut() {
            Some(log) => log.flush(),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Trial cycle
    // -----------------------------------------------------------------------

    /// Run one real trial under the committed policy, score it, then step
    /// the controller with the same inputs.
    pub fn execute_trial(&mut self, inputs: &[Value]) -> Result<TrialReport, EvcError> {
        self.ensure_idle()?;
        let trial = self.trial;
        let policy = self.allocation_policy();
        let overrides = self.committed_overrides();

        let executed = {
            let mut g = self.graph.lock();
            check_inputs(&self.inputs, inputs).and_then(|()| g.execute(inputs, &overrides, false))
        };
        let outputs = match executed {
            Ok(outputs) => outputs,
            Err(source) => {
                let err = EvcError::Execution {
                    trial,
                    policy,
                    source,
                };
                return Err(self.fail(err));
            }
        };
        let outcome = match self.monitoring.evaluate(&outputs) {
            Ok(outcome) => outcome,
            Err(source) => {
                let err = EvcError::Monitoring {
                    trial,
                    policy,
                    source,
                };
                return Err(self.fail(err));
            }
        };
        self.last_outcome = Some(outcome);

        let next_policy = self.step(inputs)?;
        Ok(TrialReport {
            trial,
            policy,
            outputs,
            outcome,
            next_policy,
        })
    }

    /// Controller execution at the end of an outer trial: observe `inputs`,
    /// search, and commit the winner. Returns the committed policy.
    pub fn step(&mut self, inputs: &[Value]) -> Result<Vec<f64>, EvcError> {
        self.ensure_idle()?;
        let result = self.run_step(inputs);
        self.trial += 1;
        result
    }

    fn run_step(&mut self, inputs: &[Value]) -> Result<Vec<f64>, EvcError> {
        let started = Instant::now();
        self.log_with(LogLevel::Debug, "step_begin", |e| e);

        self.phase = ControllerPhase::UpdatingPredictions;
        if let Err(source) = self.update_predictions(inputs) {
            let err = EvcError::Prediction {
                trial: self.trial,
                source,
            };
            return Err(self.poison(err));
        }

        self.phase = ControllerPhase::Searching;
        let selection = match self.search() {
            Ok(selection) => selection,
            Err(err) => return Err(self.fail(err)),
        };

        self.phase = ControllerPhase::Committing;
        let policy = self.commit(selection, started.elapsed());
        self.phase = ControllerPhase::Idle;
        Ok(policy)
    }

    /// Search with the current predictions without committing anything.
    pub fn select(&mut self) -> Result<Selection, EvcError> {
        self.ensure_idle()?;
        self.phase = ControllerPhase::Searching;
        match self.search() {
            Ok(selection) => {
                self.phase = ControllerPhase::Idle;
                self.last_selection = Some(selection.clone());
                Ok(selection)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn update_predictions(&mut self, inputs: &[Value]) -> Result<(), PredictionError> {
        if inputs.len() != self.predictions.len() {
            return Err(PredictionError::InputCount {
                expected: self.predictions.len(),
                actual: inputs.len(),
            });
        }
        // All-or-nothing: no estimator moves unless every input is usable.
        for (p, x) in self.predictions.iter().zip(inputs) {
            p.check(x)?;
        }
        for (p, x) in self.predictions.iter_mut().zip(inputs) {
            p.observe(x)?;
        }
        let count = inputs.len();
        self.log_with(LogLevel::Debug, "predictions_updated", |e| {
            e.with_details(serde_json::json!({ "inputs": count }))
        });
        Ok(())
    }

    fn search(&mut self) -> Result<Selection, EvcError> {
        if self.space.is_none() {
            self.space = Some(build_space(&self.signals)?);
        }
        let space = self
            .space
            .as_ref()
            .ok_or_else(|| EvcError::config("allocation sample space unavailable"))?;
        let predicted: Vec<Value> = self
            .predictions
            .iter()
            .map(PredictionMechanism::predict)
            .collect();
        let committed: Vec<f64> = self
            .signals
            .iter()
            .map(ControlSignal::last_intensity)
            .collect();
        let request = SearchRequest {
            trial: self.trial,
            space,
            signals: &self.signals,
            predicted: &predicted,
            monitoring: &self.monitoring,
            value_fn: &self.value_fn,
            committed_intensities: &committed,
        };
        let selection = self.selector.select(&self.graph, &request)?;

        for failure in &selection.failures {
            let (row, reason) = (failure.row, failure.reason.clone());
            self.log_with(LogLevel::Warn, "policy_skipped", |e| {
                e.with_policy(&failure.policy)
                    .with_details(serde_json::json!({ "row": row, "reason": reason }))
            });
        }
        if selection.timed_out {
            let (evaluated, total) = (selection.evaluated, selection.total_rows);
            self.log_with(LogLevel::Warn, "selection_timed_out", |e| {
                e.with_evaluated(evaluated)
                    .with_details(serde_json::json!({ "total_rows": total }))
            });
        }
        let best = &selection.best;
        let elapsed = duration_ms(selection.elapsed);
        let (evaluated, runner_up) = (selection.evaluated, selection.runner_up);
        self.log_with(LogLevel::Info, "policy_selected", |e| {
            let e = e
                .with_decision(best.row, &best.policy, best.value)
                .with_breakdown(best.outcome, best.cost)
                .with_evaluated(evaluated)
                .with_duration_ms(elapsed);
            match runner_up {
                Some((row, value)) => e.with_details(serde_json::json!({
                    "runner_up_row": row,
                    "runner_up_value": value,
                })),
                None => e,
            }
        });
        Ok(selection)
    }

    fn commit(&mut self, selection: Selection, elapsed: Duration) -> Vec<f64> {
        for (signal, &allocation) in self.signals.iter_mut().zip(&selection.best.policy) {
            signal.apply(allocation);
            signal.commit();
        }
        let best = &selection.best;
        self.ledger.record(DecisionRecord {
            seqno: 0,
            trial: self.trial,
            row: best.row,
            policy: best.policy.clone(),
            value: best.value,
            outcome: best.outcome,
            cost: best.cost,
            runner_up: selection.runner_up,
            evaluated: selection.evaluated,
            skipped: selection.failures.len(),
            timed_out: selection.timed_out,
        });
        let (row, value, policy) = (best.row, best.value, best.policy.clone());
        self.log_with(LogLevel::Info, "policy_committed", |e| {
            e.with_decision(row, &policy, value)
                .with_duration_ms(duration_ms(elapsed))
        });
        self.last_selection = Some(selection);
        policy
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    fn ensure_idle(&self) -> Result<(), EvcError> {
        match self.poisoned_at {
            Some(trial) => Err(EvcError::Poisoned { trial }),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: EvcError) -> EvcError {
        if !err.is_recoverable() {
            return self.poison(err);
        }
        self.phase = ControllerPhase::Idle;
        let (kind, message) = (err.kind().as_str(), err.to_string());
        self.log_with(LogLevel::Error, "step_failed", |e| {
            e.with_error_kind(kind)
                .with_details(serde_json::json!({ "message": message }))
        });
        err
    }

    fn poison(&mut self, err: EvcError) -> EvcError {
        self.phase = ControllerPhase::Poisoned;
        self.poisoned_at = Some(err.trial().unwrap_or(self.trial));
        let (kind, message) = (err.kind().as_str(), err.to_string());
        self.log_with(LogLevel::Fatal, "controller_poisoned", |e| {
            e.with_error_kind(kind)
                .with_details(serde_json::json!({ "message": message }))
        });
        err
    }

    fn log_with(&mut self, level: LogLevel, event: &str, build: impl FnOnce(LogEntry) -> LogEntry) {
        let (trial, phase) = (self.trial, self.phase.as_str());
        let Some(log) = self.log.as_mut() else {
            return;
        };
        let entry = build(log.entry(level, event).with_trial(trial).with_phase(phase));
        if log.emit_entry(entry).is_err() {
            self.log_write_failures += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Reconfiguration
    // -----------------------------------------------------------------------

    /// Replace one signal's samples. The sample space is rebuilt before its
    /// next use.
    pub fn set_allocation_samples(
        &mut self,
        signal: usize,
        samples: AllocationSamples,
    ) -> Result<(), EvcError> {
        self.ensure_idle()?;
        if signal >= self.signals.len() {
            return Err(EvcError::config(format!(
                "no control signal at index {signal} ({} configured)",
                self.signals.len()
            )));
        }
        let mut sizes: Vec<&AllocationSamples> =
            self.signals.iter().map(ControlSignal::samples).collect();
        sizes[signal] = &samples;
        AllocationSampleSpace::row_count(&sizes)?;

        let count = samples.len();
        self.signals[signal].set_samples(samples);
        self.space = None;
        let target = self.signals[signal].target().to_string();
        self.log_with(LogLevel::Info, "samples_reconfigured", |e| {
            e.with_details(serde_json::json!({ "target": target, "samples": count }))
        });
        Ok(())
    }

    /// Enable or disable cost components of one signal.
    pub fn set_cost_enabled(
        &mut self,
        signal: usize,
        options: CostOptions,
        enabled: bool,
    ) -> Result<(), EvcError> {
        self.ensure_idle()?;
        let len = self.signals.len();
        self.signals
            .get_mut(signal)
            .ok_or_else(|| {
                EvcError::config(format!("no control signal at index {signal} ({len} configured)"))
            })?
            .set_cost_enabled(options, enabled);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Committed allocations, one per signal.
    #[must_use]
    pub fn allocation_policy(&self) -> Vec<f64> {
        self.signals.iter().map(ControlSignal::last_allocation).collect()
    }

    /// Parameter overrides the host should run the next real trial with.
    #[must_use]
    pub fn committed_overrides(&self) -> ParameterOverrides {
        self.signals
            .iter()
            .map(|s| (s.target().clone(), s.last_intensity()))
            .collect()
    }

    /// Handle on the controlled graph.
    #[must_use]
    pub fn graph(&self) -> SharedGraph<G> {
        Arc::clone(&self.graph)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.phase == ControllerPhase::Idle
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned_at.is_some()
    }

    /// Index of the next trial.
    #[must_use]
    pub fn trial(&self) -> u64 {
        self.trial
    }

    #[must_use]
    pub fn control_signals(&self) -> &[ControlSignal] {
        &self.signals
    }

    #[must_use]
    pub fn predictions(&self) -> &[PredictionMechanism] {
        &self.predictions
    }

    /// Current predicted inputs in canonical order.
    #[must_use]
    pub fn predicted_inputs(&self) -> Vec<Value> {
        self.predictions.iter().map(PredictionMechanism::predict).collect()
    }

    #[must_use]
    pub fn monitoring(&self) -> &MonitoringMechanism {
        &self.monitoring
    }

    /// Current sample space, `None` while a rebuild is pending.
    #[must_use]
    pub fn sample_space(&self) -> Option<&AllocationSampleSpace> {
        self.space.as_ref()
    }

    #[must_use]
    pub fn last_selection(&self) -> Option<&Selection> {
        self.last_selection.as_ref()
    }

    /// Monitored outcome of the last real trial.
    #[must_use]
    pub fn last_outcome(&self) -> Option<f64> {
        self.last_outcome
    }

    #[must_use]
    pub fn ledger(&self) -> &DecisionLedger {
        &self.ledger
    }

    #[must_use]
    pub fn log_write_failures(&self) -> u64 {
        self.log_write_failures
    }

    #[must_use]
    pub fn summary(&self) -> ControllerSummary {
        ControllerSummary {
            name: self.name.clone(),
            phase: self.phase,
            trials: self.trial,
            committed_policy: self.allocation_policy(),
            last_value: self.last_selection.as_ref().map(Selection::value),
            decisions_recorded: self.ledger.total_recorded(),
            log_write_failures: self.log_write_failures,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
