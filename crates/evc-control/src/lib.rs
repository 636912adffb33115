//! # evc-control
//!
//! Expected Value of Control (EVC) controller for processing graphs.
//!
//! Once per outer trial the controller:
//! 1. folds the trial's inputs into its prediction mechanisms,
//! 2. simulates every candidate allocation policy on the predicted inputs,
//!    each under snapshot isolation,
//! 3. scores each candidate as `combiner(outcome, cost)`,
//! 4. commits the argmax to its control signals for the next trial.
//!
//! The processing graph is an external collaborator described by
//! [`ProcessingGraph`].

#![deny(unsafe_code)]

pub mod allocation;
pub mod config;
pub mod control_signal;
pub mod controller;
pub mod error;
pub mod graph;
pub mod ledger;
pub mod monitoring;
pub mod prediction;
pub mod selector;
pub mod simulation;
pub mod structured_log;
pub mod value;

#[cfg(test)]
mod test_support;

pub use allocation::{AllocationSampleSpace, AllocationSamples, SampleSpec};
pub use config::{ControllerConfig, PredictionRate};
pub use control_signal::{
    ControlSignal, ControlSignalSpec, CostBreakdown, CostCombination, CostOptions, DurationFn,
    TransferFn,
};
pub use controller::{ControllerPhase, ControllerSummary, EvcController, TrialReport};
pub use error::{ErrorKind, EvcError};
pub use graph::{
    GraphError, InputId, InputPort, OutputId, ParameterId, ParameterOverrides, ProcessingGraph,
    SharedGraph, Value,
};
pub use ledger::{DecisionLedger, DecisionRecord};
pub use monitoring::{MonitoredOutput, MonitoringError, MonitoringMechanism, OutcomeReduction};
pub use prediction::{
    CumulativeAverage, EstimatorKind, ExponentialAverage, InputEstimator, PredictionError,
    PredictionMechanism,
};
pub use selector::{FailedPolicy, PolicySelector, ScoredPolicy, SearchStrategy, Selection};
pub use simulation::{SimulationDriver, SimulationFailure, SimulationOutcome};
pub use structured_log::{LogBuffer, LogEmitter, LogEntry, LogLevel};
pub use value::{ValueContext, ValueFunction, Valuation};
