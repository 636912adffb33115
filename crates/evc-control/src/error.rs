//! Controller error surface.

use thiserror::Error;

use crate::graph::GraphError;
use crate::monitoring::MonitoringError;
use crate::prediction::PredictionError;

/// Coarse classification of controller failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected at construction or reconfiguration.
    Configuration,
    /// The graph failed while scoring a candidate policy.
    Simulation,
    /// The graph failed while running a real trial.
    Execution,
    /// Outcome or value arithmetic failed for a candidate.
    Monitoring,
    /// The per-trial budget ran out before any candidate was scored.
    Timeout,
    /// A prediction mechanism could not absorb the trial's inputs.
    Prediction,
    /// The graph could not be restored after a simulation.
    Rollback,
    /// The controller refuses work after a fatal failure.
    Poisoned,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Simulation => "simulation",
            Self::Execution => "execution",
            Self::Monitoring => "monitoring",
            Self::Timeout => "timeout",
            Self::Prediction => "prediction",
            Self::Rollback => "rollback",
            Self::Poisoned => "poisoned",
        }
    }
}

#[derive(Debug, Error)]
pub enum EvcError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("simulation failed on trial {trial} for policy {policy:?} (row {row}): {source}")]
    Simulation {
        trial: u64,
        row: usize,
        policy: Vec<f64>,
        source: GraphError,
    },

    #[error("trial {trial} execution failed under policy {policy:?}: {source}")]
    Execution {
        trial: u64,
        policy: Vec<f64>,
        source: GraphError,
    },

    #[error("monitoring failed on trial {trial} for policy {policy:?}: {source}")]
    Monitoring {
        trial: u64,
        policy: Vec<f64>,
        source: MonitoringError,
    },

    #[error("trial {trial} exceeded its {budget_ms} ms search budget before scoring any policy")]
    Timeout { trial: u64, budget_ms: u128 },

    #[error("prediction update failed on trial {trial}: {source}")]
    Prediction {
        trial: u64,
        source: PredictionError,
    },

    #[error("rollback failed on trial {trial} after simulating policy {policy:?}: {source}")]
    Rollback {
        trial: u64,
        policy: Vec<f64>,
        source: GraphError,
    },

    #[error("controller poisoned since trial {trial}; rebuild it to continue")]
    Poisoned { trial: u64 },
}

impl EvcError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Simulation { .. } => ErrorKind::Simulation,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::Monitoring { .. } => ErrorKind::Monitoring,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Prediction { .. } => ErrorKind::Prediction,
            Self::Rollback { .. } => ErrorKind::Rollback,
            Self::Poisoned { .. } => ErrorKind::Poisoned,
        }
    }

    /// Whether the controller can keep running after returning this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Simulation
                | ErrorKind::Execution
                | ErrorKind::Monitoring
                | ErrorKind::Timeout
        )
    }

    /// Offending policy, when the failure is tied to one.
    #[must_use]
    pub fn policy(&self) -> Option<&[f64]> {
        match self {
            Self::Simulation { policy, .. }
            | Self::Execution { policy, .. }
            | Self::Monitoring { policy, .. }
            | Self::Rollback { policy, .. } => Some(policy),
            _ => None,
        }
    }

    /// Trial index carried by per-trial failures.
    #[must_use]
    pub const fn trial(&self) -> Option<u64> {
        match self {
            Self::Configuration(_) => None,
            Self::Simulation { trial, .. }
            | Self::Execution { trial, .. }
            | Self::Monitoring { trial, .. }
            | Self::Timeout { trial, .. }
            | Self::Prediction { trial, .. }
            | Self::Rollback { trial, .. }
            | Self::Poisoned { trial } => Some(*trial),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulation_message_names_policy_and_trial() {
        let err = EvcError::Simulation {
            trial: 7,
            row: 2,
            policy: vec![0.5, 1.0],
            source: GraphError::Execution("diverged".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("trial 7"), "{msg}");
        assert!(msg.contains("[0.5, 1.0]"), "{msg}");
        assert!(msg.contains("diverged"), "{msg}");
        assert_eq!(err.kind(), ErrorKind::Simulation);
        assert!(err.is_recoverable());
        assert_eq!(err.policy(), Some(&[0.5, 1.0][..]));
        assert_eq!(err.trial(), Some(7));
    }

    #[test]
    fn fatal_kinds_are_not_recoverable() {
        let rollback = EvcError::Rollback {
            trial: 1,
            policy: vec![1.0],
            source: GraphError::Restore("lost".into()),
        };
        assert!(!rollback.is_recoverable());
        assert!(!EvcError::Poisoned { trial: 1 }.is_recoverable());
        assert!(!EvcError::config("empty").is_recoverable());
        assert_eq!(EvcError::config("empty").trial(), None);
    }

    #[test]
    fn timeout_is_recoverable() {
        let err = EvcError::Timeout {
            trial: 3,
            budget_ms: 0,
        };
        assert!(err.is_recoverable());
        assert_eq!(err.kind().as_str(), "timeout");
        assert!(err.to_string().contains("trial 3"));
    }
}
