//! Processing-graph collaborator contract.
//!
//! The controller never looks inside the network it controls. Everything it
//! needs is expressed by [`ProcessingGraph`]: canonical input and output
//! orderings, single-trial execution under a transient parameter override
//! map, and snapshot/restore of all mutable runtime state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Array-valued port value. Scalars are length-1 vectors.
pub type Value = Vec<f64>;

/// Parameter overrides applied for the duration of one `execute` call.
pub type ParameterOverrides = BTreeMap<ParameterId, f64>;

/// Graph shared between the host loop and the controller.
///
/// The simulation driver holds the lock from snapshot to restore.
pub type SharedGraph<G> = Arc<Mutex<G>>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a controllable parameter inside the graph.
    ParameterId
);
string_id!(
    /// Identifier of an external input of the graph.
    InputId
);
string_id!(
    /// Identifier of an output the graph reports after each trial.
    OutputId
);

/// External input declaration: identifier plus expected vector width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPort {
    pub id: InputId,
    pub width: usize,
}

impl InputPort {
    #[must_use]
    pub fn new(id: impl Into<String>, width: usize) -> Self {
        Self {
            id: InputId::new(id),
            width,
        }
    }
}

/// Failures reported by a processing graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("unknown parameter '{0}'")]
    UnknownParameter(ParameterId),
    #[error("expected {expected} inputs, got {actual}")]
    InputArity { expected: usize, actual: usize },
    #[error("input '{input}' expects width {expected}, got {actual}")]
    InputShape {
        input: InputId,
        expected: usize,
        actual: usize,
    },
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("restore failed: {0}")]
    Restore(String),
}

/// A network of processing units that can be run one trial at a time.
///
/// `Clone` produces a fully independent deep copy; the parallel search gives
/// each worker its own copy instead of contending on the shared lock.
pub trait ProcessingGraph: Clone + Send {
    /// Opaque capture of every piece of state a trial can mutate.
    type Snapshot;

    /// External inputs in canonical order.
    fn inputs(&self) -> Vec<InputPort>;

    /// Reported outputs in canonical order. `execute` returns values aligned
    /// with this list.
    fn outputs(&self) -> Vec<OutputId>;

    /// Whether `id` names a parameter that accepts overrides.
    fn has_parameter(&self, id: &ParameterId) -> bool;

    /// Run exactly one trial.
    ///
    /// `overrides` are in effect for this call only. When `simulation` is
    /// true the graph must suppress side effects that do not belong to its
    /// restorable state (recording, learning, external notifications).
    fn execute(
        &mut self,
        inputs: &[Value],
        overrides: &ParameterOverrides,
        simulation: bool,
    ) -> Result<Vec<Value>, GraphError>;

    fn snapshot(&self) -> Self::Snapshot;

    /// Restore state captured by [`ProcessingGraph::snapshot`]. After a
    /// successful restore the graph must re-execute bit-identically.
    fn restore(&mut self, snapshot: &Self::Snapshot) -> Result<(), GraphError>;
}

/// Check `inputs` against the declared ports.
pub fn check_inputs(ports: &[InputPort], inputs: &[Value]) -> Result<(), GraphError> {
    if ports.len() != inputs.len() {
        return Err(GraphError::InputArity {
            expected: ports.len(),
            actual: inputs.len(),
        });
    }
    for (port, value) in ports.iter().zip(inputs) {
        if port.width != value.len() {
            return Err(GraphError::InputShape {
                input: port.id.clone(),
                expected: port.width,
                actual: value.len(),
            });
        }
    }
    Ok(())
}
