//! Scenario harness for evc-control.
//!
//! - Scenario graphs: a JSON-described [`ProcessingGraph`](evc_control::ProcessingGraph)
//!   with a BLAKE3 state digest for isolation checks
//! - Fixtures: scenario sets pairing a graph, a controller config and expectations
//! - Runner: drives controllers through each scenario and verifies results
//! - Evidence: SHA-256 artifact index over the decision logs a run writes

#![forbid(unsafe_code)]

pub mod error;
pub mod evidence;
pub mod fixtures;
pub mod graph;
pub mod runner;
pub mod verify;

pub use error::HarnessError;
pub use evidence::{ArtifactEntry, ArtifactIndex, EvidenceReport, EvidenceViolation, check_evidence};
pub use fixtures::{Expectation, ScenarioCase, ScenarioMode, ScenarioSet};
pub use graph::{GraphSpec, GraphState, NodeOp, NodeSpec, ScenarioGraph};
pub use runner::{ScenarioRunner, load_scenario_dir};
pub use verify::{VerificationResult, VerificationSummary};
