//! Scenario execution engine.

use std::path::{Path, PathBuf};

use evc_control::{EvcController, EvcError, LogEmitter, Selection};

use crate::error::HarnessError;
use crate::evidence::ArtifactIndex;
use crate::fixtures::{Expectation, ScenarioCase, ScenarioMode, ScenarioSet};
use crate::graph::ScenarioGraph;
use crate::verify::{VerificationResult, VerificationSummary};

/// Runs scenario sets and collects verification results.
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    /// Campaign name; used as the log run id.
    pub campaign: String,
    log_dir: Option<PathBuf>,
}

/// What one scenario produced, before comparison.
#[derive(Debug, Default)]
struct Observed {
    policy: Option<Vec<f64>>,
    selection: Option<Selection>,
    predicted_inputs: Vec<Vec<f64>>,
    error: Option<EvcError>,
    poisoned: bool,
    digest_before: String,
    digest_after: String,
    decisions: u64,
}

impl ScenarioRunner {
    #[must_use]
    pub fn new(campaign: impl Into<String>) -> Self {
        Self {
            campaign: campaign.into(),
            log_dir: None,
        }
    }

    /// Write one JSONL decision log per case into `dir`.
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn run(&self, set: &ScenarioSet) -> Vec<VerificationResult> {
        set.cases.iter().map(|case| self.run_case(case)).collect()
    }

    pub fn run_summary(&self, set: &ScenarioSet) -> VerificationSummary {
        VerificationSummary::from_results(self.run(set))
    }

    /// Run `set` with logging into the configured directory and index the
    /// logs written.
    pub fn run_with_evidence(
        &self,
        set: &ScenarioSet,
    ) -> Result<(VerificationSummary, ArtifactIndex), HarnessError> {
        let dir = self
            .log_dir
            .as_deref()
            .ok_or_else(|| HarnessError::Setup("run_with_evidence needs a log directory".into()))?;
        std::fs::create_dir_all(dir).map_err(|e| HarnessError::io(dir, e))?;
        let summary = self.run_summary(set);
        let mut index = ArtifactIndex::new(self.campaign.as_str());
        for case in &set.cases {
            let name = log_file_name(&case.name);
            if dir.join(&name).exists() {
                index.add_file(dir, &name, "log")?;
            }
        }
        Ok((summary, index))
    }

    pub fn run_case(&self, case: &ScenarioCase) -> VerificationResult {
        let (observed, setup_error) = match self.drive(case) {
            Ok(observed) => (observed, None),
            Err(HarnessError::Controller(err)) => (
                Observed {
                    error: Some(err),
                    ..Observed::default()
                },
                None,
            ),
            Err(other) => (Observed::default(), Some(other.to_string())),
        };
        let mut mismatches = Vec::new();
        if let Some(err) = setup_error {
            mismatches.push(format!("setup failed: {err}"));
        } else {
            compare(&case.expect, &observed, &mut mismatches);
        }
        VerificationResult {
            case_name: case.name.clone(),
            passed: mismatches.is_empty(),
            mismatches,
            digest_before: observed.digest_before,
            digest_after: observed.digest_after,
            decisions: observed.decisions,
        }
    }

    fn drive(&self, case: &ScenarioCase) -> Result<Observed, HarnessError> {
        let mut graph = ScenarioGraph::from_spec(&case.graph)?;
        if let Some(acc) = &case.accumulators {
            graph.set_accumulators(acc)?;
        }
        let digest_before = graph.state_digest();
        let mut ctl = EvcController::new(graph, case.controller.clone())?;
        if let Some(dir) = &self.log_dir {
            let path = dir.join(log_file_name(&case.name));
            let emitter = LogEmitter::to_file(&path, ctl.name(), &self.campaign)
                .map_err(|e| HarnessError::io(&path, e))?;
            ctl.set_log_emitter(Some(emitter));
        }

        let mut observed = Observed {
            digest_before,
            ..Observed::default()
        };
        for inputs in &case.trials {
            let result = match case.mode {
                ScenarioMode::Execute => ctl.execute_trial(inputs).map(|r| r.next_policy),
                ScenarioMode::Step | ScenarioMode::Select => ctl.step(inputs),
            };
            match result {
                Ok(policy) => observed.policy = Some(policy),
                Err(err) => {
                    observed.error = Some(err);
                    break;
                }
            }
        }
        if case.mode == ScenarioMode::Select && observed.error.is_none() {
            match ctl.select() {
                Ok(selection) => observed.policy = Some(selection.best.policy.clone()),
                Err(err) => observed.error = Some(err),
            }
        }

        observed.selection = ctl.last_selection().cloned();
        observed.predicted_inputs = ctl.predicted_inputs();
        observed.poisoned = ctl.is_poisoned();
        observed.decisions = ctl.ledger().total_recorded();
        observed.digest_after = ctl.graph().lock().state_digest();
        // A failed flush only loses log lines; the evidence check reports it.
        let _ = ctl.flush_log();
        Ok(observed)
    }
}

fn log_file_name(case: &str) -> String {
    let stem: String = case
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{stem}.jsonl")
}

fn close(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol || (a.is_infinite() && a == b)
}

fn close_all(a: &[f64], b: &[f64], tol: f64) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| close(*x, *y, tol))
}

fn compare(expect: &Expectation, observed: &Observed, out: &mut Vec<String>) {
    let tol = expect.tolerance;
    match (&expect.error_kind, &observed.error) {
        (Some(kind), Some(err)) if err.kind().as_str() != kind.as_str() => {
            out.push(format!("error kind: expected {kind}, got {} ({err})", err.kind().as_str()));
        }
        (Some(kind), None) => out.push(format!("error kind: expected {kind}, got success")),
        (None, Some(err)) => out.push(format!("unexpected error: {err}")),
        _ => {}
    }
    if let Some(poisoned) = expect.poisoned
        && poisoned != observed.poisoned
    {
        out.push(format!("poisoned: expected {poisoned}, got {}", observed.poisoned));
    }
    if let Some(policy) = &expect.policy {
        match &observed.policy {
            Some(actual) if close_all(policy, actual, tol) => {}
            actual => out.push(format!("policy: expected {policy:?}, got {actual:?}")),
        }
    }
    if let Some(predicted) = &expect.predicted_inputs {
        let matches = predicted.len() == observed.predicted_inputs.len()
            && predicted
                .iter()
                .zip(&observed.predicted_inputs)
                .all(|(e, a)| close_all(e, a, tol));
        if !matches {
            out.push(format!(
                "predicted inputs: expected {predicted:?}, got {:?}",
                observed.predicted_inputs
            ));
        }
    }
    if let Some(unchanged) = expect.state_unchanged {
        let actual = observed.digest_before == observed.digest_after;
        if unchanged != actual {
            out.push(format!(
                "state unchanged: expected {unchanged}, digests {} -> {}",
                observed.digest_before, observed.digest_after
            ));
        }
    }

    let wants_selection =
        expect.row.is_some() || expect.value.is_some() || expect.row_values.is_some();
    let Some(selection) = &observed.selection else {
        if wants_selection {
            out.push("no selection was made".into());
        }
        return;
    };
    if let Some(row) = expect.row
        && row != selection.best.row
    {
        out.push(format!("row: expected {row}, got {}", selection.best.row));
    }
    if let Some(value) = expect.value
        && !close(value, selection.value(), tol)
    {
        out.push(format!("value: expected {value}, got {}", selection.value()));
    }
    if let Some(values) = &expect.row_values {
        let actual: Vec<f64> = selection.records.iter().map(|r| r.value).collect();
        if !close_all(values, &actual, tol) {
            out.push(format!("row values: expected {values:?}, got {actual:?}"));
        }
    }
}

/// Load every `*.json` scenario set under `dir`, sorted by file name.
pub fn load_scenario_dir(dir: &Path) -> Result<Vec<(PathBuf, ScenarioSet)>, HarnessError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| HarnessError::io(dir, e))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    paths
        .into_iter()
        .map(|p| ScenarioSet::from_file(&p).map(|set| (p, set)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SET: &str = r#"{
        "version": "v1",
        "family": "unit",
        "captured_at": "2026-10-01T00:00:00Z",
        "cases": [
            {
                "name": "picks higher gain",
                "graph": {
                    "parameters": {"gain": 0.0},
                    "nodes": [{"name": "g", "op": "parameter", "parameter": "gain"}],
                    "outputs": ["g"]
                },
                "controller": {
                    "control_signals": [{"target": "gain", "samples": [0.0, 1.0], "cost_options": []}],
                    "monitor_for_control": [{"output": "g"}],
                    "save_all_policies_and_values": true
                },
                "trials": [[]],
                "expect": {"policy": [1.0], "row": 1, "value": 1.0, "row_values": [0.0, 1.0], "state_unchanged": true}
            },
            {
                "name": "wrong expectation",
                "graph": {
                    "parameters": {"gain": 0.0},
                    "nodes": [{"name": "g", "op": "parameter", "parameter": "gain"}],
                    "outputs": ["g"]
                },
                "controller": {
                    "control_signals": [{"target": "gain", "samples": [0.0, 1.0], "cost_options": []}],
                    "monitor_for_control": [{"output": "g"}]
                },
                "trials": [[]],
                "expect": {"policy": [0.0]}
            },
            {
                "name": "unknown target",
                "graph": {
                    "parameters": {"gain": 0.0},
                    "nodes": [{"name": "g", "op": "parameter", "parameter": "gain"}],
                    "outputs": ["g"]
                },
                "controller": {
                    "control_signals": [{"target": "missing"}],
                    "monitor_for_control": [{"output": "g"}]
                },
                "expect": {"error_kind": "configuration"}
            }
        ]
    }"#;

    #[test]
    fn runner_reports_pass_and_fail() {
        let set = ScenarioSet::from_json(SET).unwrap();
        let summary = ScenarioRunner::new("unit").run_summary(&set);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 2, "{:?}", summary.failures());
        assert!(!summary.results[1].passed);
        assert!(summary.results[1].mismatches[0].starts_with("policy"));
        assert_eq!(summary.results[0].decisions, 1);
        assert!(!summary.all_passed());
    }

    #[test]
    fn log_file_names_are_sanitized() {
        assert_eq!(log_file_name("picks higher gain"), "picks_higher_gain.jsonl");
        assert_eq!(log_file_name("a/b"), "a_b.jsonl");
    }

    #[test]
    fn infinite_values_compare_equal() {
        assert!(close(f64::NEG_INFINITY, f64::NEG_INFINITY, 1e-9));
        assert!(!close(f64::NEG_INFINITY, 0.0, 1e-9));
    }
}
