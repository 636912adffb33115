//! Grid search over the allocation sample space.
//!
//! Rows are scored in canonical order and the argmax is tracked with a
//! strict `>`, so the lowest row wins every tie. The parallel strategy
//! scores contiguous row ranges on rayon workers, each owning a deep copy
//! of the graph and the control signals, then folds the per-row results in
//! row order through the same tracker the sequential path uses. A fatal row
//! only cancels rows above it, so the reported failure is always the lowest
//! failing row, as in the sequential search.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::allocation::AllocationSampleSpace;
use crate::control_signal::ControlSignal;
use crate::error::EvcError;
use crate::graph::{ProcessingGraph, SharedGraph, Value};
use crate::monitoring::{MonitoringError, MonitoringMechanism};
use crate::simulation::{SimulationDriver, SimulationFailure, SimulationOutcome};
use crate::value::{ValueContext, ValueFunction};

/// Rows handed to each worker, as a divisor of rows per thread.
const CHUNKS_PER_WORKER: usize = 4;

/// How rows are distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchStrategy {
    #[default]
    Sequential,
    /// Score rows on a rayon pool. `threads` selects a dedicated pool of
    /// that size; otherwise the global pool is used.
    Parallel {
        #[serde(default)]
        threads: Option<usize>,
    },
}

impl SearchStrategy {
    /// Parse a strategy name. Unknown names fall back to sequential.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "parallel" | "rayon" | "threads" => Self::Parallel { threads: None },
            _ => Self::Sequential,
        }
    }
}

/// One scored candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPolicy {
    pub row: usize,
    pub policy: Vec<f64>,
    /// Aggregated outcome.
    pub outcome: f64,
    /// Per-signal costs as reported by the control signals.
    pub costs: Vec<f64>,
    /// Aggregated cost.
    pub cost: f64,
    pub value: f64,
}

/// A candidate skipped after failing. Scores `−∞` and never wins.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedPolicy {
    pub row: usize,
    pub policy: Vec<f64>,
    pub reason: String,
}

/// Result of one `select` pass.
#[derive(Debug, Clone)]
pub struct Selection {
    pub trial: u64,
    pub best: ScoredPolicy,
    /// Second-best row and value.
    pub runner_up: Option<(usize, f64)>,
    /// Every scored row in row order, when retention is enabled.
    pub records: Vec<ScoredPolicy>,
    pub failures: Vec<FailedPolicy>,
    /// Rows scored.
    pub evaluated: usize,
    /// Rows in the sample space.
    pub total_rows: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl Selection {
    #[must_use]
    pub fn policy(&self) -> &[f64] {
        &self.best.policy
    }

    #[must_use]
    pub fn value(&self) -> f64 {
        self.best.value
    }
}

/// Everything one search needs besides the graph.
#[derive(Debug, Clone, Copy)]
pub struct SearchRequest<'a> {
    pub trial: u64,
    pub space: &'a AllocationSampleSpace,
    pub signals: &'a [ControlSignal],
    pub predicted: &'a [Value],
    pub monitoring: &'a MonitoringMechanism,
    pub value_fn: &'a ValueFunction,
    pub committed_intensities: &'a [f64],
}

#[derive(Debug)]
enum RowResult {
    Scored(ScoredPolicy),
    Failed(usize, EvcError),
    /// Not run: the time budget expired first.
    Expired,
    /// Not run: another worker hit a fatal failure.
    Cancelled,
}

/// Grid-search policy selector.
#[derive(Debug, Clone)]
pub struct PolicySelector {
    strategy: SearchStrategy,
    retain_all: bool,
    skip_failed: bool,
    time_budget: Option<Duration>,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl PolicySelector {
    pub fn new(strategy: SearchStrategy) -> Result<Self, EvcError> {
        let pool = match strategy {
            SearchStrategy::Parallel { threads: Some(0) } => {
                return Err(EvcError::config("parallel search needs at least one thread"));
            }
            SearchStrategy::Parallel {
                threads: Some(threads),
            } => Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| EvcError::config(format!("search thread pool: {e}")))?,
            )),
            _ => None,
        };
        Ok(Self {
            strategy,
            retain_all: false,
            skip_failed: false,
            time_budget: None,
            pool,
        })
    }

    /// Keep every scored row in [`Selection::records`].
    #[must_use]
    pub fn retain_all(mut self, on: bool) -> Self {
        self.retain_all = on;
        self
    }

    /// Score failing rows as `−∞` instead of aborting.
    #[must_use]
    pub fn skip_failed(mut self, on: bool) -> Self {
        self.skip_failed = on;
        self
    }

    #[must_use]
    pub fn time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget = budget;
        self
    }

    #[must_use]
    pub fn strategy(&self) -> SearchStrategy {
        self.strategy
    }

    /// Score every row and return the argmax.
    pub fn select<G: ProcessingGraph>(
        &self,
        graph: &SharedGraph<G>,
        req: &SearchRequest<'_>,
    ) -> Result<Selection, EvcError> {
        let started = Instant::now();
        let deadline = self.time_budget.and_then(|b| started.checked_add(b));
        let mut tracker = Tracker::new(self.retain_all, self.skip_failed);

        match self.strategy {
            SearchStrategy::Sequential => {
                let driver = SimulationDriver::new(req.monitoring, req.predicted);
                let mut signals = req.signals.to_vec();
                for row in 0..req.space.len() {
                    if expired(deadline) {
                        tracker.absorb(req, RowResult::Expired)?;
                        break;
                    }
                    let result = score_row(req, row, |policy| {
                        driver.simulate_shared(graph, &mut signals, policy)
                    });
                    tracker.absorb(req, result)?;
                }
            }
            SearchStrategy::Parallel { .. } => {
                let run = || self.score_parallel(graph, req, deadline);
                let results = match &self.pool {
                    Some(pool) => pool.install(run),
                    None => run(),
                };
                for result in results {
                    tracker.absorb(req, result)?;
                }
            }
        }

        tracker.finish(req, self.time_budget, started.elapsed())
    }

    fn score_parallel<G: ProcessingGraph>(
        &self,
        graph: &SharedGraph<G>,
        req: &SearchRequest<'_>,
        deadline: Option<Instant>,
    ) -> Vec<RowResult> {
        let rows = req.space.len();
        let chunk = rows
            .div_ceil(rayon::current_num_threads().max(1) * CHUNKS_PER_WORKER)
            .max(1);
        let base = graph.lock().clone();
        let jobs: Vec<(Range<usize>, G, Vec<ControlSignal>)> = (0..rows)
            .step_by(chunk)
            .map(|start| (start..(start + chunk).min(rows), base.clone(), req.signals.to_vec()))
            .collect();

        // Lowest row that failed fatally so far.
        let first_fatal = AtomicUsize::new(usize::MAX);
        let driver = SimulationDriver::new(req.monitoring, req.predicted);
        let per_job: Vec<Vec<RowResult>> = jobs
            .into_par_iter()
            .map(|(range, mut graph, mut signals)| {
                let mut out = Vec::with_capacity(range.len());
                for row in range {
                    if row > first_fatal.load(Ordering::Relaxed) {
                        out.push(RowResult::Cancelled);
                        continue;
                    }
                    if expired(deadline) {
                        out.push(RowResult::Expired);
                        continue;
                    }
                    let result = score_row(req, row, |policy| {
                        driver.simulate(&mut graph, &mut signals, policy)
                    });
                    if is_fatal(&result, self.skip_failed) {
                        first_fatal.fetch_min(row, Ordering::Relaxed);
                    }
                    out.push(result);
                }
                out
            })
            .collect();
        per_job.into_iter().flatten().collect()
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn is_fatal(result: &RowResult, skip_failed: bool) -> bool {
    match result {
        RowResult::Failed(_, err) => !skip_failed || matches!(err, EvcError::Rollback { .. }),
        _ => false,
    }
}

fn score_row(
    req: &SearchRequest<'_>,
    row: usize,
    simulate: impl FnOnce(&[f64]) -> Result<SimulationOutcome, SimulationFailure>,
) -> RowResult {
    let Some(policy) = req.space.row(row) else {
        return RowResult::Cancelled;
    };
    let trial = req.trial;
    let sim = match simulate(policy) {
        Ok(sim) => sim,
        Err(failure) => {
            let policy = policy.to_vec();
            let err = match failure {
                SimulationFailure::Graph(source) => EvcError::Simulation {
                    trial,
                    row,
                    policy,
                    source,
                },
                SimulationFailure::Monitoring(source) => EvcError::Monitoring {
                    trial,
                    policy,
                    source,
                },
                SimulationFailure::Rollback(source) => EvcError::Rollback {
                    trial,
                    policy,
                    source,
                },
            };
            return RowResult::Failed(row, err);
        }
    };

    let ctx = ValueContext {
        trial,
        row,
        policy,
        committed_intensities: req.committed_intensities,
    };
    let valuation = req.value_fn.evaluate(&ctx, sim.outcome, &sim.costs);
    if valuation.value.is_nan() {
        return RowResult::Failed(
            row,
            EvcError::Monitoring {
                trial,
                policy: policy.to_vec(),
                source: MonitoringError::NanValue,
            },
        );
    }
    RowResult::Scored(ScoredPolicy {
        row,
        policy: policy.to_vec(),
        outcome: valuation.outcome,
        costs: sim.costs,
        cost: valuation.cost,
        value: valuation.value,
    })
}

/// Folds row results in row order.
struct Tracker {
    retain_all: bool,
    skip_failed: bool,
    best: Option<ScoredPolicy>,
    runner_up: Option<(usize, f64)>,
    records: Vec<ScoredPolicy>,
    failures: Vec<FailedPolicy>,
    first_error: Option<EvcError>,
    evaluated: usize,
    timed_out: bool,
}

impl Tracker {
    fn new(retain_all: bool, skip_failed: bool) -> Self {
        Self {
            retain_all,
            skip_failed,
            best: None,
            runner_up: None,
            records: Vec::new(),
            failures: Vec::new(),
            first_error: None,
            evaluated: 0,
            timed_out: false,
        }
    }

    fn absorb(&mut self, req: &SearchRequest<'_>, result: RowResult) -> Result<(), EvcError> {
        match result {
            RowResult::Scored(scored) => {
                self.evaluated += 1;
                if self.retain_all {
                    self.records.push(scored.clone());
                }
                match &self.best {
                    // A scored row always beats no row, even at −∞.
                    None => self.best = Some(scored),
                    Some(best) if scored.value > best.value => {
                        self.runner_up = Some((best.row, best.value));
                        self.best = Some(scored);
                    }
                    Some(_) => {
                        if self.runner_up.is_none_or(|(_, v)| scored.value > v) {
                            self.runner_up = Some((scored.row, scored.value));
                        }
                    }
                }
            }
            RowResult::Failed(row, err) => {
                if !self.skip_failed || matches!(err, EvcError::Rollback { .. }) {
                    return Err(err);
                }
                self.failures.push(FailedPolicy {
                    row,
                    policy: req.space.row(row).map(<[f64]>::to_vec).unwrap_or_default(),
                    reason: err.to_string(),
                });
                self.first_error.get_or_insert(err);
            }
            RowResult::Expired => self.timed_out = true,
            RowResult::Cancelled => {}
        }
        Ok(())
    }

    fn finish(
        self,
        req: &SearchRequest<'_>,
        budget: Option<Duration>,
        elapsed: Duration,
    ) -> Result<Selection, EvcError> {
        let Some(best) = self.best else {
            if self.timed_out {
                return Err(EvcError::Timeout {
                    trial: req.trial,
                    budget_ms: budget.unwrap_or_default().as_millis(),
                });
            }
            return Err(self.first_error.unwrap_or_else(|| {
                EvcError::config("allocation sample space has no rows")
            }));
        };
        Ok(Selection {
            trial: req.trial,
            best,
            runner_up: self.runner_up,
            records: self.records,
            failures: self.failures,
            evaluated: self.evaluated,
            total_rows: req.space.len(),
            timed_out: self.timed_out,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationSamples;
    use crate::control_signal::{ControlSignalSpec, CostOptions};
    use crate::graph::ProcessingGraph;
    use crate::monitoring::{MonitoredOutput, OutcomeReduction};
    use crate::test_support::{FailingGraph, GainGraph};
    use parking_lot::Mutex;

    struct Fixture<G> {
        graph: SharedGraph<G>,
        signals: Vec<ControlSignal>,
        space: AllocationSampleSpace,
        monitoring: MonitoringMechanism,
        value_fn: ValueFunction,
    }

    impl<G: ProcessingGraph> Fixture<G> {
        fn new(graph: G, samples: &[&[f64]]) -> Self {
            let signals: Vec<ControlSignal> = samples
                .iter()
                .enumerate()
                .map(|(j, s)| {
                    ControlSignal::from_spec(
                        &ControlSignalSpec::new(format!("gain{j}"))
                            .with_samples(s.to_vec())
                            .with_default_allocation(0.0)
                            .with_cost_options(CostOptions::NONE),
                    )
                    .unwrap()
                })
                .collect();
            let space = {
                let refs: Vec<&AllocationSamples> =
                    signals.iter().map(ControlSignal::samples).collect();
                AllocationSampleSpace::build(&refs).unwrap()
            };
            let outputs = graph.outputs();
            let spec: Vec<_> = outputs.iter().map(|o| MonitoredOutput::new(o.as_str())).collect();
            let monitoring =
                MonitoringMechanism::new(&spec, &outputs, OutcomeReduction::Product).unwrap();
            Self {
                graph: Arc::new(Mutex::new(graph)),
                signals,
                space,
                monitoring,
                value_fn: ValueFunction::new(),
            }
        }

        fn request(&self) -> SearchRequest<'_> {
            SearchRequest {
                trial: 0,
                space: &self.space,
                signals: &self.signals,
                predicted: &[],
                monitoring: &self.monitoring,
                value_fn: &self.value_fn,
                committed_intensities: &[],
            }
        }
    }

    fn sequential() -> PolicySelector {
        PolicySelector::new(SearchStrategy::Sequential).unwrap()
    }

    #[test]
    fn picks_argmax() {
        let fx = Fixture::new(GainGraph::new(2), &[&[0.5, 1.0], &[0.5, 1.0]]);
        let sel = sequential().retain_all(true).select(&fx.graph, &fx.request()).unwrap();
        assert_eq!(sel.policy(), &[1.0, 1.0]);
        let values: Vec<f64> = sel.records.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![0.25, 0.5, 0.5, 1.0]);
        assert_eq!(sel.evaluated, 4);
        assert_eq!(sel.total_rows, 4);
        assert_eq!(sel.runner_up, Some((1, 0.5)));
    }

    #[test]
    fn ties_go_to_lowest_row() {
        let fx = Fixture::new(GainGraph::new(1), &[&[1.0, 1.0]]);
        let sel = sequential().select(&fx.graph, &fx.request()).unwrap();
        assert_eq!(sel.best.row, 0);
        assert_eq!(sel.runner_up, Some((1, 1.0)));
        assert!(sel.records.is_empty());
    }

    #[test]
    fn failure_aborts_by_default() {
        let fx = Fixture::new(FailingGraph::new(vec![0.5]), &[&[0.0, 0.5, 1.0]]);
        let err = sequential().select(&fx.graph, &fx.request()).unwrap_err();
        match err {
            EvcError::Simulation { row, policy, .. } => {
                assert_eq!(row, 1);
                assert_eq!(policy, vec![0.5]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn skip_failed_continues() {
        let fx = Fixture::new(FailingGraph::new(vec![1.0]), &[&[0.0, 1.0, 0.5]]);
        let sel = sequential()
            .skip_failed(true)
            .select(&fx.graph, &fx.request())
            .unwrap();
        assert_eq!(sel.policy(), &[0.5]);
        assert_eq!(sel.failures.len(), 1);
        assert_eq!(sel.failures[0].row, 1);
        assert_eq!(sel.evaluated, 2);
    }

    #[test]
    fn all_failed_returns_first_error() {
        let fx = Fixture::new(FailingGraph::new(vec![0.0, 1.0]), &[&[0.0, 1.0]]);
        let err = sequential()
            .skip_failed(true)
            .select(&fx.graph, &fx.request())
            .unwrap_err();
        assert_eq!(err.policy(), Some(&[0.0][..]));
    }

    #[test]
    fn rollback_failure_aborts_even_when_skipping() {
        let graph = FailingGraph::new(Vec::new()).with_broken_restore();
        let fx = Fixture::new(graph, &[&[0.0, 1.0]]);
        let err = sequential()
            .skip_failed(true)
            .select(&fx.graph, &fx.request())
            .unwrap_err();
        assert!(matches!(err, EvcError::Rollback { .. }));
    }

    #[test]
    fn zero_budget_times_out() {
        let fx = Fixture::new(GainGraph::new(1), &[&[0.0, 1.0]]);
        let err = sequential()
            .time_budget(Some(Duration::ZERO))
            .select(&fx.graph, &fx.request())
            .unwrap_err();
        assert!(matches!(err, EvcError::Timeout { trial: 0, .. }));
    }

    #[test]
    fn nan_value_is_monitoring_error() {
        let mut fx = Fixture::new(GainGraph::new(1), &[&[0.0, 1.0]]);
        fx.value_fn = ValueFunction::new().with_combiner(|_, _, _| f64::NAN);
        let err = sequential().select(&fx.graph, &fx.request()).unwrap_err();
        assert!(matches!(
            err,
            EvcError::Monitoring {
                source: MonitoringError::NanValue,
                ..
            }
        ));
    }

    #[test]
    fn parallel_matches_sequential() {
        let samples: &[&[f64]] = &[&[0.0, 0.5, 1.0], &[1.0, 0.5, 0.5, 0.0], &[0.2, 0.2]];
        let fx = Fixture::new(GainGraph::new(3), samples);
        let seq = sequential().retain_all(true).select(&fx.graph, &fx.request()).unwrap();
        let par = PolicySelector::new(SearchStrategy::Parallel { threads: Some(3) })
            .unwrap()
            .retain_all(true)
            .select(&fx.graph, &fx.request())
            .unwrap();
        assert_eq!(seq.best, par.best);
        assert_eq!(seq.records, par.records);
        assert_eq!(seq.runner_up, par.runner_up);
    }

    #[test]
    fn budget_expiry_keeps_best_scored_row() {
        let samples: Vec<f64> = (0..20).map(f64::from).collect();
        let graph = FailingGraph::new(Vec::new()).with_pace(Duration::from_millis(40));
        let fx = Fixture::new(graph, &[samples.as_slice()]);
        let sel = sequential()
            .retain_all(true)
            .time_budget(Some(Duration::from_millis(100)))
            .select(&fx.graph, &fx.request())
            .unwrap();
        assert!(sel.timed_out);
        assert!(sel.evaluated >= 1);
        assert!(sel.evaluated < sel.total_rows);
        assert_eq!(sel.records.len(), sel.evaluated);
        let best_scored = sel
            .records
            .iter()
            .map(|r| r.value)
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(sel.value(), best_scored);
        assert_eq!(sel.best.row, sel.evaluated - 1);
    }

    #[test]
    fn parallel_reports_lowest_failing_row() {
        let samples: Vec<f64> = (0..16).map(f64::from).collect();
        let graph = FailingGraph::new(vec![1.0, 15.0])
            .with_delay_on(0.0, Duration::from_millis(300));
        let fx = Fixture::new(graph, &[samples.as_slice()]);
        let seq = sequential().select(&fx.graph, &fx.request()).unwrap_err();
        let par = PolicySelector::new(SearchStrategy::Parallel { threads: Some(4) })
            .unwrap()
            .select(&fx.graph, &fx.request())
            .unwrap_err();
        assert_eq!(seq.policy(), Some(&[1.0][..]));
        assert_eq!(par.policy(), seq.policy());
        assert!(matches!(par, EvcError::Simulation { row: 1, .. }));
    }

    #[test]
    fn parallel_leaves_shared_graph_untouched() {
        let fx = Fixture::new(GainGraph::new(2), &[&[0.0, 1.0], &[0.0, 1.0]]);
        PolicySelector::new(SearchStrategy::Parallel { threads: None })
            .unwrap()
            .select(&fx.graph, &fx.request())
            .unwrap();
        let g = fx.graph.lock();
        assert_eq!(g.trials(), 0);
        assert_eq!(g.calls(), 4);
    }

    #[test]
    fn zero_threads_rejected() {
        assert!(PolicySelector::new(SearchStrategy::Parallel { threads: Some(0) }).is_err());
    }

    #[test]
    fn strategy_parses_loosely() {
        assert_eq!(
            SearchStrategy::from_str_loose("Rayon"),
            SearchStrategy::Parallel { threads: None }
        );
        assert_eq!(SearchStrategy::from_str_loose("bogus"), SearchStrategy::Sequential);
        let parsed: SearchStrategy =
            serde_json::from_str(r#"{"kind": "parallel", "threads": 2}"#).unwrap();
        assert_eq!(parsed, SearchStrategy::Parallel { threads: Some(2) });
    }
}
