//! Bounded ledger of committed decisions.
//!
//! Every committed policy leaves one record: what won, by how much over the
//! runner-up, and how much of the sample space was actually scored.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Default number of decisions kept.
pub const DEFAULT_LEDGER_CAPACITY: usize = 64;

/// One committed decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Monotonic ledger sequence number (starts at 1).
    pub seqno: u64,
    /// Outer trial index.
    pub trial: u64,
    /// Winning row in the sample space.
    pub row: usize,
    pub policy: Vec<f64>,
    pub value: f64,
    pub outcome: f64,
    pub cost: f64,
    /// Second-best row and its value, if more than one row was scored.
    pub runner_up: Option<(usize, f64)>,
    /// Rows scored this trial.
    pub evaluated: usize,
    /// Rows that failed and were skipped.
    pub skipped: usize,
    /// Whether the time budget cut the search short.
    pub timed_out: bool,
}

impl DecisionRecord {
    /// Value margin over the runner-up.
    #[must_use]
    pub fn margin(&self) -> Option<f64> {
        self.runner_up.map(|(_, v)| self.value - v)
    }
}

/// Ring buffer of recent decisions.
#[derive(Debug, Clone)]
pub struct DecisionLedger {
    capacity: usize,
    entries: VecDeque<DecisionRecord>,
    next_seqno: u64,
}

impl DecisionLedger {
    /// `capacity` is clamped to at least one entry.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            next_seqno: 1,
        }
    }

    /// Append a record, assigning its sequence number. Evicts the oldest
    /// entry when full.
    pub fn record(&mut self, mut record: DecisionRecord) -> u64 {
        record.seqno = self.next_seqno;
        self.next_seqno += 1;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        let seqno = record.seqno;
        self.entries.push_back(record);
        seqno
    }

    #[must_use]
    pub fn latest(&self) -> Option<&DecisionRecord> {
        self.entries.back()
    }

    /// Retained records, oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &DecisionRecord> + '_ {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records ever written, including evicted ones.
    #[must_use]
    pub fn total_recorded(&self) -> u64 {
        self.next_seqno - 1
    }
}

impl Default for DecisionLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(trial: u64, value: f64) -> DecisionRecord {
        DecisionRecord {
            seqno: 0,
            trial,
            row: 0,
            policy: vec![1.0],
            value,
            outcome: value,
            cost: 0.0,
            runner_up: Some((1, value - 0.25)),
            evaluated: 2,
            skipped: 0,
            timed_out: false,
        }
    }

    #[test]
    fn starts_empty() {
        let l = DecisionLedger::default();
        assert!(l.is_empty());
        assert_eq!(l.capacity(), DEFAULT_LEDGER_CAPACITY);
        assert_eq!(l.total_recorded(), 0);
        assert!(l.latest().is_none());
    }

    #[test]
    fn assigns_monotonic_seqnos() {
        let mut l = DecisionLedger::new(4);
        assert_eq!(l.record(rec(0, 1.0)), 1);
        assert_eq!(l.record(rec(1, 2.0)), 2);
        assert_eq!(l.latest().map(|r| r.trial), Some(1));
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut l = DecisionLedger::new(2);
        for t in 0..5 {
            l.record(rec(t, t as f64));
        }
        assert_eq!(l.len(), 2);
        assert_eq!(l.total_recorded(), 5);
        let trials: Vec<u64> = l.iter().map(|r| r.trial).collect();
        assert_eq!(trials, vec![3, 4]);
    }

    #[test]
    fn zero_capacity_clamped() {
        let mut l = DecisionLedger::new(0);
        l.record(rec(0, 0.0));
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn margin_over_runner_up() {
        assert_eq!(rec(0, 1.0).margin(), Some(0.25));
    }
}
