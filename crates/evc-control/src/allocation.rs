//! Allocation samples and the candidate-policy table.
//!
//! The sample space is the Cartesian product of every control signal's
//! samples, stored row-major in a flat buffer. Row `r` is decoded with the
//! last signal varying fastest, so iteration is lexicographic over signal
//! index.

use serde::{Deserialize, Serialize};

use crate::error::EvcError;

/// Samples used when a control signal does not specify any.
pub const DEFAULT_ALLOCATION_SAMPLES: [f64; 4] = [0.1, 0.4, 0.7, 1.0];

/// Upper bound on the number of candidate policies in one sample space.
pub const MAX_SAMPLE_SPACE_ROWS: usize = 1 << 24;

/// Ordered, validated allocation samples for one control signal.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationSamples {
    values: Vec<f64>,
}

impl AllocationSamples {
    /// Validate an explicit sample list. Duplicates are allowed and keep
    /// their own rows.
    pub fn from_values(values: Vec<f64>) -> Result<Self, EvcError> {
        if values.is_empty() {
            return Err(EvcError::config("allocation samples must not be empty"));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(EvcError::config(format!(
                "allocation sample {bad} is not a finite non-negative value"
            )));
        }
        Ok(Self { values })
    }

    /// Expand `start, start + step, ...` while the value stays below `stop`.
    pub fn range(start: f64, stop: f64, step: f64) -> Result<Self, EvcError> {
        if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
            return Err(EvcError::config("allocation range bounds must be finite"));
        }
        if step <= 0.0 {
            return Err(EvcError::config(format!(
                "allocation range step must be positive, got {step}"
            )));
        }
        let mut values = Vec::new();
        let mut k = 0_u32;
        loop {
            let v = start + f64::from(k) * step;
            if v >= stop {
                break;
            }
            if values.len() >= MAX_SAMPLE_SPACE_ROWS {
                return Err(EvcError::config("allocation range expands to too many samples"));
            }
            values.push(v);
            k += 1;
        }
        Self::from_values(values)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for AllocationSamples {
    fn default() -> Self {
        Self {
            values: DEFAULT_ALLOCATION_SAMPLES.to_vec(),
        }
    }
}

/// Serializable form of a sample sequence: an explicit list or a range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleSpec {
    Values(Vec<f64>),
    Range { start: f64, stop: f64, step: f64 },
}

impl SampleSpec {
    pub fn resolve(&self) -> Result<AllocationSamples, EvcError> {
        match self {
            Self::Values(values) => AllocationSamples::from_values(values.clone()),
            Self::Range { start, stop, step } => AllocationSamples::range(*start, *stop, *step),
        }
    }
}

impl Default for SampleSpec {
    fn default() -> Self {
        Self::Values(DEFAULT_ALLOCATION_SAMPLES.to_vec())
    }
}

/// Table of candidate policies, one row per policy and one column per
/// control signal.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationSampleSpace {
    cells: Vec<f64>,
    columns: usize,
    rows: usize,
}

impl AllocationSampleSpace {
    /// Number of rows the product of `samples` would have.
    pub fn row_count(samples: &[&AllocationSamples]) -> Result<usize, EvcError> {
        if samples.is_empty() {
            return Err(EvcError::config(
                "sample space needs at least one control signal",
            ));
        }
        let mut rows = 1_usize;
        for (j, s) in samples.iter().enumerate() {
            if s.is_empty() {
                return Err(EvcError::config(format!(
                    "control signal {j} has an empty sample sequence"
                )));
            }
            rows = rows
                .checked_mul(s.len())
                .filter(|r| *r <= MAX_SAMPLE_SPACE_ROWS)
                .ok_or_else(|| {
                    EvcError::config(format!(
                        "sample space exceeds {MAX_SAMPLE_SPACE_ROWS} policies"
                    ))
                })?;
        }
        Ok(rows)
    }

    /// Enumerate the Cartesian product of `samples` in canonical order.
    pub fn build(samples: &[&AllocationSamples]) -> Result<Self, EvcError> {
        let rows = Self::row_count(samples)?;
        let columns = samples.len();
        let mut cells = Vec::with_capacity(rows * columns);
        let mut digits = vec![0_usize; columns];
        for _ in 0..rows {
            cells.extend(digits.iter().zip(samples).map(|(&d, s)| s.as_slice()[d]));
            // Odometer increment, last column fastest.
            for j in (0..columns).rev() {
                digits[j] += 1;
                if digits[j] < samples[j].len() {
                    break;
                }
                digits[j] = 0;
            }
        }

        Ok(Self {
            cells,
            columns,
            rows,
        })
    }

    /// Number of candidate policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Number of control signals (columns).
    #[must_use]
    pub fn num_signals(&self) -> usize {
        self.columns
    }

    /// Policy at row `index`, or `None` past the end.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<&[f64]> {
        if index >= self.rows {
            return None;
        }
        let start = index * self.columns;
        Some(&self.cells[start..start + self.columns])
    }

    /// Rows in canonical order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &[f64]> + '_ {
        self.cells.chunks_exact(self.columns)
    }
}
