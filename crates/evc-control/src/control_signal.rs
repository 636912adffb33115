//! Control signals: allocation to intensity, intensity to cost.
//!
//! A signal separates `apply` (tentative, used by simulations) from
//! `commit` (durable, once per outer trial). `apply` never touches the
//! `last_*` fields or the duration accumulator, so a simulation that only
//! applies leaves the cost basis of the next trial untouched.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::allocation::{AllocationSamples, SampleSpec};
use crate::error::EvcError;
use crate::graph::ParameterId;

/// Allocation used before the first commit when none is configured.
pub const DEFAULT_ALLOCATION: f64 = 1.0;

// ---------------------------------------------------------------------------
// Cost options
// ---------------------------------------------------------------------------

/// One of the three cost components a signal can charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostComponent {
    Intensity,
    Adjustment,
    Duration,
}

/// Set of enabled cost components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<CostComponent>", into = "Vec<CostComponent>")]
pub struct CostOptions(u8);

impl CostOptions {
    pub const NONE: Self = Self(0);
    pub const INTENSITY: Self = Self(1);
    pub const ADJUSTMENT: Self = Self(1 << 1);
    pub const DURATION: Self = Self(1 << 2);
    pub const ALL: Self = Self(0b111);

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub const fn component(component: CostComponent) -> Self {
        match component {
            CostComponent::Intensity => Self::INTENSITY,
            CostComponent::Adjustment => Self::ADJUSTMENT,
            CostComponent::Duration => Self::DURATION,
        }
    }
}

impl Default for CostOptions {
    fn default() -> Self {
        Self::INTENSITY
    }
}

impl From<Vec<CostComponent>> for CostOptions {
    fn from(components: Vec<CostComponent>) -> Self {
        components
            .into_iter()
            .fold(Self::NONE, |acc, c| acc.union(Self::component(c)))
    }
}

impl From<CostOptions> for Vec<CostComponent> {
    fn from(options: CostOptions) -> Self {
        [
            CostComponent::Intensity,
            CostComponent::Adjustment,
            CostComponent::Duration,
        ]
        .into_iter()
        .filter(|c| options.contains(CostOptions::component(*c)))
        .collect()
    }
}

// ---------------------------------------------------------------------------
// Pluggable functions
// ---------------------------------------------------------------------------

pub type ScalarFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;
pub type DurationStepFn = Arc<dyn Fn(f64, f64) -> f64 + Send + Sync>;
pub type CombineCostFn = Arc<dyn Fn(&CostBreakdown) -> f64 + Send + Sync>;

/// Scalar transfer function used for intensity and cost mappings.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferFn {
    #[default]
    Identity,
    /// `slope * x + intercept`.
    Linear { slope: f64, intercept: f64 },
    /// `scale * exp(rate * x)`.
    Exponential { rate: f64, scale: f64 },
    #[serde(skip)]
    Custom(ScalarFn),
}

impl TransferFn {
    #[must_use]
    pub fn custom(f: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// `exp(x)`, the default intensity cost.
    #[must_use]
    pub const fn exponential() -> Self {
        Self::Exponential {
            rate: 1.0,
            scale: 1.0,
        }
    }

    #[must_use]
    pub fn eval(&self, x: f64) -> f64 {
        match self {
            Self::Identity => x,
            Self::Linear { slope, intercept } => slope * x + intercept,
            Self::Exponential { rate, scale } => scale * (rate * x).exp(),
            Self::Custom(f) => f(x),
        }
    }
}

impl fmt::Debug for TransferFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => f.write_str("Identity"),
            Self::Linear { slope, intercept } => f
                .debug_struct("Linear")
                .field("slope", slope)
                .field("intercept", intercept)
                .finish(),
            Self::Exponential { rate, scale } => f
                .debug_struct("Exponential")
                .field("rate", rate)
                .field("scale", scale)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Duration accumulator: maps `(state, intensity)` to the next state. The
/// duration cost is the next state.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DurationFn {
    /// Adds intensity while it is positive; resets to zero otherwise.
    #[default]
    Accumulate,
    #[serde(skip)]
    Custom(DurationStepFn),
}

impl DurationFn {
    #[must_use]
    pub fn custom(f: impl Fn(f64, f64) -> f64 + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    #[must_use]
    pub fn next_state(&self, state: f64, intensity: f64) -> f64 {
        match self {
            Self::Accumulate => {
                if intensity > 0.0 {
                    state + intensity
                } else {
                    0.0
                }
            }
            Self::Custom(f) => f(state, intensity),
        }
    }
}

impl fmt::Debug for DurationFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accumulate => f.write_str("Accumulate"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// How the enabled cost components are folded into one scalar.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostCombination {
    #[default]
    Sum,
    Max,
    #[serde(skip)]
    Custom(CombineCostFn),
}

impl CostCombination {
    #[must_use]
    pub fn custom(f: impl Fn(&CostBreakdown) -> f64 + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    fn combine(&self, parts: &CostBreakdown) -> f64 {
        match self {
            Self::Sum => parts.intensity + parts.adjustment + parts.duration,
            Self::Max => parts.intensity.max(parts.adjustment).max(parts.duration),
            Self::Custom(f) => f(parts),
        }
    }
}

impl fmt::Debug for CostCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum => f.write_str("Sum"),
            Self::Max => f.write_str("Max"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Per-component cost of one allocation. Disabled components are zero.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostBreakdown {
    pub intensity: f64,
    pub adjustment: f64,
    pub duration: f64,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_allocation() -> f64 {
    DEFAULT_ALLOCATION
}

fn default_intensity_cost() -> TransferFn {
    TransferFn::exponential()
}

/// Declarative description of one control signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSignalSpec {
    /// Graph parameter driven by this signal.
    pub target: ParameterId,
    #[serde(default)]
    pub samples: SampleSpec,
    #[serde(default = "default_allocation")]
    pub default_allocation: f64,
    #[serde(default)]
    pub cost_options: CostOptions,
    #[serde(default)]
    pub intensity_fn: TransferFn,
    #[serde(default = "default_intensity_cost")]
    pub intensity_cost_fn: TransferFn,
    #[serde(default)]
    pub adjustment_cost_fn: TransferFn,
    #[serde(default)]
    pub duration_cost_fn: DurationFn,
    #[serde(default)]
    pub cost_combination: CostCombination,
}

impl ControlSignalSpec {
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: ParameterId::new(target),
            samples: SampleSpec::default(),
            default_allocation: DEFAULT_ALLOCATION,
            cost_options: CostOptions::default(),
            intensity_fn: TransferFn::Identity,
            intensity_cost_fn: default_intensity_cost(),
            adjustment_cost_fn: TransferFn::Identity,
            duration_cost_fn: DurationFn::Accumulate,
            cost_combination: CostCombination::Sum,
        }
    }

    #[must_use]
    pub fn with_samples(mut self, samples: Vec<f64>) -> Self {
        self.samples = SampleSpec::Values(samples);
        self
    }

    #[must_use]
    pub fn with_sample_range(mut self, start: f64, stop: f64, step: f64) -> Self {
        self.samples = SampleSpec::Range { start, stop, step };
        self
    }

    #[must_use]
    pub fn with_default_allocation(mut self, allocation: f64) -> Self {
        self.default_allocation = allocation;
        self
    }

    #[must_use]
    pub fn with_cost_options(mut self, options: CostOptions) -> Self {
        self.cost_options = options;
        self
    }

    #[must_use]
    pub fn with_intensity_fn(mut self, f: TransferFn) -> Self {
        self.intensity_fn = f;
        self
    }

    #[must_use]
    pub fn with_intensity_cost_fn(mut self, f: TransferFn) -> Self {
        self.intensity_cost_fn = f;
        self
    }

    #[must_use]
    pub fn with_adjustment_cost_fn(mut self, f: TransferFn) -> Self {
        self.adjustment_cost_fn = f;
        self
    }

    #[must_use]
    pub fn with_duration_cost_fn(mut self, f: DurationFn) -> Self {
        self.duration_cost_fn = f;
        self
    }

    #[must_use]
    pub fn with_cost_combination(mut self, combine: CostCombination) -> Self {
        self.cost_combination = combine;
        self
    }
}

// ---------------------------------------------------------------------------
// Control signal
// ---------------------------------------------------------------------------

/// Restorable runtime state of a control signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlSignalState {
    pub allocation: f64,
    pub intensity: f64,
    pub last_allocation: f64,
    pub last_intensity: f64,
    pub duration_state: f64,
}

/// Actuator translating an allocation into a parameter override and a cost.
#[derive(Debug, Clone)]
pub struct ControlSignal {
    target: ParameterId,
    samples: AllocationSamples,
    default_allocation: f64,
    cost_options: CostOptions,
    intensity_fn: TransferFn,
    intensity_cost_fn: TransferFn,
    adjustment_cost_fn: TransferFn,
    duration_cost_fn: DurationFn,
    combine: CostCombination,
    state: ControlSignalState,
}

impl ControlSignal {
    /// Build a signal from its spec. The default allocation is applied and
    /// committed so the first trial's adjustment cost is measured from it.
    pub fn from_spec(spec: &ControlSignalSpec) -> Result<Self, EvcError> {
        let samples = spec.samples.resolve().map_err(|e| {
            EvcError::config(format!("control signal '{}': {e}", spec.target))
        })?;
        if !spec.default_allocation.is_finite() || spec.default_allocation < 0.0 {
            return Err(EvcError::config(format!(
                "control signal '{}': default allocation {} is not a finite non-negative value",
                spec.target, spec.default_allocation
            )));
        }
        let intensity = spec.intensity_fn.eval(spec.default_allocation);
        if !intensity.is_finite() {
            return Err(EvcError::config(format!(
                "control signal '{}': intensity of the default allocation is not finite",
                spec.target
            )));
        }
        Ok(Self {
            target: spec.target.clone(),
            samples,
            default_allocation: spec.default_allocation,
            cost_options: spec.cost_options,
            intensity_fn: spec.intensity_fn.clone(),
            intensity_cost_fn: spec.intensity_cost_fn.clone(),
            adjustment_cost_fn: spec.adjustment_cost_fn.clone(),
            duration_cost_fn: spec.duration_cost_fn.clone(),
            combine: spec.cost_combination.clone(),
            state: ControlSignalState {
                allocation: spec.default_allocation,
                intensity,
                last_allocation: spec.default_allocation,
                last_intensity: intensity,
                duration_state: 0.0,
            },
        })
    }

    /// Set the current allocation and return its intensity. `last_*` state
    /// is left alone until [`ControlSignal::commit`].
    pub fn apply(&mut self, allocation: f64) -> f64 {
        self.state.allocation = allocation;
        self.state.intensity = self.intensity_fn.eval(allocation);
        self.state.intensity
    }

    /// Combined cost of `allocation` relative to the committed state,
    /// clamped to be non-negative.
    #[must_use]
    pub fn cost(&self, allocation: f64) -> f64 {
        let parts = self.cost_components(allocation);
        self.combine.combine(&parts).max(0.0)
    }

    /// Per-component cost of `allocation` relative to the committed state.
    #[must_use]
    pub fn cost_components(&self, allocation: f64) -> CostBreakdown {
        let i = self.intensity_fn.eval(allocation);
        let mut parts = CostBreakdown::default();
        if self.cost_options.contains(CostOptions::INTENSITY) {
            parts.intensity = self.intensity_cost_fn.eval(i);
        }
        if self.cost_options.contains(CostOptions::ADJUSTMENT) {
            parts.adjustment = self
                .adjustment_cost_fn
                .eval((i - self.state.last_intensity).abs());
        }
        if self.cost_options.contains(CostOptions::DURATION) {
            parts.duration = self
                .duration_cost_fn
                .next_state(self.state.duration_state, i);
        }
        parts
    }

    /// Make the most recent `apply` durable.
    pub fn commit(&mut self) {
        self.state.last_allocation = self.state.allocation;
        self.state.last_intensity = self.state.intensity;
        self.state.duration_state = self
            .duration_cost_fn
            .next_state(self.state.duration_state, self.state.intensity);
    }

    /// Enable or disable cost components.
    pub fn set_cost_enabled(&mut self, options: CostOptions, enabled: bool) {
        self.cost_options = if enabled {
            self.cost_options.union(options)
        } else {
            self.cost_options.difference(options)
        };
    }

    /// Replace the sample sequence. Callers owning a sample space must
    /// rebuild it.
    pub fn set_samples(&mut self, samples: AllocationSamples) {
        self.samples = samples;
    }

    #[must_use]
    pub fn state(&self) -> ControlSignalState {
        self.state
    }

    pub fn restore_state(&mut self, state: ControlSignalState) {
        self.state = state;
    }

    #[must_use]
    pub fn target(&self) -> &ParameterId {
        &self.target
    }

    #[must_use]
    pub fn samples(&self) -> &AllocationSamples {
        &self.samples
    }

    #[must_use]
    pub fn cost_options(&self) -> CostOptions {
        self.cost_options
    }

    #[must_use]
    pub fn default_allocation(&self) -> f64 {
        self.default_allocation
    }

    /// Allocation set by the most recent `apply`.
    #[must_use]
    pub fn allocation(&self) -> f64 {
        self.state.allocation
    }

    /// Intensity produced by the most recent `apply`.
    #[must_use]
    pub fn intensity(&self) -> f64 {
        self.state.intensity
    }

    #[must_use]
    pub fn last_allocation(&self) -> f64 {
        self.state.last_allocation
    }

    #[must_use]
    pub fn last_intensity(&self) -> f64 {
        self.state.last_intensity
    }

    #[must_use]
    pub fn duration_state(&self) -> f64 {
        self.state.duration_state
    }
}
