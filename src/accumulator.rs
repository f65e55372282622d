//! Sufficient statistics for one EM pass.
//!
//! Every accumulator is a plain sum, so statistics gathered from different
//! patterns (or on different worker threads) merge by addition in any order.
//! The M-step takes a [`Statistics`] by value and discards it.

use ndarray::{Array1, Array2, ArrayView1};

use crate::model::{GaussianMixture, TransitionMatrix};

/// Soft transition counts of one transition matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionAccumulator {
    occupancy: Array1<f64>,
    counts: Array2<f64>,
}

impl TransitionAccumulator {
    pub fn new(num_states: usize) -> Self {
        Self {
            occupancy: Array1::zeros(num_states),
            counts: Array2::zeros((num_states, num_states)),
        }
    }

    pub fn for_matrix(matrix: &TransitionMatrix) -> Self {
        Self::new(matrix.num_states())
    }

    #[inline]
    pub fn add_occupancy(&mut self, row: usize, value: f64) {
        self.occupancy[row] += value;
    }

    #[inline]
    pub fn add_count(&mut self, from: usize, to: usize, value: f64) {
        self.counts[[from, to]] += value;
    }

    /// Total occupancy of `row` over all frames and patterns.
    pub fn occupancy(&self, row: usize) -> f64 {
        self.occupancy[row]
    }

    pub fn counts(&self) -> &Array2<f64> {
        &self.counts
    }

    pub fn num_states(&self) -> usize {
        self.occupancy.len()
    }

    pub fn merge(&mut self, other: &Self) {
        self.add_scaled(other, 1.0);
    }

    pub fn add_scaled(&mut self, other: &Self, factor: f64) {
        self.occupancy.scaled_add(factor, &other.occupancy);
        self.counts.scaled_add(factor, &other.counts);
    }

    pub fn reset(&mut self) {
        self.occupancy.fill(0.0);
        self.counts.fill(0.0);
    }
}

/// Statistics of one Gaussian component.
///
/// Observations are accumulated as deviations from the component's prior
/// mean; the update adds the mean back.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentAccumulator {
    occupancy: f64,
    origin: Array1<f64>,
    sum: Array1<f64>,
    sum_sq: Array1<f64>,
}

impl ComponentAccumulator {
    pub fn new(origin: Array1<f64>) -> Self {
        let dim = origin.len();
        Self {
            occupancy: 0.0,
            origin,
            sum: Array1::zeros(dim),
            sum_sq: Array1::zeros(dim),
        }
    }

    /// Add `obs` with responsibility `weight`.
    #[inline]
    pub fn accumulate(&mut self, weight: f64, obs: ArrayView1<f64>) {
        self.occupancy += weight;
        for (((s, sq), &x), &m) in self
            .sum
            .iter_mut()
            .zip(self.sum_sq.iter_mut())
            .zip(obs.iter())
            .zip(self.origin.iter())
        {
            let d = x - m;
            *s += weight * d;
            *sq += weight * d * d;
        }
    }

    pub fn occupancy(&self) -> f64 {
        self.occupancy
    }

    /// Weighted mean of the accumulated observations; `None` without occupancy.
    pub fn mean(&self) -> Option<Array1<f64>> {
        if self.occupancy <= 0.0 {
            return None;
        }
        Some(&self.origin + &(&self.sum / self.occupancy))
    }

    /// Weighted variance about [`mean`](Self::mean); `None` without occupancy.
    pub fn variance(&self) -> Option<Array1<f64>> {
        if self.occupancy <= 0.0 {
            return None;
        }
        let shift = &self.sum / self.occupancy;
        Some(&self.sum_sq / self.occupancy - &shift * &shift)
    }

    /// Add `factor` times `other`, re-centring its sums on this origin.
    fn add_scaled(&mut self, other: &Self, factor: f64) {
        let occ = other.occupancy;
        self.occupancy += factor * occ;
        for k in 0..self.sum.len() {
            let delta = other.origin[k] - self.origin[k];
            let (s, sq) = (other.sum[k], other.sum_sq[k]);
            self.sum[k] += factor * (s + occ * delta);
            self.sum_sq[k] += factor * (sq + 2.0 * delta * s + occ * delta * delta);
        }
    }

    fn reset(&mut self) {
        self.occupancy = 0.0;
        self.sum.fill(0.0);
        self.sum_sq.fill(0.0);
    }
}

/// Statistics of every component of one mixture.
#[derive(Debug, Clone, PartialEq)]
pub struct MixtureAccumulator {
    components: Vec<ComponentAccumulator>,
}

impl MixtureAccumulator {
    pub fn for_mixture(mixture: &GaussianMixture) -> Self {
        Self {
            components: mixture
                .components()
                .iter()
                .map(|c| ComponentAccumulator::new(c.mean().clone()))
                .collect(),
        }
    }

    pub fn components(&self) -> &[ComponentAccumulator] {
        &self.components
    }

    #[inline]
    pub fn accumulate(&mut self, component: usize, weight: f64, obs: ArrayView1<f64>) {
        self.components[component].accumulate(weight, obs);
    }

    /// Occupancy summed over components.
    pub fn occupancy(&self) -> f64 {
        self.components.iter().map(ComponentAccumulator::occupancy).sum()
    }

    pub fn merge(&mut self, other: &Self) {
        self.add_scaled(other, 1.0);
    }

    pub fn add_scaled(&mut self, other: &Self, factor: f64) {
        for (mine, theirs) in self.components.iter_mut().zip(&other.components) {
            mine.add_scaled(theirs, factor);
        }
    }

    pub fn reset(&mut self) {
        self.components.iter_mut().for_each(ComponentAccumulator::reset);
    }
}

/// All statistics of one pass, indexed like the parameter pools they update.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    pub transitions: Vec<TransitionAccumulator>,
    pub mixtures: Vec<MixtureAccumulator>,
}

impl Statistics {
    /// Zeroed statistics shaped like the given pools.
    pub fn zeroed(transitions: &[TransitionMatrix], mixtures: &[GaussianMixture]) -> Self {
        Self {
            transitions: transitions.iter().map(TransitionAccumulator::for_matrix).collect(),
            mixtures: mixtures.iter().map(MixtureAccumulator::for_mixture).collect(),
        }
    }

    pub fn merge(&mut self, other: &Self) {
        for (mine, theirs) in self.transitions.iter_mut().zip(&other.transitions) {
            mine.merge(theirs);
        }
        for (mine, theirs) in self.mixtures.iter_mut().zip(&other.mixtures) {
            mine.merge(theirs);
        }
    }

    /// Add `factor` times the listed entries of `other`, then zero them in `other`.
    pub(crate) fn drain_scaled(
        &mut self,
        other: &mut Self,
        transitions: &[usize],
        mixtures: &[usize],
        factor: f64,
    ) {
        for &t in transitions {
            self.transitions[t].add_scaled(&other.transitions[t], factor);
            other.transitions[t].reset();
        }
        for &m in mixtures {
            self.mixtures[m].add_scaled(&other.mixtures[m], factor);
            other.mixtures[m].reset();
        }
    }
}

/// How often each physical model occurred in a pass and how much
/// occupation its emitting states collected.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyTally {
    occurrences: Vec<usize>,
    states: Vec<Vec<f64>>,
}

impl OccupancyTally {
    pub fn new(num_models: usize) -> Self {
        Self {
            occurrences: vec![0; num_models],
            states: vec![Vec::new(); num_models],
        }
    }

    /// Record one occurrence of `model` with per-state occupation `states`
    /// scaled by `factor`.
    pub fn add(&mut self, model: usize, states: &[f64], factor: f64) {
        self.occurrences[model] += 1;
        let totals = &mut self.states[model];
        if totals.len() < states.len() {
            totals.resize(states.len(), 0.0);
        }
        for (total, &s) in totals.iter_mut().zip(states) {
            *total += factor * s;
        }
    }

    pub fn occurrences(&self, model: usize) -> usize {
        self.occurrences[model]
    }

    pub fn state_occupancy(&self, model: usize) -> &[f64] {
        &self.states[model]
    }

    pub fn num_models(&self) -> usize {
        self.occurrences.len()
    }

    pub fn merge(&mut self, other: &Self) {
        for (model, (&n, states)) in other.occurrences.iter().zip(&other.states).enumerate() {
            self.occurrences[model] += n;
            let totals = &mut self.states[model];
            if totals.len() < states.len() {
                totals.resize(states.len(), 0.0);
            }
            for (total, &s) in totals.iter_mut().zip(states) {
                *total += s;
            }
        }
    }
}
