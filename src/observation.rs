//! Per-frame output probabilities with a one-frame memo per mixture.
//!
//! Tied mixtures are queried once for every state that uses them, so each
//! mixture slot remembers the last frame it was evaluated at, together with
//! the per-component terms needed for Gaussian statistics.

use ndarray::ArrayView1;

use crate::model::GaussianMixture;

#[derive(Debug, Clone, Default)]
struct Slot {
    frame: Option<usize>,
    total: f64,
    terms: Vec<f64>,
}

/// Memo of the most recent output probability of every mixture in a pool.
///
/// Frame indices restart with every pattern, so call [`reset`](Self::reset)
/// before evaluating a new one.
#[derive(Debug, Clone, Default)]
pub struct ObservationCache {
    slots: Vec<Slot>,
    hits: usize,
    misses: usize,
}

impl ObservationCache {
    pub fn new(num_mixtures: usize) -> Self {
        Self {
            slots: vec![Slot::default(); num_mixtures],
            hits: 0,
            misses: 0,
        }
    }

    /// Forget every memoised frame; sizes the cache for `num_mixtures`.
    pub fn reset(&mut self, num_mixtures: usize) {
        self.slots.resize_with(num_mixtures, Slot::default);
        for slot in &mut self.slots {
            slot.frame = None;
        }
    }

    fn ensure(
        &mut self,
        mixtures: &[GaussianMixture],
        id: usize,
        frame: usize,
        obs: ArrayView1<f64>,
    ) {
        let slot = &mut self.slots[id];
        if slot.frame == Some(frame) {
            self.hits += 1;
            return;
        }
        self.misses += 1;
        slot.total = mixtures[id].component_terms(obs, &mut slot.terms);
        slot.frame = Some(frame);
    }

    /// Log output probability of mixture `id` for `obs`, the frame at index `frame`.
    pub fn log_output(
        &mut self,
        mixtures: &[GaussianMixture],
        id: usize,
        frame: usize,
        obs: ArrayView1<f64>,
    ) -> f64 {
        self.ensure(mixtures, id, frame, obs);
        self.slots[id].total
    }

    /// Weighted log terms of each component of mixture `id` at `frame`.
    pub fn component_terms(
        &mut self,
        mixtures: &[GaussianMixture],
        id: usize,
        frame: usize,
        obs: ArrayView1<f64>,
    ) -> (f64, &[f64]) {
        self.ensure(mixtures, id, frame, obs);
        let slot = &self.slots[id];
        (slot.total, &slot.terms)
    }

    /// Lookups answered from the memo.
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Lookups that evaluated the mixture.
    pub fn misses(&self) -> usize {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_repeated_frame_is_memoised() {
        let mixtures = vec![GaussianMixture::single(array![0.0], array![1.0]).unwrap()];
        let mut cache = ObservationCache::new(1);
        let obs = array![0.5];
        let first = cache.log_output(&mixtures, 0, 3, obs.view());
        let second = cache.log_output(&mixtures, 0, 3, obs.view());
        assert_eq!(first, second);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 1);
        assert_relative_eq!(first, mixtures[0].log_likelihood(obs.view()), epsilon = 1e-12);
    }

    #[test]
    fn test_new_frame_and_reset_recompute() {
        let mixtures = vec![GaussianMixture::single(array![0.0], array![1.0]).unwrap()];
        let mut cache = ObservationCache::new(1);
        let a = cache.log_output(&mixtures, 0, 0, array![0.0].view());
        let b = cache.log_output(&mixtures, 0, 1, array![2.0].view());
        assert!(a > b);
        cache.reset(1);
        let c = cache.log_output(&mixtures, 0, 1, array![0.0].view());
        assert_eq!(a, c);
        assert_eq!(cache.misses(), 3);
    }

    #[test]
    fn test_component_terms() {
        let mixtures = vec![GaussianMixture::new(vec![
            crate::model::Gaussian::new(array![0.0], array![1.0], 0.5).unwrap(),
            crate::model::Gaussian::new(array![1.0], array![1.0], 0.5).unwrap(),
        ])
        .unwrap()];
        let mut cache = ObservationCache::new(1);
        let (total, terms) = cache.component_terms(&mixtures, 0, 0, array![0.5].view());
        assert_eq!(terms.len(), 2);
        assert_relative_eq!(terms[0], terms[1], epsilon = 1e-12);
        assert_relative_eq!(total, terms[0] + 2f64.ln(), epsilon = 1e-12);
    }
}
