//! Forward-backward for a single HMM.
//!
//! All quantities are log probabilities held in a [`Trellis`], a scratch
//! arena sized once for the longest pattern of a training run. Entry and exit
//! states are non-emitting, so a pattern of `T` frames occupies emitting
//! states only; `alpha[exit][T-1]` and `beta[entry][0]` hold the totals.

use ndarray::{s, Array2, ArrayView2};

use crate::accumulator::Statistics;
use crate::error::{Error, Result};
use crate::log_math::{clamp_log, is_negligible, log_add, safe_exp, LOG_ZERO};
use crate::model::transition::is_transition;
use crate::model::Hmm;
use crate::observation::ObservationCache;
use crate::pattern::Pattern;

/// Reusable alpha/beta/output tables for one model topology.
#[derive(Debug, Clone)]
pub struct Trellis {
    num_states: usize,
    capacity: usize,
    alpha: Array2<f64>,
    beta: Array2<f64>,
    /// `out[[j, t]]`: log output probability of emitting state `j` at frame `t`.
    out: Array2<f64>,
    cache: ObservationCache,
}

impl Trellis {
    /// Tables for `num_states` states and at most `max_frames` frames.
    pub fn new(num_states: usize, max_frames: usize) -> Self {
        Self {
            num_states,
            capacity: max_frames,
            alpha: Array2::from_elem((num_states, max_frames), LOG_ZERO),
            beta: Array2::from_elem((num_states, max_frames), LOG_ZERO),
            out: Array2::from_elem((num_states, max_frames), LOG_ZERO),
            cache: ObservationCache::new(num_states.saturating_sub(2)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    /// Alpha for the first `frames` frames, `states x frames`.
    pub fn alpha(&self, frames: usize) -> ArrayView2<'_, f64> {
        self.alpha.slice(s![.., ..frames])
    }

    /// Beta for the first `frames` frames, `states x frames`.
    pub fn beta(&self, frames: usize) -> ArrayView2<'_, f64> {
        self.beta.slice(s![.., ..frames])
    }

    fn check(&self, hmm: &Hmm, pattern: &Pattern) -> Result<()> {
        if hmm.num_states() != self.num_states {
            return Err(Error::InvalidInput(format!(
                "trellis is shaped for {} states, model '{}' has {}",
                self.num_states,
                hmm.name(),
                hmm.num_states()
            )));
        }
        if pattern.len() > self.capacity {
            return Err(Error::BufferTooSmall {
                what: "frames",
                capacity: self.capacity,
                required: pattern.len(),
            });
        }
        if pattern.is_empty() {
            return Err(Error::InvalidInput("pattern has no frames".to_string()));
        }
        if pattern.dim() != hmm.dim() {
            return Err(Error::InvalidInput(format!(
                "pattern dimension {} does not match model '{}' dimension {}",
                pattern.dim(),
                hmm.name(),
                hmm.dim()
            )));
        }
        Ok(())
    }

    /// Fill the output table for every emitting state and frame.
    pub fn compute_outputs(&mut self, hmm: &Hmm, pattern: &Pattern) -> Result<()> {
        self.check(hmm, pattern)?;
        let exit = self.num_states - 1;
        self.cache.reset(exit - 1);
        for t in 0..pattern.len() {
            let obs = pattern.frame(t);
            for j in 1..exit {
                self.out[[j, t]] = self.cache.log_output(hmm.mixtures(), j - 1, t, obs);
            }
        }
        Ok(())
    }

    /// Alpha recursion; returns the total forward log probability.
    ///
    /// Requires [`compute_outputs`](Self::compute_outputs) for the same pattern.
    pub fn forward(&mut self, hmm: &Hmm, frames: usize) -> f64 {
        let a = hmm.transitions();
        let n = self.num_states;
        let exit = n - 1;
        let last = frames - 1;

        self.alpha.slice_mut(s![.., ..frames]).fill(LOG_ZERO);
        self.alpha[[0, 0]] = 0.0;
        for j in 1..exit {
            let a0j = a.log(0, j);
            if is_transition(a0j) {
                self.alpha[[j, 0]] = clamp_log(a0j + self.out[[j, 0]]);
            }
        }

        for t in 1..frames {
            for j in 1..exit {
                let mut x = LOG_ZERO;
                for i in 1..exit {
                    let prev = self.alpha[[i, t - 1]];
                    let aij = a.log(i, j);
                    if is_negligible(prev) || !is_transition(aij) {
                        continue;
                    }
                    x = log_add(x, prev + aij);
                }
                if !is_negligible(x) {
                    self.alpha[[j, t]] = clamp_log(x + self.out[[j, t]]);
                }
            }
        }

        let mut total = LOG_ZERO;
        for i in 1..exit {
            let ai = self.alpha[[i, last]];
            let aie = a.log(i, exit);
            if !is_negligible(ai) && is_transition(aie) {
                total = log_add(total, ai + aie);
            }
        }
        self.alpha[[exit, last]] = total;
        total
    }

    /// Beta recursion; returns the total backward log probability.
    ///
    /// Requires [`compute_outputs`](Self::compute_outputs) for the same pattern.
    pub fn backward(&mut self, hmm: &Hmm, frames: usize) -> f64 {
        let a = hmm.transitions();
        let n = self.num_states;
        let exit = n - 1;
        let last = frames - 1;

        self.beta.slice_mut(s![.., ..frames]).fill(LOG_ZERO);
        self.beta[[exit, last]] = 0.0;
        for i in 1..exit {
            self.beta[[i, last]] = a.log(i, exit);
        }

        for t in (0..last).rev() {
            for i in 1..exit {
                let mut x = LOG_ZERO;
                for j in 1..exit {
                    let aij = a.log(i, j);
                    let next = self.beta[[j, t + 1]];
                    if !is_transition(aij) || is_negligible(next) {
                        continue;
                    }
                    x = log_add(x, aij + self.out[[j, t + 1]] + next);
                }
                self.beta[[i, t]] = clamp_log(x);
            }
        }

        let mut total = LOG_ZERO;
        for j in 1..exit {
            let a0j = a.log(0, j);
            let b = self.beta[[j, 0]];
            if is_transition(a0j) && !is_negligible(b) {
                total = log_add(total, a0j + self.out[[j, 0]] + b);
            }
        }
        self.beta[[0, 0]] = clamp_log(total);
        self.beta[[0, 0]]
    }

    /// Add the pattern's expected statistics, normalised by `pr`.
    ///
    /// `stats` must be shaped like `hmm` (one transition accumulator, one
    /// mixture accumulator per emitting state). When `occupation` is given,
    /// state occupation is written into it, `frames x emitting states`.
    pub fn accumulate(
        &mut self,
        hmm: &Hmm,
        pattern: &Pattern,
        pr: f64,
        stats: &mut Statistics,
        mut occupation: Option<&mut Array2<f64>>,
    ) {
        let a = hmm.transitions();
        let exit = self.num_states - 1;
        let frames = pattern.len();
        let last = frames - 1;
        let Statistics {
            transitions,
            mixtures,
        } = stats;
        let trans = &mut transitions[0];

        trans.add_occupancy(0, safe_exp(self.beta[[0, 0]] - pr));
        for j in 1..exit {
            let a0j = a.log(0, j);
            if is_transition(a0j) && !is_negligible(self.beta[[j, 0]]) {
                trans.add_count(0, j, safe_exp(a0j + self.out[[j, 0]] + self.beta[[j, 0]] - pr));
            }
        }

        for t in 0..frames {
            let obs = pattern.frame(t);
            for i in 1..exit {
                let alpha = self.alpha[[i, t]];
                let beta = self.beta[[i, t]];
                if is_negligible(alpha) || is_negligible(beta) {
                    continue;
                }
                let log_gamma = alpha + beta - pr;
                let gamma = safe_exp(log_gamma);
                if gamma <= 0.0 {
                    continue;
                }
                trans.add_occupancy(i, gamma);
                if let Some(occ) = occupation.as_deref_mut() {
                    occ[[t, i - 1]] = gamma;
                }

                if t < last {
                    for j in 1..exit {
                        let aij = a.log(i, j);
                        let next = self.beta[[j, t + 1]];
                        if !is_transition(aij) || is_negligible(next) {
                            continue;
                        }
                        let x = alpha + aij + self.out[[j, t + 1]] + next - pr;
                        trans.add_count(i, j, safe_exp(x));
                    }
                } else {
                    let aie = a.log(i, exit);
                    if is_transition(aie) {
                        trans.add_count(i, exit, safe_exp(alpha + aie - pr));
                    }
                }

                let (total, terms) = self.cache.component_terms(hmm.mixtures(), i - 1, t, obs);
                let acc = &mut mixtures[i - 1];
                if terms.len() == 1 {
                    acc.accumulate(0, gamma, obs);
                    continue;
                }
                for (m, &term) in terms.iter().enumerate() {
                    let weight = safe_exp(log_gamma + term - total);
                    if weight > 0.0 {
                        acc.accumulate(m, weight, obs);
                    }
                }
            }
        }
    }
}

/// Forward and backward totals of one pattern.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Totals {
    pub forward: f64,
    pub backward: f64,
    pub frames: usize,
}

impl Totals {
    /// Average of the two totals, used as the pattern's probability.
    pub fn log_prob(&self) -> f64 {
        0.5 * (self.forward + self.backward)
    }

    pub fn is_negligible(&self) -> bool {
        is_negligible(self.forward) || is_negligible(self.backward)
    }

    /// Fail with `Error::Consistency` when the totals drift apart by more than
    /// `tolerance` per frame.
    pub fn check<F>(&self, tolerance: f64, context: F) -> Result<()>
    where
        F: FnOnce() -> String,
    {
        if is_negligible(self.forward) && is_negligible(self.backward) {
            return Ok(());
        }
        let gap = (self.forward - self.backward).abs() / self.frames.max(1) as f64;
        if gap > tolerance {
            return Err(Error::Consistency {
                context: context(),
                forward: self.forward,
                backward: self.backward,
                frames: self.frames,
            });
        }
        Ok(())
    }
}

/// Run outputs, alpha and beta for `pattern` and cross-check the totals.
pub fn forward_backward(
    hmm: &Hmm,
    pattern: &Pattern,
    trellis: &mut Trellis,
    tolerance: f64,
) -> Result<Totals> {
    trellis.compute_outputs(hmm, pattern)?;
    let frames = pattern.len();
    let totals = Totals {
        forward: trellis.forward(hmm, frames),
        backward: trellis.backward(hmm, frames),
        frames,
    };
    totals.check(tolerance, || format!("model '{}'", hmm.name()))?;
    Ok(totals)
}

/// Total log probability of `pattern` under `hmm`, using a throwaway trellis.
pub fn log_probability(hmm: &Hmm, pattern: &Pattern) -> Result<f64> {
    let mut trellis = Trellis::new(hmm.num_states(), pattern.len());
    trellis.compute_outputs(hmm, pattern)?;
    Ok(trellis.forward(hmm, pattern.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GaussianMixture, TransitionMatrix};
    use approx::assert_relative_eq;
    use ndarray::{array, Array1};

    fn two_state_model() -> Hmm {
        let t = TransitionMatrix::new(array![
            [0.0, 0.8, 0.2, 0.0],
            [0.0, 0.6, 0.3, 0.1],
            [0.0, 0.0, 0.7, 0.3],
            [0.0, 0.0, 0.0, 0.0]
        ])
        .unwrap();
        let mixtures = vec![
            GaussianMixture::single(array![0.0], array![1.0]).unwrap(),
            GaussianMixture::single(array![2.0], array![0.5]).unwrap(),
        ];
        Hmm::new("m", t, mixtures).unwrap()
    }

    /// Sum over every state path, in the natural domain.
    fn brute_force(hmm: &Hmm, pattern: &Pattern) -> f64 {
        let a = hmm.transitions().prob();
        let exit = hmm.num_states() - 1;
        let emitting: Vec<usize> = (1..exit).collect();
        let frames = pattern.len();
        let mut total = 0.0;
        let mut path = vec![0usize; frames];
        let combos = emitting.len().pow(frames as u32);
        for code in 0..combos {
            let mut c = code;
            for slot in path.iter_mut() {
                *slot = emitting[c % emitting.len()];
                c /= emitting.len();
            }
            let mut p = a[[0, path[0]]];
            for t in 0..frames {
                if t > 0 {
                    p *= a[[path[t - 1], path[t]]];
                }
                p *= hmm.mixture(path[t]).log_likelihood(pattern.frame(t)).exp();
            }
            p *= a[[path[frames - 1], exit]];
            total += p;
        }
        total.ln()
    }

    fn pattern(values: &[f64]) -> Pattern {
        Pattern::new(Array1::from_vec(values.to_vec()).insert_axis(ndarray::Axis(1)))
    }

    #[test]
    fn test_forward_matches_brute_force() {
        let hmm = two_state_model();
        let p = pattern(&[0.1, -0.3, 1.8, 2.2, 1.9]);
        let expected = brute_force(&hmm, &p);
        assert_relative_eq!(log_probability(&hmm, &p).unwrap(), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_forward_and_backward_agree() {
        let hmm = two_state_model();
        let p = pattern(&[0.3, 0.2, 2.5, 1.0, 2.1, 2.0]);
        let mut trellis = Trellis::new(hmm.num_states(), 10);
        let totals = forward_backward(&hmm, &p, &mut trellis, 1e-3).unwrap();
        assert_relative_eq!(totals.forward, totals.backward, epsilon = 1e-9);
        assert_relative_eq!(totals.log_prob(), totals.forward, epsilon = 1e-9);
    }

    #[test]
    fn test_single_frame_pattern() {
        let hmm = two_state_model();
        let p = pattern(&[1.0]);
        let b1 = hmm.mixture(1).log_likelihood(p.frame(0)).exp();
        let b2 = hmm.mixture(2).log_likelihood(p.frame(0)).exp();
        let expected = (0.8 * 0.1 * b1 + 0.2 * 0.3 * b2).ln();
        let mut trellis = Trellis::new(hmm.num_states(), 1);
        let totals = forward_backward(&hmm, &p, &mut trellis, 1e-3).unwrap();
        assert_relative_eq!(totals.forward, expected, epsilon = 1e-9);
        assert_relative_eq!(totals.backward, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_occupancy_sums_to_one_per_frame() {
        let hmm = two_state_model();
        let p = pattern(&[0.0, 0.4, 1.7, 2.3]);
        let mut trellis = Trellis::new(hmm.num_states(), 4);
        let totals = forward_backward(&hmm, &p, &mut trellis, 1e-3).unwrap();
        let mut stats = Statistics::zeroed(&[hmm.transitions().clone()], hmm.mixtures());
        let mut gamma = Array2::zeros((4, 2));
        trellis.accumulate(&hmm, &p, totals.log_prob(), &mut stats, Some(&mut gamma));

        for t in 0..4 {
            assert_relative_eq!(gamma.row(t).sum(), 1.0, epsilon = 1e-9);
        }
        let trans = &stats.transitions[0];
        assert_relative_eq!(trans.occupancy(0), 1.0, epsilon = 1e-9);
        for i in 0..3 {
            assert_relative_eq!(
                trans.counts().row(i).sum(),
                trans.occupancy(i),
                epsilon = 1e-9
            );
        }
        let mixture_total: f64 = stats.mixtures.iter().map(|m| m.occupancy()).sum();
        assert_relative_eq!(mixture_total, 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_buffer_limits() {
        let hmm = two_state_model();
        let p = pattern(&[0.0, 1.0, 2.0]);
        let mut small = Trellis::new(hmm.num_states(), 2);
        assert!(matches!(
            forward_backward(&hmm, &p, &mut small, 1e-3),
            Err(Error::BufferTooSmall { what: "frames", .. })
        ));
        // a larger trellis of another shape is a mismatch, not a capacity problem
        for states in [3, 5] {
            let mut wrong = Trellis::new(states, 10);
            assert!(matches!(
                forward_backward(&hmm, &p, &mut wrong, 1e-3),
                Err(Error::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn test_consistency_check() {
        let totals = Totals {
            forward: -100.0,
            backward: -90.0,
            frames: 5,
        };
        assert!(matches!(
            totals.check(1e-3, || "x".to_string()),
            Err(Error::Consistency { .. })
        ));
        let close = Totals {
            forward: -100.0,
            backward: -100.001,
            frames: 5,
        };
        assert!(close.check(1e-3, || "x".to_string()).is_ok());
    }
}
