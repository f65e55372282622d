use ndarray::Array2;

use crate::error::{Error, Result};
use crate::log_math::{safe_ln, LOG_ZERO};

/// Tolerance on row sums of a supplied transition matrix.
const ROW_SUM_TOLERANCE: f64 = 1e-4;

/// An `N x N` transition matrix with non-emitting entry (`0`) and exit (`N-1`) states.
///
/// Stored in both the natural and the log domain. Structural rules:
/// - the entry row sums to one and has no self-loop,
/// - every emitting row sums to one,
/// - no state transitions back into the entry,
/// - the exit row is all zero,
/// - the exit receives only from emitting states, or from the entry for a tee model.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionMatrix {
    prob: Array2<f64>,
    log_prob: Array2<f64>,
}

impl TransitionMatrix {
    /// Validate a natural-domain matrix and derive its log form.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when the matrix is not square, has fewer than three
    /// states, or breaks any of the structural rules.
    pub fn new(prob: Array2<f64>) -> Result<Self> {
        let (rows, cols) = prob.dim();
        if rows != cols {
            return Err(Error::InvalidInput(format!(
                "transition matrix must be square, got {}x{}",
                rows, cols
            )));
        }
        if rows < 3 {
            return Err(Error::InvalidInput(format!(
                "HMM needs at least one emitting state, got {} states",
                rows
            )));
        }
        if prob.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(Error::InvalidInput(
                "transition probabilities must be finite and non-negative".to_string(),
            ));
        }
        let n = rows;
        let exit = n - 1;
        for i in 0..n {
            if prob[[i, 0]] > 0.0 {
                return Err(Error::InvalidInput(format!(
                    "state {} transitions into the entry state",
                    i
                )));
            }
        }
        if prob.row(exit).iter().any(|&p| p > 0.0) {
            return Err(Error::InvalidInput(
                "exit state must not have outgoing transitions".to_string(),
            ));
        }
        for i in 0..exit {
            let sum: f64 = prob.row(i).sum();
            if (sum - 1.0).abs() > ROW_SUM_TOLERANCE {
                return Err(Error::InvalidInput(format!(
                    "transition row {} sums to {}, expected 1",
                    i, sum
                )));
            }
        }
        Ok(Self::from_normalized(prob))
    }

    /// Skips validation; callers guarantee the structural rules.
    pub(crate) fn from_normalized(prob: Array2<f64>) -> Self {
        let log_prob = prob.mapv(safe_ln);
        Self { prob, log_prob }
    }

    /// A left-to-right matrix with `emitting` states, each looping with `self_loop`.
    ///
    /// The entry feeds the first emitting state; the last one feeds the exit.
    pub fn left_to_right(emitting: usize, self_loop: f64) -> Result<Self> {
        if emitting == 0 {
            return Err(Error::InvalidInput(
                "left-to-right model needs at least one emitting state".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self_loop) {
            return Err(Error::InvalidInput(format!(
                "self-loop probability {} must be in [0, 1)",
                self_loop
            )));
        }
        let n = emitting + 2;
        let mut prob = Array2::zeros((n, n));
        prob[[0, 1]] = 1.0;
        for i in 1..=emitting {
            prob[[i, i]] = self_loop;
            prob[[i, i + 1]] = 1.0 - self_loop;
        }
        Self::new(prob)
    }

    pub fn num_states(&self) -> usize {
        self.prob.nrows()
    }

    pub fn num_emitting(&self) -> usize {
        self.num_states() - 2
    }

    pub fn exit(&self) -> usize {
        self.num_states() - 1
    }

    pub fn prob(&self) -> &Array2<f64> {
        &self.prob
    }

    pub fn log_prob(&self) -> &Array2<f64> {
        &self.log_prob
    }

    #[inline]
    pub fn log(&self, from: usize, to: usize) -> f64 {
        self.log_prob[[from, to]]
    }

    /// True when the entry connects directly to the exit.
    pub fn is_tee(&self) -> bool {
        self.prob[[0, self.exit()]] > 0.0
    }

    /// Log probability of the entry-to-exit skip, `LOG_ZERO` for ordinary models.
    pub fn tee_log(&self) -> f64 {
        self.log(0, self.exit())
    }

    /// Minimum number of frames needed to pass from entry to exit.
    ///
    /// Zero for tee models. Returns `None` if the exit is unreachable.
    pub fn min_duration(&self) -> Option<usize> {
        let n = self.num_states();
        let exit = self.exit();
        let mut best: Vec<Option<usize>> = vec![None; n];
        best[0] = Some(0);
        // Edges only go forward in cost, so n relaxation sweeps settle every state.
        for _ in 0..n {
            let mut changed = false;
            for i in 0..exit {
                let Some(cost) = best[i] else { continue };
                for j in 1..n {
                    if self.prob[[i, j]] <= 0.0 {
                        continue;
                    }
                    let step = if j == exit { cost } else { cost + 1 };
                    if best[j].map_or(true, |b| step < b) {
                        best[j] = Some(step);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        best[exit]
    }
}

impl Default for TransitionMatrix {
    /// Single emitting state with an even self-loop.
    fn default() -> Self {
        let mut prob = Array2::zeros((3, 3));
        prob[[0, 1]] = 1.0;
        prob[[1, 1]] = 0.5;
        prob[[1, 2]] = 0.5;
        Self::from_normalized(prob)
    }
}

/// `LOG_ZERO` check used when walking sparse rows.
#[inline]
pub(crate) fn is_transition(log_a: f64) -> bool {
    log_a > LOG_ZERO
}
