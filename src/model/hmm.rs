use ndarray::Array1;

use crate::error::{Error, Result};
use crate::model::{GaussianMixture, TransitionMatrix};

/// A continuous-density HMM that owns its parameters.
///
/// States `0` and `N-1` are non-emitting; emitting state `j` (`1..=N-2`)
/// uses `mixtures[j - 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Hmm {
    name: String,
    transitions: TransitionMatrix,
    mixtures: Vec<GaussianMixture>,
}

impl Hmm {
    /// # Errors
    ///
    /// `InvalidInput` if the number of mixtures does not match the emitting
    /// states or the mixtures disagree on feature dimension.
    pub fn new(
        name: impl Into<String>,
        transitions: TransitionMatrix,
        mixtures: Vec<GaussianMixture>,
    ) -> Result<Self> {
        let name = name.into();
        if mixtures.len() != transitions.num_emitting() {
            return Err(Error::InvalidInput(format!(
                "model '{}' has {} emitting states but {} mixtures",
                name,
                transitions.num_emitting(),
                mixtures.len()
            )));
        }
        let dim = mixtures[0].dim();
        if mixtures.iter().any(|m| m.dim() != dim) {
            return Err(Error::InvalidInput(format!(
                "model '{}' mixes feature dimensions",
                name
            )));
        }
        Ok(Self {
            name,
            transitions,
            mixtures,
        })
    }

    /// Left-to-right model with one unit-variance Gaussian per state at `means[j]`.
    pub fn left_to_right(
        name: impl Into<String>,
        means: &[Array1<f64>],
        self_loop: f64,
    ) -> Result<Self> {
        let transitions = TransitionMatrix::left_to_right(means.len(), self_loop)?;
        let mixtures = means
            .iter()
            .map(|m| GaussianMixture::single(m.clone(), Array1::ones(m.len())))
            .collect::<Result<Vec<_>>>()?;
        Self::new(name, transitions, mixtures)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_states(&self) -> usize {
        self.transitions.num_states()
    }

    pub fn dim(&self) -> usize {
        self.mixtures[0].dim()
    }

    pub fn transitions(&self) -> &TransitionMatrix {
        &self.transitions
    }

    pub fn mixtures(&self) -> &[GaussianMixture] {
        &self.mixtures
    }

    /// Mixture of emitting state `state` (`1..=N-2`).
    pub fn mixture(&self, state: usize) -> &GaussianMixture {
        &self.mixtures[state - 1]
    }

    pub(crate) fn into_parts(self) -> (String, TransitionMatrix, Vec<GaussianMixture>) {
        (self.name, self.transitions, self.mixtures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_mixture_count_must_match() {
        let t = TransitionMatrix::left_to_right(2, 0.5).unwrap();
        let m = GaussianMixture::single(array![0.0], array![1.0]).unwrap();
        assert!(Hmm::new("a", t.clone(), vec![m.clone()]).is_err());
        let hmm = Hmm::new("a", t, vec![m.clone(), m]).unwrap();
        assert_eq!(hmm.num_states(), 4);
        assert_eq!(hmm.dim(), 1);
        assert_eq!(hmm.mixture(2).dim(), 1);
    }

    #[test]
    fn test_dimension_mismatch() {
        let t = TransitionMatrix::left_to_right(2, 0.5).unwrap();
        let a = GaussianMixture::single(array![0.0], array![1.0]).unwrap();
        let b = GaussianMixture::single(array![0.0, 1.0], array![1.0, 1.0]).unwrap();
        assert!(Hmm::new("a", t, vec![a, b]).is_err());
    }
}
