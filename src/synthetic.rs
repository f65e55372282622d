//! Sampling observation sequences from models.
//!
//! Used to build synthetic training data with a known generator, e.g. with a
//! seeded `ChaCha20Rng`.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand_distr::Normal;

use crate::error::{Error, Result};
use crate::model::{GaussianMixture, Hmm, HmmSet};
use crate::pattern::{Pattern, Utterance};
use ndarray::{Array1, Array2};

const MAX_ATTEMPTS: usize = 1000;

fn invalid(e: impl std::fmt::Display) -> Error {
    Error::InvalidInput(e.to_string())
}

/// Draw one observation from `mixture`.
pub fn sample_observation<R: Rng>(mixture: &GaussianMixture, rng: &mut R) -> Result<Array1<f64>> {
    let weights = WeightedIndex::new(mixture.components().iter().map(|c| c.weight()))
        .map_err(invalid)?;
    let component = &mixture.components()[weights.sample(rng)];
    component
        .mean()
        .iter()
        .zip(component.variance())
        .map(|(&m, &v)| Ok(Normal::new(m, v.sqrt()).map_err(invalid)?.sample(rng)))
        .collect()
}

/// Walk `hmm` from entry to exit and emit one observation per emitting state visited.
///
/// Walks longer than `max_frames`, or that emit nothing, are rejected and
/// redrawn.
///
/// # Errors
///
/// `InvalidInput` when no acceptable walk turns up.
pub fn sample_pattern<R: Rng>(hmm: &Hmm, max_frames: usize, rng: &mut R) -> Result<Pattern> {
    let a = hmm.transitions();
    let exit = a.exit();
    let rows = (0..exit)
        .map(|i| WeightedIndex::new(a.prob().row(i).iter().copied()).map_err(invalid))
        .collect::<Result<Vec<_>>>()?;

    for _ in 0..MAX_ATTEMPTS {
        let mut states = Vec::new();
        let mut state = rows[0].sample(rng);
        while state != exit && states.len() <= max_frames {
            states.push(state);
            state = rows[state].sample(rng);
        }
        if states.is_empty() || states.len() > max_frames {
            continue;
        }
        let mut frames = Array2::zeros((states.len(), hmm.dim()));
        for (t, &s) in states.iter().enumerate() {
            frames.row_mut(t).assign(&sample_observation(hmm.mixture(s), rng)?);
        }
        return Ok(Pattern::new(frames));
    }
    Err(Error::InvalidInput(format!(
        "model '{}' produced no walk of 1..={} frames",
        hmm.name(),
        max_frames
    )))
}

/// Sample an utterance for the model sequence `labels`.
pub fn sample_utterance<R: Rng, S: AsRef<str>>(
    set: &HmmSet,
    id: impl Into<String>,
    labels: &[S],
    max_frames: usize,
    rng: &mut R,
) -> Result<Utterance> {
    let models = set.resolve(labels)?;
    let flat = set.concatenate(&models)?;
    let pattern = sample_pattern(&flat, max_frames, rng)?;
    Ok(Utterance::new(id, pattern, models))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_sample_pattern_follows_model() {
        let hmm = Hmm::left_to_right("m", &[array![0.0], array![50.0]], 0.5).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        for _ in 0..20 {
            let pattern = sample_pattern(&hmm, 40, &mut rng).unwrap();
            assert!(pattern.len() >= 2 && pattern.len() <= 40);
            // left to right: low values first, then high ones
            let values: Vec<f64> = pattern.frames().column(0).to_vec();
            let switch = values.iter().position(|&v| v > 25.0).unwrap();
            assert!(switch >= 1);
            assert!(values[switch..].iter().all(|&v| v > 25.0));
        }
    }

    #[test]
    fn test_seeded_sampling_is_repeatable() {
        let hmm = Hmm::left_to_right("m", &[array![0.0, 1.0]], 0.7).unwrap();
        let a = sample_pattern(&hmm, 30, &mut ChaCha20Rng::seed_from_u64(1)).unwrap();
        let b = sample_pattern(&hmm, 30, &mut ChaCha20Rng::seed_from_u64(1)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dim(), 2);
    }
}
